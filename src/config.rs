use secrecy::SecretString;
use serde::Deserialize;

pub mod defaults {
    pub const DB_PATH: &str = "courier.db";
    pub const BIND_ADDR: &str = "127.0.0.1:8080";
    pub const WORKER_CONCURRENCY: usize = 5;
    pub const POLL_INTERVAL_MS: u64 = 250;
    pub const STALE_RESERVATION_SECS: u64 = 60;
    pub const SMTP_PORT: u16 = 25;
    pub const SMTP_FROM: &str = "courier@localhost";
    pub const EMAIL_SUBJECT: &str = "Message Notification";
}

#[derive(Clone, Deserialize, Default)]
pub struct Config {
    pub db_path: Option<String>,
    pub bind_addr: Option<String>,

    pub worker_concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub stale_reservation_secs: Option<u64>,

    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<SecretString>,
    pub smtp_starttls: Option<bool>,
    pub smtp_from: Option<String>,

    /// Comma-separated list of addresses alerted when a message is
    /// dead-lettered. No alerts are sent when unset.
    pub alert_recipients: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("COURIER_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::DB_PATH)
    }

    pub fn bind_addr(&self) -> &str {
        self.bind_addr
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::BIND_ADDR)
    }

    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency
            .unwrap_or(defaults::WORKER_CONCURRENCY)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.unwrap_or(defaults::POLL_INTERVAL_MS)
    }

    pub fn stale_reservation_secs(&self) -> u64 {
        self.stale_reservation_secs
            .unwrap_or(defaults::STALE_RESERVATION_SECS)
    }

    pub fn smtp_port(&self) -> u16 {
        self.smtp_port.unwrap_or(defaults::SMTP_PORT)
    }

    pub fn smtp_from(&self) -> &str {
        self.smtp_from
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or(defaults::SMTP_FROM)
    }

    pub fn alert_recipients(&self) -> Vec<String> {
        self.alert_recipients
            .as_ref()
            .map(|s| {
                s.split(',')
                    .map(|r| r.trim().to_owned())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}
