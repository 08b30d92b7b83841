use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::ExposeSecret;

use super::DeliveryHandler;
use crate::config::{defaults, Config};
use crate::error::Error;
use crate::message::{EmailContent, Message};

/// Shared SMTP plumbing for the email channel and dead-letter alerts.
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    default_from: Mailbox,
}

impl Mailer {
    /// Returns `None` when no SMTP host is configured; the email channel is
    /// simply not registered in that case.
    pub fn from_config(config: &Config) -> Result<Option<Self>, Error> {
        let Some(host) = config.smtp_host.as_deref() else {
            return Ok(None);
        };

        let mut builder = if config.smtp_starttls.unwrap_or(false) {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(Error::internal)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };

        builder = builder.port(config.smtp_port());

        if let (Some(user), Some(password)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                password.expose_secret().to_owned(),
            ));
        }

        let default_from = config
            .smtp_from()
            .parse::<Mailbox>()
            .map_err(|e| Error::internal(eyre::eyre!("invalid smtp_from address: {e}")))?;

        Ok(Some(Self {
            transport: builder.build(),
            default_from,
        }))
    }

    pub async fn send(
        &self,
        from: Option<Mailbox>,
        to: &str,
        subject: &str,
        text: Option<&str>,
        html: Option<&str>,
    ) -> Result<(), Error> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| Error::delivery(format!("invalid recipient address: {e}")))?;

        let builder = lettre::Message::builder()
            .from(from.unwrap_or_else(|| self.default_from.clone()))
            .to(to)
            .subject(subject);

        let email = match (text, html) {
            (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
                text.to_owned(),
                html.to_owned(),
            )),
            (None, Some(html)) => builder
                .header(lettre::message::header::ContentType::TEXT_HTML)
                .body(html.to_owned()),
            (text, None) => builder.body(text.unwrap_or_default().to_owned()),
        }
        .map_err(|e| Error::delivery(format!("could not build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| Error::delivery(format!("SMTP error: {e}")))
    }
}

/// Email delivery: sends the message content to the destination address via
/// SMTP. Sender, subject and bodies come out of the message data with
/// configured fallbacks.
pub struct EmailHandler {
    mailer: std::sync::Arc<Mailer>,
}

impl EmailHandler {
    pub fn new(mailer: std::sync::Arc<Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl DeliveryHandler for EmailHandler {
    async fn deliver(&self, message: &Message) -> Result<(), Error> {
        let content = EmailContent::from_message(message)?;

        let from = match content.from.as_deref() {
            Some(addr) => {
                let address = addr
                    .parse()
                    .map_err(|e| Error::delivery(format!("invalid sender address: {e}")))?;
                Some(Mailbox::new(content.from_name.clone(), address))
            }
            None => None,
        };

        self.mailer
            .send(
                from,
                &message.destination,
                content.subject.as_deref().unwrap_or(defaults::EMAIL_SUBJECT),
                content.text.as_deref(),
                content.html.as_deref(),
            )
            .await
    }
}
