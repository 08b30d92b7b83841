use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use channel::{ChannelRegistry, Mailer};
use config::Config;
use dead_letter::DeadLetterProcessor;
use service::Service;
use worker::{WorkerPool, WorkerPoolConfig};

pub mod api;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod job;
pub mod message;
pub mod service;
pub mod store;
pub mod worker;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Returns a builder for the main application.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let mailer = Mailer::from_config(&config)?.map(Arc::new);
    let registry = ChannelRegistry::with_defaults(mailer.clone())?;

    let service = Service::connect_with(config.clone(), registry).await?;

    let workers = WorkerPool::new(
        service.store().clone(),
        service.registry().clone(),
        WorkerPoolConfig::from_config(&config),
    )
    .spawn();

    let dead_letter = DeadLetterProcessor::new(service.store().clone(), mailer, &config).spawn();

    let data = Data::new(service);
    let bind_addr = config.bind_addr().to_owned();

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allow_any_method();

        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(cors)
            .service(api::messages::service())
            .service(api::admin::stats_service())
            .service(api::admin::jobs_service())
            .app_data(data.clone())
            .app_data(json_cfg)
    })
    .bind(bind_addr)?
    .run()
    .await?;

    workers.shutdown(SHUTDOWN_GRACE).await;
    dead_letter.shutdown().await;

    Ok(())
}
