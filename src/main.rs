use std::{process, sync::Arc};

use platemark::{
    application::{
        dispatcher,
        error::AppError,
        render::RenderService,
    },
    config,
    infra::{
        error::InfraError,
        queue::{JobQueue, RedisJobQueue},
        status::{RedisStatusStore, StatusStore},
        telemetry,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher as tracing_dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if tracing_dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    tracing_dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (_cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    info!(
        target = "platemark::main",
        queue_key = settings.queue.key,
        concurrency = settings.queue.concurrency.get(),
        dpi = settings.render.dpi.get(),
        lossless = settings.render.lossless,
        data_dir = %settings.storage.data_dir.display(),
        "starting rendering worker"
    );

    let renderer = Arc::new(RenderService::new(&settings).map_err(AppError::from)?);

    let client = redis::Client::open(settings.queue.url.as_str())
        .map_err(|err| InfraError::configuration(format!("invalid queue url: {err}")))
        .map_err(AppError::from)?;
    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(
        client.clone(),
        settings.queue.key.clone(),
    ));
    let status: Arc<dyn StatusStore> = Arc::new(RedisStatusStore::new(
        client,
        settings.queue.status_prefix.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut pool = dispatcher::spawn_dispatchers(
        settings.queue.concurrency.get(),
        queue,
        status,
        renderer,
        settings.queue.poll_interval,
        &shutdown,
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::unexpected(format!("failed to listen for shutdown: {err}")))?;

    info!(target = "platemark::main", "shutdown signal received; draining dispatchers");
    shutdown.cancel();
    while pool.join_next().await.is_some() {}

    Ok(())
}
