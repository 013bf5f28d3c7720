use std::sync::Arc;

use exp_master::api;
use exp_master::config::MasterConfig;
use exp_master::datasets::DatasetDb;
use exp_master::repository::{ExperimentRepo, FilesystemBackend};
use exp_master::scheduler::{Scheduler, SchedulerDeps};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = MasterConfig::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "exp-master.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    eprintln!("🧪 Exp Master v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.scheduler.worker.program.display());
    eprintln!("   Repository: {}", config.repository_dir.display());
    eprintln!("   Results: {}", config.scheduler.results_dir.display());
    eprintln!("   Control API: http://{}/api/scheduler", config.bind_addr);
    eprintln!("   Schedule WS: ws://{}/ws\n", config.bind_addr);

    let repository = Arc::new(ExperimentRepo::new(Arc::new(FilesystemBackend::new(
        config.repository_dir.clone(),
    ))));
    let deps = SchedulerDeps {
        repository,
        datasets: Arc::new(DatasetDb::new()),
    };
    let scheduler = Scheduler::start(config.scheduler.clone(), deps);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "control server started");
    axum::serve(listener, api::router(scheduler.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("shutting down scheduler");
    scheduler.stop().await;
    Ok(())
}
