//! Torotator - Entry Point
//!
//! Starts the reverse proxy and the rotation scheduler, reloads on SIGHUP and
//! drains every worker pair on SIGINT/SIGTERM.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torotator::api::{ApiServer, AppState};
use torotator::config::LogConfig;
use torotator::haproxy::HaproxyCommand;
use torotator::rotation::shutdown_requested;
use torotator::worker::TorPrivoxy;
use torotator::{deps, Config, PortAllocator, ReverseProxy, Result, Scheduler, ShutdownHandle};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!(version = env!("CARGO_PKG_VERSION"), "rotating tor proxy");

    if let Err(e) = deps::check(&config.binaries) {
        error!(error = %e, "missing required program");
        return Err(e);
    }

    tokio::fs::create_dir_all(&config.work_dir).await?;

    let command = HaproxyCommand::new(
        &config.binaries.haproxy,
        config.proxy.port,
        config.pool.settle,
    );
    let proxy = match ReverseProxy::start(
        config.proxy.clone(),
        config.reload.clone(),
        config.haproxy_dir(),
        Arc::new(command),
    )
    .await
    {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, "failed to start HAProxy");
            remove_work_dir(&config).await;
            return Err(e);
        }
    };

    let (shutdown, shutdown_rx) = ShutdownHandle::new();
    let ports = PortAllocator::new(config.ports);
    let scheduler = Scheduler::new(
        config.pool.clone(),
        config.work_dir.clone(),
        ports.clone(),
        proxy.clone(),
        Arc::new(TorPrivoxy::new(&config.binaries, &config.pool)),
    );

    let api_task = config.api.enabled.then(|| {
        let state = AppState::new(
            proxy.clone(),
            scheduler.clone(),
            ports.clone(),
            shutdown.subscribe(),
        );
        let server = ApiServer::new(config.api.clone(), state);
        let api_shutdown = shutdown.subscribe();
        info!("Status API enabled on {}", config.api_addr());
        tokio::spawn(async move {
            if let Err(e) = server.run(api_shutdown).await {
                error!("API server error: {}", e);
            }
        })
    });

    let hangup_task = tokio::spawn(reload_on_hangup(proxy.clone(), shutdown.subscribe()));
    let rotation_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    info!(
        port = config.proxy.port,
        pool = config.pool.size,
        "rotating proxy started"
    );

    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "failed to listen for termination signals");
    }
    info!("Shutdown signal received; retiring all proxies");
    shutdown.shutdown();

    if let Err(e) = rotation_task.await {
        error!(error = %e, "rotation scheduler failed");
    }
    match hangup_task.await {
        Ok(Err(e)) => error!(error = %e, "SIGHUP handler failed"),
        Err(e) => error!(error = %e, "SIGHUP task failed"),
        Ok(Ok(())) => {}
    }
    if let Some(task) = api_task {
        let _ = task.await;
    }

    proxy.shutdown().await;
    remove_work_dir(&config).await;

    info!("done");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("torotator={},tower_http=info", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Reload the reverse proxy immediately on every SIGHUP
async fn reload_on_hangup(
    proxy: Arc<ReverseProxy>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("SIGHUP received; reloading HAProxy");
                proxy.reload_now().await;
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {},
    }
    Ok(())
}

async fn remove_work_dir(config: &Config) {
    if let Err(e) = tokio::fs::remove_dir_all(&config.work_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(path = %config.work_dir.display(), error = %e, "failed to remove working directory");
        }
    }
}
