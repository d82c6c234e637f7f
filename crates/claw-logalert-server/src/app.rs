//! Process startup, signal handling and shutdown.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use claw_logalert::{
    AlertmanagerWebhook, AppConfig, ElasticsearchClient, EngineBuilder, LogAlertError, RuleSource,
    SchedulerManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::server::LogAlertServer;

/// Exit status for a clean shutdown.
pub const EXIT_OK: u8 = 0;
/// Exit status for any startup failure other than configuration.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status for a configuration error.
pub const EXIT_CONFIG: u8 = 2;

/// Maps a startup error to the process exit status.
#[must_use]
pub fn exit_status(err: &anyhow::Error) -> u8 {
    let configuration = err.chain().any(|cause| {
        cause
            .downcast_ref::<LogAlertError>()
            .is_some_and(LogAlertError::is_configuration)
    });
    if configuration { EXIT_CONFIG } else { EXIT_FAILURE }
}

/// Assembles the scheduler from configuration.
pub fn build_scheduler(config: &AppConfig) -> anyhow::Result<SchedulerManager> {
    let query = Arc::new(ElasticsearchClient::new()?);
    let mut builder = EngineBuilder::new(config.clone(), query);
    if config.alert.alertmanager.enabled {
        let webhook = AlertmanagerWebhook::new(&config.alert.alertmanager)?;
        info!(url = webhook.url(), "alertmanager delivery enabled");
        builder = builder.with_webhook(Arc::new(webhook));
    }
    Ok(SchedulerManager::new(builder.build_state()))
}

/// Picks the rule source: `--rule` wins over the configured loader.
pub fn build_source(cli: &Cli, config: &AppConfig) -> anyhow::Result<RuleSource> {
    Ok(match &cli.rule {
        Some(path) => RuleSource::single_file(path),
        None => RuleSource::from_config(&config.loader)?,
    })
}

/// Runs the service until SIGINT or SIGTERM.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_file(&cli.config)?;
    info!(config = %cli.config.display(), "configuration loaded");

    let scheduler = Arc::new(build_scheduler(&config)?);
    let source = Arc::new(build_source(&cli, &config)?);
    let rules = source
        .reload(&scheduler)
        .await
        .with_context(|| format!("cannot load rules from {} source", source.kind()))?;
    info!(rules, source = source.kind(), "rules scheduled");

    scheduler.start_global_dispatch(config.run_every.as_duration());
    if config.alert.alertmanager.enabled {
        scheduler.start_consumer();
    } else {
        warn!("alertmanager disabled, alerts are tracked but not delivered");
    }

    let shutdown = CancellationToken::new();
    let watch = source.watch(Arc::clone(&scheduler), shutdown.child_token())?;

    let server = if config.exporter.enabled {
        let addr: SocketAddr = config
            .exporter
            .listen_addr
            .parse()
            .map_err(|e| LogAlertError::config(format!("exporter.listen_addr: {e}")))?;
        let server = LogAlertServer::new(Arc::clone(&scheduler), Arc::clone(&source));
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            let result = server.serve_with_shutdown(addr, stop.cancelled_owned()).await;
            if let Err(e) = &result {
                error!(error = %e, "control surface failed");
            }
            result
        }))
    } else {
        None
    };

    wait_for_shutdown(&cli.config, &scheduler).await?;

    shutdown.cancel();
    scheduler.stop_all().await;
    if let Some(watch) = watch {
        if let Err(e) = watch.await {
            warn!(error = %e, "rule watch ended abnormally");
        }
    }
    if let Some(server) = server {
        server.await.context("control surface task")??;
    }
    info!("shutdown complete");
    Ok(())
}

/// Re-reads the config file and swaps it in; a bad file keeps the old one.
/// Alertmanager settings only change on restart.
pub fn reload_config(path: &Path, scheduler: &SchedulerManager) {
    match AppConfig::from_file(path) {
        Ok(config) => {
            if !scheduler.set_config(config) {
                warn!(config = %path.display(), "alertmanager settings unchanged until restart");
            }
        }
        Err(e) => error!(config = %path.display(), error = %e, "config reload rejected"),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(config_path: &Path, scheduler: &SchedulerManager) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload_config(config_path, scheduler);
            }
            _ = interrupt.recv() => {
                info!("SIGINT received, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config_path: &Path, _scheduler: &SchedulerManager) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    Ok(())
}
