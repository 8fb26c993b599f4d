use anyhow::Context;
use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::Path;
use tracing::{info, warn};
use webvisor::logger::logs_tracing;
use webvisor::parse::{parser, Config};
use webvisor::shell::run_shell;
use webvisor::Supervisor;

const DEFAULT_CONFIG: &str = "config/webvisor.yml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cfg: Config = match std::env::args().nth(1) {
        Some(path) => parser(&path).with_context(|| format!("loading config `{path}`"))?,
        None if Path::new(DEFAULT_CONFIG).exists() => parser(DEFAULT_CONFIG)?,
        None => Config::default(),
    };
    cfg.service.apply_env_overrides(|var| std::env::var(var).ok())?;
    cfg.service.validate()?;

    let log_guard = logs_tracing(&cfg.logging.dir, &cfg.logging.level)?;

    let supervisor = Supervisor::new(cfg.service.clone())?;
    let _states = supervisor.subscribe_state(|change| {
        match &change.reason {
            Some(reason) => println!("[{} -> {}] {}", change.from, change.to, reason),
            None => println!("[{} -> {}]", change.from, change.to),
        }
        Ok(())
    });

    if cfg.service.autostart {
        if let Err(e) = supervisor.start().await {
            eprintln!("start failed: {e}");
        }
    }

    // Handle SIGTERM/SIGINT (stop and exit) and SIGHUP (restart)
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    let signals_handle = signals.handle();
    let on_signal = supervisor.clone();
    let signal_log = log_guard.clone();
    let signal_task = tokio::spawn(async move {
        while let Some(sig) = signals.next().await {
            if sig == SIGHUP {
                info!("SIGHUP received, restarting service");
                if let Err(e) = on_signal.restart().await {
                    warn!(error = %e, "restart on SIGHUP failed");
                }
                continue;
            }
            info!(signal = sig, "termination signal received, stopping service");
            let _ = on_signal.stop().await;
            // exit skips destructors; the shell keeps its history saved as it goes
            signal_log.flush();
            std::process::exit(0);
        }
    });

    run_shell(supervisor.clone(), &cfg.logging.dir).await?;

    supervisor.stop().await?;
    signals_handle.close();
    let _ = signal_task.await;
    log_guard.flush();
    Ok(())
}
