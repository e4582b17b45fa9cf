//! CustomVPN client entry point
//!
//! Loads `config.yaml` from next to the executable (overridable with
//! `--config`), sets up file logging and runs the connection-lifecycle
//! engine until an exit event or a termination signal arrives. Exit code 0
//! on a clean shutdown, 1 on any initialization failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use customvpn::config::Config;
use customvpn::logging;
use customvpn::ui::NullUiSink;
use customvpn::Application;

#[derive(Parser)]
#[command(name = "customvpn", version, about = "CustomVPN desktop client")]
struct Cli {
    /// Path to config.yaml (defaults to the file next to the executable)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("fatal: {:#}", error);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app_dir = Config::detect_app_dir().context("determine app directory")?;
    let config_path = cli
        .config
        .unwrap_or_else(|| Config::default_path(&app_dir));
    let config = Arc::new(Config::load(&config_path, &app_dir)?);

    logging::init(&config.log_file, config.log_level);
    log::info!(
        "CustomVPN client {} starting (config: {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );
    log::debug!("core binary: {}", config.core_path.display());
    log::debug!("core log file: {}", config.core_log_file.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build async runtime")?;

    let app = Application::new(config, runtime.handle().clone(), Arc::new(NullUiSink))
        .context("initialize application")?;
    app.install_panic_hook();
    app.run()?;

    let mut done = app.done();
    runtime.block_on(async {
        tokio::select! {
            _ = shutdown_signal() => log::info!("shutdown requested"),
            _ = done.changed() => log::info!("application requested shutdown"),
        }
    });

    app.stop();
    Ok(())
}

/// Resolves on SIGINT/SIGTERM (Ctrl-C on Windows).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    log::error!("install SIGTERM handler failed: {}", error);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
