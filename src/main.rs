//! CLI entry point: parses options, optionally daemonizes, acquires the PID
//! lock, installs signal handlers, and runs the [`Supervisor`] to
//! completion.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sql_relay::config::{Cli, Config};
use sql_relay::daemon::{self, PidLock};
use sql_relay::supervisor::Supervisor;

fn main() {
    let cli = Cli::parse();
    let config = Config::from(cli);

    let filter = EnvFilter::try_new(format!("sql_relay={}", level_name(config.log_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config.no_daemon {
        if let Err(e) = daemon::daemonize() {
            tracing::error!(error = %e, "daemonization failed");
            std::process::exit(1);
        }
    } else {
        daemon::ignore_sigpipe();
    }
    daemon::install_signal_handlers();

    let _pid_lock = if !config.no_daemon {
        match PidLock::acquire(&config.pid_file, config.force) {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::error!(error = %e, "failed to acquire PID lock");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let supervisor = Supervisor::new(config);
    let end_flag = supervisor.end_flag();
    std::thread::spawn(move || {
        while !end_flag.load(std::sync::atomic::Ordering::SeqCst) {
            if daemon::shutdown_requested() {
                end_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    });

    match supervisor.run() {
        Ok(report) if report.is_clean() => {
            tracing::info!("shut down cleanly");
        }
        Ok(report) => {
            for (engine, err) in &report.errors {
                tracing::error!(%engine, error = %err, "engine exited with error");
            }
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    }
}

fn level_name(level: sql_relay::config::LogLevel) -> &'static str {
    match level {
        sql_relay::config::LogLevel::Debug => "debug",
        sql_relay::config::LogLevel::Info => "info",
        sql_relay::config::LogLevel::Error => "error",
    }
}
