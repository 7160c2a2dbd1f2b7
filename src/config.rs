//! Configuration: CLI surface (§6, SPEC_FULL §10), environment mirroring,
//! and the running-lock that freezes configuration at `run()` entry (§5
//! "Shared-resource policy", DESIGN NOTES "Configuration mutation while
//! running").

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use clap::{Parser, ValueEnum};

/// Defaults mirror `original_source/proxy_impl.cpp`'s `__USER_DEFAULT_*`
/// compile-time constants.
pub mod defaults {
    pub const PROXY_PORT: u16 = 4880;
    pub const SERVER_PORT: u16 = 5555;
    pub const SERVER_IP: &str = "127.0.0.1";
    pub const CLIENT_POLL_TIMEOUT_MS: u32 = 1000;
    pub const SERVER_POLL_TIMEOUT_MS: u32 = 1000;
    pub const WORKER_POLL_TIMEOUT_MS: u32 = 1000;
    pub const CONNECT_TIMEOUT_MS: u32 = 3000;
    pub const CLIENT_KEEP_ALIVE: bool = false;
    pub const SERVER_KEEP_ALIVE: bool = false;
    pub const PID_FILE: &str = "/var/run/sql-relay.pid";
}

/// `DEBUG` / `INFO` / `ERROR`, mapped onto a `tracing` filter level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Command-line / environment surface (§6). CLI overrides env; env
/// overrides the compile-time [`defaults`].
#[derive(Parser, Debug, Clone)]
#[command(name = "sql-relay", about = "Transparent TCP relay with CLIENT/SERVER/WORKER audit")]
pub struct Cli {
    /// Public listen port.
    #[arg(short = 'p', long, env = "SQLRELAY_PORT", default_value_t = defaults::PROXY_PORT)]
    pub port: u16,

    /// Upstream IPv4 address.
    #[arg(long, env = "SQLRELAY_SERVER_ADDR", default_value = defaults::SERVER_IP)]
    pub server_addr: Ipv4Addr,

    /// Upstream port.
    #[arg(long, env = "SQLRELAY_SERVER_PORT", default_value_t = defaults::SERVER_PORT)]
    pub server_port: u16,

    /// Poll tick, in milliseconds, applied to all three engines.
    #[arg(long, env = "SQLRELAY_TIMEOUT", default_value_t = defaults::CLIENT_POLL_TIMEOUT_MS)]
    pub timeout: u32,

    /// Upstream connect deadline, in milliseconds.
    #[arg(long, env = "SQLRELAY_CONNECT_TIMEOUT", default_value_t = defaults::CONNECT_TIMEOUT_MS)]
    pub connect_timeout: u32,

    /// Enable `SO_KEEPALIVE` on accepted downstream sockets.
    #[arg(long, env = "SQLRELAY_CLIENT_KEEP_ALIVE", default_value_t = defaults::CLIENT_KEEP_ALIVE)]
    pub client_keep_alive: bool,

    /// Enable `SO_KEEPALIVE` on upstream sockets.
    #[arg(long, env = "SQLRELAY_SERVER_KEEP_ALIVE", default_value_t = defaults::SERVER_KEEP_ALIVE)]
    pub server_keep_alive: bool,

    /// Logging verbosity.
    #[arg(short = 'o', long, env = "SQLRELAY_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Stay in the foreground instead of daemonizing.
    #[arg(long, env = "SQLRELAY_NO_DAEMON", default_value_t = true)]
    pub no_daemon: bool,

    /// Steal a stale PID lock instead of refusing to start.
    #[arg(short = 'f', long, env = "SQLRELAY_FORCE", default_value_t = false)]
    pub force: bool,

    /// PID lock file path (daemon mode only).
    #[arg(long, env = "SQLRELAY_PID_FILE", default_value = defaults::PID_FILE)]
    pub pid_file: String,
}

/// Immutable snapshot of configuration handed to each engine thread.
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_port: u16,
    pub server_addr: SocketAddrV4,
    pub timeout_ms: u32,
    pub connect_timeout_ms: u32,
    pub client_keep_alive: bool,
    pub server_keep_alive: bool,
    pub log_level: LogLevel,
    pub no_daemon: bool,
    pub force: bool,
    pub pid_file: String,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            proxy_port: cli.port,
            server_addr: SocketAddrV4::new(cli.server_addr, cli.server_port),
            timeout_ms: cli.timeout,
            connect_timeout_ms: cli.connect_timeout,
            client_keep_alive: cli.client_keep_alive,
            server_keep_alive: cli.server_keep_alive,
            log_level: cli.log_level,
            no_daemon: cli.no_daemon,
            force: cli.force,
            pid_file: cli.pid_file,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            proxy_port: defaults::PROXY_PORT,
            server_addr: SocketAddrV4::new(
                defaults::SERVER_IP.parse().unwrap(),
                defaults::SERVER_PORT,
            ),
            timeout_ms: defaults::CLIENT_POLL_TIMEOUT_MS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            client_keep_alive: defaults::CLIENT_KEEP_ALIVE,
            server_keep_alive: defaults::SERVER_KEEP_ALIVE,
            log_level: LogLevel::Info,
            no_daemon: true,
            force: false,
            pid_file: defaults::PID_FILE.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration cannot be mutated once the proxy is running")]
    Running,
}

/// Holds a [`Config`] behind a running-lock: mutation is allowed only
/// before [`ConfigCell::freeze`] is called, matching `proxy_impl`'s
/// mutable setters guarded by `run_mutex` in the original implementation.
#[derive(Debug, Default)]
pub struct ConfigCell {
    value: Mutex<Config>,
    running: AtomicBool,
}

impl ConfigCell {
    pub fn new(config: Config) -> Self {
        Self {
            value: Mutex::new(config),
            running: AtomicBool::new(false),
        }
    }

    /// Freezes the configuration; called once by the supervisor at `run()`
    /// entry. Idempotent.
    pub fn freeze(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Config {
        self.value.lock().expect("config mutex poisoned").clone()
    }

    fn guard(&self) -> Result<(), ConfigError> {
        if self.is_running() {
            Err(ConfigError::Running)
        } else {
            Ok(())
        }
    }

    pub fn set_proxy_port(&self, value: u16) -> Result<(), ConfigError> {
        self.guard()?;
        self.value.lock().expect("config mutex poisoned").proxy_port = value;
        Ok(())
    }

    pub fn set_connect_timeout_ms(&self, value: u32) -> Result<(), ConfigError> {
        self.guard()?;
        self.value
            .lock()
            .expect("config mutex poisoned")
            .connect_timeout_ms = value;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mutation_succeeds_before_freeze_and_fails_after() {
        let cell = ConfigCell::new(Config::default());
        assert!(cell.set_proxy_port(9000).is_ok());
        assert_eq!(cell.snapshot().proxy_port, 9000);

        cell.freeze();
        assert!(matches!(cell.set_proxy_port(1), Err(ConfigError::Running)));
        assert_eq!(cell.snapshot().proxy_port, 9000);
    }

    #[test]
    fn cli_defaults_match_original_constants() {
        let cfg: Config = Cli::parse_from(["sql-relay"]).into();
        assert_eq!(cfg.proxy_port, defaults::PROXY_PORT);
        assert_eq!(cfg.server_addr.port(), defaults::SERVER_PORT);
        assert_eq!(cfg.connect_timeout_ms, defaults::CONNECT_TIMEOUT_MS);
    }
}
