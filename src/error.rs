//! Engine-level error types (§7).

use crate::channel::ChannelError;

/// Which engine reported a fatal error, for the supervisor's join report
/// (§7 "the supervisor reports the disjunction of per-engine last-error
/// codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineName {
    Client,
    Server,
    Worker,
}

impl std::fmt::Display for EngineName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EngineName::Client => "client",
            EngineName::Server => "server",
            EngineName::Worker => "worker",
        })
    }
}

/// A fatal condition for one engine (§4.7): the engine logs this, sets the
/// shared end-flag, and winds down. Per-connection failures never surface
/// here — they are handled entirely inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),
    #[error("fatal revents on a critical descriptor: {0}")]
    FatalRevents(&'static str),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("bind/listen failed: {0}")]
    Startup(#[source] std::io::Error),
}
