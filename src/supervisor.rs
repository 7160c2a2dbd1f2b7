//! Supervisor: creates the six channels, spawns the three engine threads,
//! holds shared configuration and the end-of-life flag, and joins the
//! engines at shutdown (§2 "Supervisor", §9 "Global end-flag").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::channel;
use crate::client::ClientEngine;
use crate::config::{Config, ConfigCell};
use crate::error::{EngineError, EngineName};
use crate::server_engine::ServerEngine;
use crate::worker::{TracingSink, WorkerEngine, WorkerSink};

/// The disjunction of per-engine outcomes the supervisor reports once all
/// three threads have joined (§7 "the supervisor reports the disjunction
/// of per-engine last-error codes").
#[derive(Debug, Default)]
pub struct JoinReport {
    pub errors: Vec<(EngineName, EngineError)>,
}

impl JoinReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns configuration, the end-flag, and the three engine threads.
pub struct Supervisor {
    config: Arc<ConfigCell>,
    end_flag: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(ConfigCell::new(config)),
            end_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn end_flag(&self) -> Arc<AtomicBool> {
        self.end_flag.clone()
    }

    /// Freezes configuration and runs CLIENT, SERVER and WORKER to
    /// completion with the default [`TracingSink`], joining all three.
    pub fn run(&self) -> Result<JoinReport, EngineError> {
        self.run_with_sink(TracingSink)
    }

    /// Same as [`Self::run`], but with a caller-supplied WORKER sink —
    /// the seam used by integration tests to assert on the audit stream.
    pub fn run_with_sink<S>(&self, sink: S) -> Result<JoinReport, EngineError>
    where
        S: WorkerSink + 'static,
    {
        self.config.freeze();
        let config = Arc::new(self.config.snapshot());

        let (c_to_s_tx, c_to_s_rx) = channel::channel().map_err(EngineError::Startup)?;
        let (s_to_c_tx, s_to_c_rx) = channel::channel().map_err(EngineError::Startup)?;
        let (c_to_w_tx, c_to_w_rx) = channel::channel().map_err(EngineError::Startup)?;
        let (w_to_c_tx, w_to_c_rx) = channel::channel().map_err(EngineError::Startup)?;
        let (s_to_w_tx, s_to_w_rx) = channel::channel().map_err(EngineError::Startup)?;
        let (w_to_s_tx, w_to_s_rx) = channel::channel().map_err(EngineError::Startup)?;

        let mut client =
            ClientEngine::prepare(config.clone(), self.end_flag.clone(), c_to_s_tx, s_to_c_rx, c_to_w_tx, w_to_c_rx)?;
        let mut server = ServerEngine::prepare(
            config.clone(),
            self.end_flag.clone(),
            c_to_s_rx,
            s_to_c_tx,
            s_to_w_tx,
            w_to_s_rx,
        )?;
        let mut worker = WorkerEngine::prepare(
            config,
            self.end_flag.clone(),
            c_to_w_rx,
            s_to_w_rx,
            w_to_c_tx,
            w_to_s_tx,
            sink,
        )?;

        let client_handle: JoinHandle<Result<(), EngineError>> =
            std::thread::Builder::new()
                .name("sql-relay-client".into())
                .spawn(move || client.run())
                .expect("failed to spawn CLIENT thread");
        let server_handle: JoinHandle<Result<(), EngineError>> =
            std::thread::Builder::new()
                .name("sql-relay-server".into())
                .spawn(move || server.run())
                .expect("failed to spawn SERVER thread");
        let worker_handle: JoinHandle<Result<(), EngineError>> =
            std::thread::Builder::new()
                .name("sql-relay-worker".into())
                .spawn(move || worker.run())
                .expect("failed to spawn WORKER thread");

        let mut report = JoinReport::default();
        if let Err(e) = client_handle.join().expect("CLIENT thread panicked") {
            self.end_flag.store(true, Ordering::SeqCst);
            report.errors.push((EngineName::Client, e));
        }
        if let Err(e) = server_handle.join().expect("SERVER thread panicked") {
            self.end_flag.store(true, Ordering::SeqCst);
            report.errors.push((EngineName::Server, e));
        }
        if let Err(e) = worker_handle.join().expect("WORKER thread panicked") {
            self.end_flag.store(true, Ordering::SeqCst);
            report.errors.push((EngineName::Worker, e));
        }
        Ok(report)
    }

    /// External shutdown (§5 "Cancellation"): raises the end-flag so every
    /// engine exits its loop on the next poll tick.
    pub fn shutdown(&self) {
        self.end_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_supervisor_starts_with_end_flag_clear() {
        let sup = Supervisor::new(Config::default());
        assert!(!sup.end_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_raises_the_shared_flag() {
        let sup = Supervisor::new(Config::default());
        sup.shutdown();
        assert!(sup.end_flag().load(Ordering::SeqCst));
    }
}
