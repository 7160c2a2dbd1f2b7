//! WORKER engine (§4.4): a passive observer that drains its two inbound
//! channels and applies an external audit policy. Never produces
//! externally-visible bytes; never stalls its channel reads, even if the
//! audit sink is slow (SPEC_FULL §12).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::channel::{ChannelRx, ChannelTx};
use crate::config::Config;
use crate::error::EngineError;
use crate::event::{Event, POLL_CAP};

const TOKEN_FROM_CLIENT: Token = Token(0);
const TOKEN_FROM_SERVER: Token = Token(1);

/// Where audited events go. The core contract only fixes what the WORKER
/// *receives*; what it does with an event is external (§1, §4.4).
pub trait WorkerSink: Send {
    fn observe(&mut self, event: &Event);
}

/// Default sink: structured `tracing` events, one per audited `Event`. A
/// production deployment swaps this for a real recorder without touching
/// the engine.
#[derive(Debug, Default)]
pub struct TracingSink;

impl WorkerSink for TracingSink {
    fn observe(&mut self, event: &Event) {
        tracing::info!(
            direction = ?event.direction,
            kind = ?event.kind,
            c_sd = event.c_sd,
            s_sd = event.s_sd,
            len = event.buffer_len(),
            "audit"
        );
    }
}

/// The WORKER engine (§4.4).
pub struct WorkerEngine<S: WorkerSink = TracingSink> {
    poll: Poll,
    events: Events,
    from_client: ChannelRx,
    from_server: ChannelRx,
    /// WORKER never writes back (§1, §4.4), but the W→C and W→S channels
    /// still exist structurally: holding their write halves here keeps the
    /// pipes open so CLIENT/SERVER's inbound reads never observe a spurious
    /// peer-closed EOF.
    _to_client: ChannelTx,
    _to_server: ChannelTx,
    sink: S,
    config: Arc<Config>,
    end_flag: Arc<AtomicBool>,
}

impl<S: WorkerSink> WorkerEngine<S> {
    pub fn prepare(
        config: Arc<Config>,
        end_flag: Arc<AtomicBool>,
        from_client: ChannelRx,
        from_server: ChannelRx,
        to_client_unused: ChannelTx,
        to_server_unused: ChannelTx,
        sink: S,
    ) -> Result<Self, EngineError> {
        let poll = Poll::new().map_err(EngineError::Startup)?;
        let mut from_client = from_client;
        let mut from_server = from_server;
        poll.registry()
            .register(&mut from_client, TOKEN_FROM_CLIENT, Interest::READABLE)
            .map_err(EngineError::Startup)?;
        poll.registry()
            .register(&mut from_server, TOKEN_FROM_SERVER, Interest::READABLE)
            .map_err(EngineError::Startup)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(POLL_CAP),
            from_client,
            from_server,
            _to_client: to_client_unused,
            _to_server: to_server_unused,
            sink,
            config,
            end_flag,
        })
    }

    pub fn run(&mut self) -> Result<(), EngineError> {
        let timeout = Duration::from_millis(self.config.timeout_ms as u64);
        while !self.end_flag.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                self.end_flag.store(true, Ordering::SeqCst);
                return Err(EngineError::Poll(e));
            }
            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if let Err(e) = self.drain(token) {
                    self.end_flag.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        self.done();
        Ok(())
    }

    pub fn done(&mut self) {
        self.end_flag.store(true, Ordering::SeqCst);
    }

    fn drain(&mut self, token: Token) -> Result<(), EngineError> {
        let channel = match token {
            TOKEN_FROM_CLIENT => &mut self.from_client,
            TOKEN_FROM_SERVER => &mut self.from_server,
            _ => return Ok(()),
        };
        while let Some(ev) = channel.recv()? {
            self.sink.observe(&ev);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{Direction, Kind};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingSink(Arc<Mutex<Vec<Event>>>);

    impl WorkerSink for RecordingSink {
        fn observe(&mut self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn worker_drains_both_channels_and_forwards_to_sink() {
        let (mut c_tx, c_rx) = crate::channel::channel().unwrap();
        let (mut s_tx, s_rx) = crate::channel::channel().unwrap();
        let (w_to_c_tx, _w_to_c_rx) = crate::channel::channel().unwrap();
        let (w_to_s_tx, _w_to_s_rx) = crate::channel::channel().unwrap();
        let config = Arc::new(Config::default());
        let end_flag = Arc::new(AtomicBool::new(false));
        let sink = RecordingSink::default();
        let seen = sink.0.clone();

        let mut engine = WorkerEngine::prepare(
            config,
            end_flag.clone(),
            c_rx,
            s_rx,
            w_to_c_tx,
            w_to_s_tx,
            sink,
        )
        .unwrap();

        c_tx.send(&Event::control(Direction::ClientToWorker, Kind::NewConnect, 1, -1))
            .unwrap();
        s_tx.send(&Event::control(Direction::ServerToWorker, Kind::NewConnect, 1, 2))
            .unwrap();

        engine.poll.poll(&mut engine.events, Some(Duration::from_millis(100))).unwrap();
        let tokens: Vec<Token> = engine.events.iter().map(|e| e.token()).collect();
        for t in tokens {
            engine.drain(t).unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
