//! SERVER engine (§4.3): translates CLIENT-originated control events into
//! real upstream TCP connections, streams bytes, and observes upstream
//! lifecycle including the connect-timeout sweep.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::Socket;

use crate::channel::{ChannelRx, ChannelTx};
use crate::config::Config;
use crate::error::EngineError;
use crate::event::{Direction, Event, Kind, BUF_CAP, POLL_CAP};
use crate::queue::{FlushOutcome, OutboundQueue};

const TOKEN_FROM_CLIENT: Token = Token(0);
const TOKEN_FROM_WORKER: Token = Token(1);
const TOKEN_TO_CLIENT: Token = Token(2);
const TOKEN_TO_WORKER: Token = Token(3);
const TOKEN_BASE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    Closing,
}

/// §9 "Connect state": `CONNECTING` exposes only `POLLOUT` for completion
/// detection; `OPEN` is the steady state once `SO_ERROR` reads zero.
#[derive(Debug, Clone, Copy)]
enum ConnectState {
    Connecting { since: Instant },
    Open,
}

struct UpstreamConn {
    stream: TcpStream,
    peer_c_sd: i32,
    queue: OutboundQueue,
    connect_state: ConnectState,
    close_state: CloseState,
}

struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&mio::event::Event> for Ready {
    fn from(e: &mio::event::Event) -> Self {
        Ready {
            token: e.token(),
            readable: e.is_readable(),
            writable: e.is_writable(),
            error: e.is_error() || e.is_read_closed() || e.is_write_closed(),
        }
    }
}

fn apply_socket_opts(stream: &TcpStream, keep_alive: bool) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if keep_alive {
        use std::os::fd::{AsRawFd, FromRawFd};
        // SAFETY: the fd stays valid for this call and is owned by `stream`;
        // `sock2` is forgotten so it never closes it.
        let sock2 = unsafe { Socket::from_raw_fd(stream.as_raw_fd()) };
        let result = sock2.set_keepalive(true);
        std::mem::forget(sock2);
        result?;
    }
    Ok(())
}

/// The SERVER engine (§4.3).
pub struct ServerEngine {
    poll: Poll,
    events: Events,
    conns: Slab<UpstreamConn>,
    from_client: ChannelRx,
    to_client: ChannelTx,
    to_worker: ChannelTx,
    from_worker: ChannelRx,
    outbound_registered: bool,
    config: Arc<Config>,
    end_flag: Arc<AtomicBool>,
}

impl ServerEngine {
    pub fn prepare(
        config: Arc<Config>,
        end_flag: Arc<AtomicBool>,
        from_client: ChannelRx,
        to_client: ChannelTx,
        to_worker: ChannelTx,
        from_worker: ChannelRx,
    ) -> Result<Self, EngineError> {
        let poll = Poll::new().map_err(EngineError::Startup)?;
        let mut from_client = from_client;
        let mut from_worker = from_worker;
        poll.registry()
            .register(&mut from_client, TOKEN_FROM_CLIENT, Interest::READABLE)
            .map_err(EngineError::Startup)?;
        poll.registry()
            .register(&mut from_worker, TOKEN_FROM_WORKER, Interest::READABLE)
            .map_err(EngineError::Startup)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(POLL_CAP),
            conns: Slab::new(),
            from_client,
            to_client,
            to_worker,
            from_worker,
            outbound_registered: false,
            config,
            end_flag,
        })
    }

    pub fn run(&mut self) -> Result<(), EngineError> {
        let timeout = Duration::from_millis(self.config.timeout_ms as u64);
        while !self.end_flag.load(Ordering::SeqCst) {
            self.sweep_connect_timeouts()?;
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.end_flag.store(true, Ordering::SeqCst);
                return Err(EngineError::Poll(e));
            }
            let ready: Vec<Ready> = self.events.iter().map(Ready::from).collect();
            for r in ready {
                if let Err(e) = self.handle_ready(r) {
                    self.end_flag.store(true, Ordering::SeqCst);
                    self.done();
                    return Err(e);
                }
            }
        }
        self.done();
        Ok(())
    }

    pub fn done(&mut self) {
        self.end_flag.store(true, Ordering::SeqCst);
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for k in keys {
            let _ = self.force_close(k as i32, false);
        }
    }

    /// `sweep_connect_timeouts()` (§4.3): any upstream socket awaiting
    /// connect longer than `connect_timeout` is reported NOT_CONNECT and
    /// closed.
    fn sweep_connect_timeouts(&mut self) -> Result<(), EngineError> {
        let deadline = Duration::from_millis(self.config.connect_timeout_ms as u64);
        let now = Instant::now();
        let expired: Vec<i32> = self
            .conns
            .iter()
            .filter_map(|(k, c)| match c.connect_state {
                ConnectState::Connecting { since } if now.duration_since(since) > deadline => {
                    Some(k as i32)
                }
                _ => None,
            })
            .collect();
        for s_sd in expired {
            self.fail_connect(s_sd)?;
        }
        Ok(())
    }

    fn handle_ready(&mut self, r: Ready) -> Result<(), EngineError> {
        match r.token {
            TOKEN_FROM_CLIENT => {
                if r.error {
                    return Err(EngineError::FatalRevents("client-channel-in"));
                }
                self.drain_from_client()
            }
            TOKEN_FROM_WORKER => {
                if r.error {
                    return Err(EngineError::FatalRevents("worker-channel-in"));
                }
                self.drain_from_worker()
            }
            TOKEN_TO_CLIENT | TOKEN_TO_WORKER => Ok(()),
            t => self.service_conn(t, r),
        }
    }

    fn register_outbound(&mut self) -> Result<(), EngineError> {
        if !self.outbound_registered {
            self.poll
                .registry()
                .register(&mut self.to_client, TOKEN_TO_CLIENT, Interest::WRITABLE)
                .map_err(EngineError::Poll)?;
            self.poll
                .registry()
                .register(&mut self.to_worker, TOKEN_TO_WORKER, Interest::WRITABLE)
                .map_err(EngineError::Poll)?;
            self.outbound_registered = true;
        }
        Ok(())
    }

    fn deregister_outbound(&mut self) {
        if self.outbound_registered {
            let _ = self.poll.registry().deregister(&mut self.to_client);
            let _ = self.poll.registry().deregister(&mut self.to_worker);
            self.outbound_registered = false;
        }
    }

    fn emit_control(&mut self, ev: Event) -> Result<(), EngineError> {
        self.to_client.send(&ev)?;
        let worker_ev = ev.retargeted(Direction::ServerToWorker);
        self.to_worker.send(&worker_ev)?;
        Ok(())
    }

    fn reply_not_connect(&mut self, c_sd: i32, s_sd: i32) -> Result<(), EngineError> {
        let ev = Event::control(Direction::ServerToClient, Kind::NotConnect, c_sd, s_sd);
        self.emit_control(ev)
    }

    fn reply_connect_not_found(&mut self, c_sd: i32, s_sd: i32) -> Result<(), EngineError> {
        let ev = Event::control(Direction::ServerToClient, Kind::ConnectNotFound, c_sd, s_sd);
        self.emit_control(ev)
    }

    fn drain_from_client(&mut self) -> Result<(), EngineError> {
        while let Some(ev) = self.from_client.recv()? {
            self.handle_client_event(ev)?;
        }
        Ok(())
    }

    fn drain_from_worker(&mut self) -> Result<(), EngineError> {
        while self.from_worker.recv()?.is_some() {}
        Ok(())
    }

    fn handle_client_event(&mut self, ev: Event) -> Result<(), EngineError> {
        match ev.kind {
            Kind::NewConnect => self.begin_connect(ev.c_sd),
            Kind::Data => {
                let s_sd = self.find_s_sd_for(ev.c_sd);
                match s_sd {
                    Some(s_sd) => {
                        let failed = match self.conns.get_mut(s_sd as usize) {
                            Some(conn) => deliver_data(conn, ev.payload()).is_err(),
                            None => false,
                        };
                        if failed {
                            self.force_close(s_sd, true)?;
                        }
                        Ok(())
                    }
                    None => {
                        tracing::warn!(c_sd = ev.c_sd, "DATA for unknown/unpaired c_sd");
                        self.reply_connect_not_found(ev.c_sd, -1)
                    }
                }
            }
            Kind::Disconnect | Kind::ConnectNotFound => {
                if let Some(s_sd) = self.find_s_sd_for(ev.c_sd) {
                    self.close_on_peer_request(s_sd)
                } else {
                    tracing::debug!(c_sd = ev.c_sd, "close for unknown/already-closed pairing");
                    Ok(())
                }
            }
            Kind::NotConnect | Kind::Unknown | Kind::Other => Ok(()),
        }
    }

    fn find_s_sd_for(&self, c_sd: i32) -> Option<i32> {
        self.conns
            .iter()
            .find(|(_, c)| c.peer_c_sd == c_sd)
            .map(|(k, _)| k as i32)
    }

    /// Async connect (§4.3): create the upstream socket, set options, call
    /// `connect`, and classify the outcome.
    fn begin_connect(&mut self, c_sd: i32) -> Result<(), EngineError> {
        let addr = SocketAddr::V4(self.config.server_addr);
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(_) => return self.reply_not_connect(c_sd, -1),
        };
        if let Err(e) = apply_socket_opts(&stream, self.config.server_keep_alive) {
            tracing::warn!(error = %e, "setsockopt failed on fresh upstream socket");
            return self.reply_not_connect(c_sd, -1);
        }

        let entry = self.conns.vacant_entry();
        let s_sd = entry.key() as i32;
        let mut stream = stream;
        if self
            .poll
            .registry()
            .register(
                &mut stream,
                Token(TOKEN_BASE + s_sd as usize),
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_err()
        {
            return self.reply_not_connect(c_sd, -1);
        }

        // `take_error` resolves an immediate success/failure; EINPROGRESS
        // (no error pending yet) falls through to `Connecting`.
        let immediate = stream.take_error().ok().flatten();
        entry.insert(UpstreamConn {
            stream,
            peer_c_sd: c_sd,
            queue: OutboundQueue::default(),
            connect_state: ConnectState::Connecting { since: Instant::now() },
            close_state: CloseState::Open,
        });
        if self.conns.len() == 1 {
            self.register_outbound()?;
        }

        match immediate {
            None => Ok(()),
            Some(_) => self.fail_connect(s_sd),
        }
    }

    /// Connect completion (§4.3), reached either from a `POLLOUT` on a
    /// `Connecting` socket, or from [`Self::sweep_connect_timeouts`].
    fn complete_connect(&mut self, s_sd: i32) -> Result<(), EngineError> {
        let err = match self.conns.get_mut(s_sd as usize) {
            Some(conn) => conn.stream.take_error(),
            None => return Ok(()),
        };
        match err {
            Ok(None) => {
                let c_sd = self.conns[s_sd as usize].peer_c_sd;
                self.conns[s_sd as usize].connect_state = ConnectState::Open;
                let ev = Event::control(Direction::ServerToClient, Kind::NewConnect, c_sd, s_sd);
                self.emit_control(ev)
            }
            _ => self.fail_connect(s_sd),
        }
    }

    fn fail_connect(&mut self, s_sd: i32) -> Result<(), EngineError> {
        let c_sd = match self.conns.get(s_sd as usize) {
            Some(c) => c.peer_c_sd,
            None => return Ok(()),
        };
        self.conns.remove(s_sd as usize);
        if self.conns.is_empty() {
            self.deregister_outbound();
        }
        self.reply_not_connect(c_sd, s_sd)
    }

    fn close_on_peer_request(&mut self, s_sd: i32) -> Result<(), EngineError> {
        let drained = match self.conns.get_mut(s_sd as usize) {
            Some(conn) => {
                if conn.queue.is_empty() {
                    true
                } else {
                    conn.close_state = CloseState::Closing;
                    false
                }
            }
            None => return Ok(()),
        };
        if drained {
            self.force_close(s_sd, false)?;
        }
        Ok(())
    }

    fn service_conn(&mut self, token: Token, r: Ready) -> Result<(), EngineError> {
        let s_sd = (token.0 - TOKEN_BASE) as i32;
        if r.error {
            return self.force_close(s_sd, true);
        }
        let connecting = matches!(
            self.conns.get(s_sd as usize).map(|c| c.connect_state),
            Some(ConnectState::Connecting { .. })
        );
        if connecting {
            if r.writable {
                self.complete_connect(s_sd)?;
            }
            return Ok(());
        }
        if r.writable {
            self.on_upstream_writable(s_sd)?;
        }
        if r.readable {
            self.on_upstream_readable(s_sd)?;
        }
        Ok(())
    }

    fn on_upstream_writable(&mut self, s_sd: i32) -> Result<(), EngineError> {
        let outcome = match self.conns.get_mut(s_sd as usize) {
            Some(conn) => conn.queue.flush(&mut conn.stream),
            None => return Ok(()),
        };
        match outcome {
            Ok(FlushOutcome::Drained) => {
                let should_close = self
                    .conns
                    .get(s_sd as usize)
                    .map(|c| c.close_state == CloseState::Closing)
                    .unwrap_or(false);
                if should_close {
                    self.force_close(s_sd, false)?;
                }
            }
            Ok(FlushOutcome::WouldBlock) => {}
            Err(_) => {
                self.force_close(s_sd, true)?;
            }
        }
        Ok(())
    }

    fn on_upstream_readable(&mut self, s_sd: i32) -> Result<(), EngineError> {
        let data_ok = self.to_client.has_data_headroom().unwrap_or(false)
            && self.to_worker.has_data_headroom().unwrap_or(false);
        if !data_ok {
            return Ok(());
        }

        let mut buf = [0u8; BUF_CAP];
        let read_result = match self.conns.get_mut(s_sd as usize) {
            Some(conn) => conn.stream.read(&mut buf),
            None => return Ok(()),
        };

        match read_result {
            Ok(0) => self.force_close(s_sd, true),
            Ok(n) => {
                let c_sd = self.conns[s_sd as usize].peer_c_sd;
                let ev = Event::data(Direction::ServerToClient, c_sd, s_sd, buf[..n].to_vec());
                self.to_client.send(&ev)?;
                let worker_ev = Event::data(Direction::ServerToWorker, c_sd, s_sd, buf[..n].to_vec());
                self.to_worker.send(&worker_ev)?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => self.force_close(s_sd, true),
        }
    }

    /// §4.5 orderly close protocol, initiated locally.
    fn force_close(&mut self, s_sd: i32, notify_peer: bool) -> Result<(), EngineError> {
        if !self.conns.contains(s_sd as usize) {
            return Ok(());
        }
        let mut conn = self.conns.remove(s_sd as usize);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        let (sent, recv, _buffered, lost) = conn.queue.close_and_account_lost();
        tracing::info!(s_sd, c_sd = conn.peer_c_sd, sent, recv, lost, "upstream connection closed");
        if self.conns.is_empty() {
            self.deregister_outbound();
        }
        if notify_peer {
            let ev = Event::control(Direction::ServerToClient, Kind::Disconnect, conn.peer_c_sd, s_sd);
            self.emit_control(ev)?;
        }
        Ok(())
    }
}

fn deliver_data(conn: &mut UpstreamConn, payload: &[u8]) -> io::Result<()> {
    conn.queue.record_recv(payload.len());
    if conn.queue.is_empty() {
        conn.queue.try_send_direct(&mut conn.stream, payload)?;
    } else {
        conn.queue.push(payload.to_vec());
        conn.queue.flush(&mut conn.stream)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connect_state_starts_connecting() {
        let state = ConnectState::Connecting {
            since: Instant::now(),
        };
        assert!(matches!(state, ConnectState::Connecting { .. }));
    }
}
