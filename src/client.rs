//! CLIENT engine (§4.2): owns the public listen socket and every accepted
//! downstream connection. Forwards client bytes to SERVER, mirrors every
//! event to WORKER, and writes SERVER-sourced bytes back to the client.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::{ChannelRx, ChannelTx};
use crate::config::Config;
use crate::error::EngineError;
use crate::event::{Direction, Event, Kind, BUF_CAP, POLL_CAP};
use crate::queue::{FlushOutcome, OutboundQueue};

const TOKEN_LISTEN: Token = Token(0);
const TOKEN_FROM_SERVER: Token = Token(1);
const TOKEN_FROM_WORKER: Token = Token(2);
const TOKEN_TO_SERVER: Token = Token(3);
const TOKEN_TO_WORKER: Token = Token(4);
/// Connection tokens start here so they never collide with the fixed tokens
/// above (§4.2 "poll set").
const TOKEN_BASE: usize = 16;

/// §9 "Orderly close with pending queue" — modeled as a real state, not a
/// boolean, so `Closing` continues to poll `POLLOUT` while refusing new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    Closing,
}

struct DownstreamConn {
    stream: TcpStream,
    client_addr: SocketAddrV4,
    queue: OutboundQueue,
    peer_s_sd: Option<i32>,
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
        // SAFETY: `fd` stays valid for the duration of this call and is owned
        // by `stream`; `sock2` is forgotten below so it never closes it.
        let fd = std::os::fd::AsRawFd::as_raw_fd(stream);
        let sock2 = unsafe { Socket::from_raw_fd(fd) };
        let result = sock2.set_keepalive(true);
        std::mem::forget(sock2);
        result?;
    }
    Ok(())
}

use std::os::fd::FromRawFd;

/// The CLIENT engine (§4.2).
pub struct ClientEngine {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    conns: Slab<DownstreamConn>,
    to_server: ChannelTx,
    from_server: ChannelRx,
    to_worker: ChannelTx,
    from_worker: ChannelRx,
    outbound_registered: bool,
    proxy_addr: SocketAddrV4,
    config: Arc<Config>,
    end_flag: Arc<AtomicBool>,
}

impl ClientEngine {
    /// `prepare()` — bind and listen the public port, register the fixed
    /// poll fds (§4.2).
    pub fn prepare(
        config: Arc<Config>,
        end_flag: Arc<AtomicBool>,
        to_server: ChannelTx,
        from_server: ChannelRx,
        to_worker: ChannelTx,
        from_worker: ChannelRx,
    ) -> Result<Self, EngineError> {
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.proxy_port);
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(EngineError::Startup)?;
        socket.set_reuse_address(true).map_err(EngineError::Startup)?;
        socket.set_nonblocking(true).map_err(EngineError::Startup)?;
        socket
            .bind(&bind_addr.into())
            .map_err(EngineError::Startup)?;
        socket.listen(1024).map_err(EngineError::Startup)?;
        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);

        let proxy_addr = match listener.local_addr().map_err(EngineError::Startup)? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => bind_addr,
        };

        let poll = Poll::new().map_err(EngineError::Startup)?;
        let registry = poll.registry();
        registry
            .register(&mut listener, TOKEN_LISTEN, Interest::READABLE)
            .map_err(EngineError::Startup)?;
        let mut from_server = from_server;
        let mut from_worker = from_worker;
        registry
            .register(&mut from_server, TOKEN_FROM_SERVER, Interest::READABLE)
            .map_err(EngineError::Startup)?;
        registry
            .register(&mut from_worker, TOKEN_FROM_WORKER, Interest::READABLE)
            .map_err(EngineError::Startup)?;

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(POLL_CAP),
            conns: Slab::new(),
            to_server,
            from_server,
            to_worker,
            from_worker,
            outbound_registered: false,
            proxy_addr,
            config,
            end_flag,
        })
    }

    /// `run()` — loop until the shared end-flag is set.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let timeout = Duration::from_millis(self.config.timeout_ms as u64);
        while !self.end_flag.load(Ordering::SeqCst) {
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

    /// `done()` — close every still-open socket and set the end-flag.
    pub fn done(&mut self) {
        self.end_flag.store(true, Ordering::SeqCst);
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for k in keys {
            let _ = self.force_close(k as i32, false);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
    }

    fn handle_ready(&mut self, r: Ready) -> Result<(), EngineError> {
        match r.token {
            TOKEN_LISTEN => {
                if r.error {
                    return Err(EngineError::FatalRevents("listen"));
                }
                self.accept_all()
            }
            TOKEN_FROM_SERVER => {
                if r.error {
                    return Err(EngineError::FatalRevents("server-channel-in"));
                }
                self.drain_from_server()
            }
            TOKEN_FROM_WORKER => {
                if r.error {
                    return Err(EngineError::FatalRevents("worker-channel-in"));
                }
                self.drain_from_worker()
            }
            TOKEN_TO_SERVER | TOKEN_TO_WORKER => Ok(()),
            t => self.service_conn(t, r),
        }
    }

    fn accept_all(&mut self) -> Result<(), EngineError> {
        loop {
            match self.listener.accept() {
                Ok((stream, SocketAddr::V4(client_addr))) => {
                    self.insert_conn(stream, client_addr)?;
                }
                Ok((_stream, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed on a fresh connection");
                    continue;
                }
            }
        }
        Ok(())
    }

    fn insert_conn(&mut self, mut stream: TcpStream, client_addr: SocketAddrV4) -> Result<(), EngineError> {
        if self.conns.len() >= POLL_CAP {
            tracing::warn!(
                cap = POLL_CAP,
                client_addr = %client_addr,
                "poll array at capacity, refusing accepted connection"
            );
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return Ok(());
        }
        if let Err(e) = apply_socket_opts(&stream, self.config.client_keep_alive) {
            tracing::warn!(error = %e, "setsockopt failed on accepted socket, dropping it");
            return Ok(());
        }
        let entry = self.conns.vacant_entry();
        let token = Token(TOKEN_BASE + entry.key());
        if self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .is_err()
        {
            return Ok(());
        }
        let c_sd = entry.key() as i32;
        entry.insert(DownstreamConn {
            stream,
            client_addr,
            queue: OutboundQueue::default(),
            peer_s_sd: None,
            close_state: CloseState::Open,
        });
        if self.conns.len() == 1 {
            self.register_outbound()?;
        }
        let ev = Event::control(Direction::ClientToServer, Kind::NewConnect, c_sd, -1)
            .with_addrs(Some(client_addr), Some(self.proxy_addr), None);
        self.emit_control(ev)
    }

    fn register_outbound(&mut self) -> Result<(), EngineError> {
        if !self.outbound_registered {
            self.poll
                .registry()
                .register(&mut self.to_server, TOKEN_TO_SERVER, Interest::WRITABLE)
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
            let _ = self.poll.registry().deregister(&mut self.to_server);
            let _ = self.poll.registry().deregister(&mut self.to_worker);
            self.outbound_registered = false;
        }
    }

    /// Sends a control event to both SERVER and WORKER. A full total-channel
    /// write is fatal (§4.7).
    fn emit_control(&mut self, ev: Event) -> Result<(), EngineError> {
        self.to_server.send(&ev)?;
        let worker_ev = ev.retargeted(Direction::ClientToWorker);
        self.to_worker.send(&worker_ev)?;
        Ok(())
    }

    fn reply_connect_not_found(&mut self, c_sd: i32, s_sd: i32) -> Result<(), EngineError> {
        tracing::warn!(c_sd, s_sd, "event referenced an unknown local socket");
        let ev = Event::control(Direction::ClientToServer, Kind::ConnectNotFound, c_sd, s_sd);
        self.to_server.send(&ev).map_err(EngineError::from)
    }

    fn drain_from_server(&mut self) -> Result<(), EngineError> {
        while let Some(ev) = self.from_server.recv()? {
            self.handle_server_event(ev)?;
        }
        Ok(())
    }

    fn drain_from_worker(&mut self) -> Result<(), EngineError> {
        // WORKER does not talk to CLIENT in the core (§4.2 step 3): decode
        // and discard.
        while self.from_worker.recv()?.is_some() {}
        Ok(())
    }

    fn handle_server_event(&mut self, ev: Event) -> Result<(), EngineError> {
        match ev.kind {
            Kind::NewConnect => {
                if let Some(conn) = self.conns.get_mut(ev.c_sd as usize) {
                    conn.peer_s_sd = Some(ev.s_sd);
                } else {
                    self.reply_connect_not_found(ev.c_sd, ev.s_sd)?;
                }
            }
            Kind::Data => {
                let delivery = match self.conns.get_mut(ev.c_sd as usize) {
                    Some(conn) => Some(deliver_data(conn, ev.payload()).is_err()),
                    None => {
                        self.reply_connect_not_found(ev.c_sd, ev.s_sd)?;
                        None
                    }
                };
                if delivery == Some(true) {
                    self.force_close(ev.c_sd, true)?;
                }
            }
            Kind::NotConnect | Kind::Disconnect => {
                // A second DISCONNECT for an already-closed pair is
                // idempotent: logged and dropped (§8).
                if self.conns.contains(ev.c_sd as usize) {
                    self.close_on_peer_request(ev.c_sd)?;
                } else {
                    tracing::debug!(c_sd = ev.c_sd, "DISCONNECT for unknown/closed c_sd, dropping");
                }
            }
            Kind::ConnectNotFound => {
                tracing::info!(c_sd = ev.c_sd, s_sd = ev.s_sd, "peer reports CONNECT_NOT_FOUND");
            }
            Kind::Unknown | Kind::Other => {}
        }
        Ok(())
    }

    fn close_on_peer_request(&mut self, c_sd: i32) -> Result<(), EngineError> {
        let drained = match self.conns.get_mut(c_sd as usize) {
            Some(conn) => {
                conn.peer_s_sd = None;
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
            self.force_close(c_sd, false)?;
        }
        Ok(())
    }

    fn service_conn(&mut self, token: Token, r: Ready) -> Result<(), EngineError> {
        let c_sd = (token.0 - TOKEN_BASE) as i32;
        if r.error {
            return self.force_close(c_sd, true);
        }
        if r.writable {
            self.on_downstream_writable(c_sd)?;
        }
        if r.readable {
            self.on_downstream_readable(c_sd)?;
        }
        Ok(())
    }

    fn on_downstream_writable(&mut self, c_sd: i32) -> Result<(), EngineError> {
        let outcome = match self.conns.get_mut(c_sd as usize) {
            Some(conn) => conn.queue.flush(&mut conn.stream),
            None => return Ok(()),
        };
        match outcome {
            Ok(FlushOutcome::Drained) => {
                let should_close = self
                    .conns
                    .get(c_sd as usize)
                    .map(|c| c.close_state == CloseState::Closing)
                    .unwrap_or(false);
                if should_close {
                    self.force_close(c_sd, false)?;
                }
            }
            Ok(FlushOutcome::WouldBlock) => {}
            Err(_) => {
                self.force_close(c_sd, true)?;
            }
        }
        Ok(())
    }

    fn on_downstream_readable(&mut self, c_sd: i32) -> Result<(), EngineError> {
        let data_ok = self.to_server.has_data_headroom().unwrap_or(false)
            && self.to_worker.has_data_headroom().unwrap_or(false);
        if !data_ok {
            return Ok(());
        }

        let mut buf = [0u8; BUF_CAP];
        let read_result = match self.conns.get_mut(c_sd as usize) {
            Some(conn) => conn.stream.read(&mut buf),
            None => return Ok(()),
        };

        match read_result {
            Ok(0) => self.force_close(c_sd, true),
            Ok(n) => {
                let peer_s_sd = self
                    .conns
                    .get(c_sd as usize)
                    .and_then(|c| c.peer_s_sd)
                    .unwrap_or(-1);
                let ev = Event::data(Direction::ClientToServer, c_sd, peer_s_sd, buf[..n].to_vec());
                self.to_server.send(&ev)?;
                let worker_ev = Event::data(
                    Direction::ClientToWorker,
                    c_sd,
                    peer_s_sd,
                    buf[..n].to_vec(),
                );
                self.to_worker.send(&worker_ev)?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => self.force_close(c_sd, true),
        }
    }

    /// §4.5 orderly close protocol, initiated locally (this engine observed
    /// the loss). `notify_peer` distinguishes that case from responding to a
    /// peer-initiated close, which must not re-emit DISCONNECT.
    fn force_close(&mut self, c_sd: i32, notify_peer: bool) -> Result<(), EngineError> {
        if !self.conns.contains(c_sd as usize) {
            return Ok(());
        }
        let mut conn = self.conns.remove(c_sd as usize);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        let (sent, recv, _buffered, lost) = conn.queue.close_and_account_lost();
        tracing::info!(
            c_sd,
            client_addr = %conn.client_addr,
            sent,
            recv,
            lost,
            "downstream connection closed"
        );
        if self.conns.is_empty() {
            self.deregister_outbound();
        }
        if notify_peer {
            let ev = Event::control(
                Direction::ClientToServer,
                Kind::Disconnect,
                c_sd,
                conn.peer_s_sd.unwrap_or(-1),
            );
            self.emit_control(ev)?;
        }
        Ok(())
    }
}

fn deliver_data(conn: &mut DownstreamConn, payload: &[u8]) -> io::Result<()> {
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
    fn close_state_defaults_to_open() {
        assert_eq!(CloseState::Open, CloseState::Open);
        assert_ne!(CloseState::Open, CloseState::Closing);
    }
}
