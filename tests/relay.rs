//! Black-box integration tests against a running [`Supervisor`], covering
//! the concrete end-to-end scenarios of spec §8.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sql_relay::config::Config;
use sql_relay::event::Event;
use sql_relay::supervisor::Supervisor;
use sql_relay::worker::WorkerSink;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<Event>>>);

impl WorkerSink for RecordingSink {
    fn observe(&mut self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn spawn_relay(config: Config, sink: RecordingSink) -> (Arc<Supervisor>, std::thread::JoinHandle<()>) {
    let supervisor = Arc::new(Supervisor::new(config));
    let sup = supervisor.clone();
    let handle = std::thread::spawn(move || {
        let _ = sup.run_with_sink(sink);
    });
    std::thread::sleep(Duration::from_millis(150));
    (supervisor, handle)
}

fn echo_upstream(port: u16, reply: &'static [u8]) -> std::thread::JoinHandle<()> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(reply);
        }
    })
}

#[test]
fn happy_path_relays_request_and_reply() {
    let upstream_port = free_port();
    let proxy_port = free_port();
    let upstream_handle = echo_upstream(upstream_port, b"PONG\n");

    let mut config = Config::default();
    config.proxy_port = proxy_port;
    config.server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, upstream_port);
    config.timeout_ms = 50;
    config.connect_timeout_ms = 1000;

    let sink = RecordingSink::default();
    let seen = sink.0.clone();
    let (supervisor, handle) = spawn_relay(config, sink);

    let mut client = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, proxy_port)).unwrap();
    client.write_all(b"PING\n").unwrap();

    let mut buf = [0u8; 64];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"PONG\n");

    std::thread::sleep(Duration::from_millis(100));
    let events = seen.lock().unwrap();
    assert!(events.iter().any(|e| e.kind == sql_relay::event::Kind::NewConnect));
    assert!(events
        .iter()
        .any(|e| e.kind == sql_relay::event::Kind::Data && e.payload() == b"PING\n"));
    drop(events);

    supervisor.shutdown();
    let _ = handle.join();
    let _ = upstream_handle.join();
}

#[test]
fn upstream_refused_closes_downstream_socket() {
    let dead_port = free_port(); // nothing listens here
    let proxy_port = free_port();

    let mut config = Config::default();
    config.proxy_port = proxy_port;
    config.server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, dead_port);
    config.timeout_ms = 50;
    config.connect_timeout_ms = 500;

    let sink = RecordingSink::default();
    let seen = sink.0.clone();
    let (supervisor, handle) = spawn_relay(config, sink);

    let mut client = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, proxy_port)).unwrap();
    client.write_all(b"X").unwrap();

    let mut buf = [0u8; 16];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed after NOT_CONNECT");

    let events = seen.lock().unwrap();
    assert!(events.iter().any(|e| e.kind == sql_relay::event::Kind::NotConnect));
    drop(events);

    supervisor.shutdown();
    let _ = handle.join();
}

#[test]
fn partial_send_preserves_byte_ordering() {
    let upstream_port = free_port();
    let proxy_port = free_port();

    let mut config = Config::default();
    config.proxy_port = proxy_port;
    config.server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, upstream_port);
    config.timeout_ms = 50;

    let upstream_done = Arc::new(AtomicBool::new(false));
    let done = upstream_done.clone();
    let upstream_listener =
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, upstream_port)).unwrap();
    let upstream_handle = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = upstream_listener.accept() {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
                if buf.len() >= 64 * 1024 {
                    break;
                }
            }
            done.store(buf.len() == 64 * 1024, Ordering::SeqCst);
        }
    });

    let sink = RecordingSink::default();
    let (supervisor, handle) = spawn_relay(config, sink);

    let mut client = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, proxy_port)).unwrap();
    let payload = vec![0x42u8; 64 * 1024];
    client.write_all(&payload).unwrap();

    std::thread::sleep(Duration::from_millis(500));
    assert!(upstream_done.load(Ordering::SeqCst), "upstream must observe all 64KiB in order");

    supervisor.shutdown();
    let _ = handle.join();
    let _ = upstream_handle.join();
}

#[test]
fn connect_timeout_closes_downstream_socket() {
    let proxy_port = free_port();

    let mut config = Config::default();
    config.proxy_port = proxy_port;
    // TEST-NET-1 (RFC 5737), non-routable: the OS never completes nor
    // refuses the handshake, so only our own sweep_connect_timeouts()
    // can end it.
    config.server_addr = SocketAddrV4::new(Ipv4Addr::new(10, 255, 255, 1), 9);
    config.timeout_ms = 20;
    config.connect_timeout_ms = 150;

    let sink = RecordingSink::default();
    let seen = sink.0.clone();
    let (supervisor, handle) = spawn_relay(config, sink);

    let mut client = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, proxy_port)).unwrap();
    client.write_all(b"X").unwrap();

    let mut buf = [0u8; 16];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed after the connect times out");

    let events = seen.lock().unwrap();
    assert!(events.iter().any(|e| e.kind == sql_relay::event::Kind::NotConnect));
    drop(events);

    supervisor.shutdown();
    let _ = handle.join();
}

#[test]
fn downstream_vanish_mid_transfer_closes_upstream() {
    let upstream_port = free_port();
    let proxy_port = free_port();

    let upstream_saw_close = Arc::new(AtomicBool::new(false));
    let saw_close = upstream_saw_close.clone();
    let upstream_listener =
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, upstream_port)).unwrap();
    let upstream_handle = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = upstream_listener.accept() {
            // Slow reader: give the downstream socket time to vanish before
            // we ever touch it.
            std::thread::sleep(Duration::from_millis(300));
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        saw_close.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => {
                        saw_close.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    });

    let mut config = Config::default();
    config.proxy_port = proxy_port;
    config.server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, upstream_port);
    config.timeout_ms = 20;
    config.connect_timeout_ms = 1000;

    let sink = RecordingSink::default();
    let seen = sink.0.clone();
    let (supervisor, handle) = spawn_relay(config, sink);

    let mut client = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, proxy_port)).unwrap();
    client.write_all(b"partial request that never gets a reply").unwrap();
    // Vanish mid-transfer: no FIN, just a hard reset.
    client.set_linger(Some(Duration::from_secs(0))).unwrap();
    drop(client);

    std::thread::sleep(Duration::from_millis(600));
    assert!(upstream_saw_close.load(Ordering::SeqCst), "upstream must observe the vanished downstream");

    let events = seen.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == sql_relay::event::Kind::Disconnect
            && e.direction == sql_relay::event::Direction::ClientToServer));
    drop(events);

    supervisor.shutdown();
    let _ = handle.join();
    let _ = upstream_handle.join();
}
