//! The fixed-size `Event` record exchanged between the three engines.
//!
//! `RawEvent` is the wire shape: a `#[repr(C)]` struct zerocopy can view as
//! `&[u8]` with no per-field serialization, matching the "one write = one
//! record" contract of a channel (see [`crate::channel`]). [`Event`] is the
//! ergonomic, typed view application code actually works with; the two
//! convert via `TryFrom`/`From`.

use std::net::{Ipv4Addr, SocketAddrV4};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Capacity of the opaque payload region, in bytes. Mirrors
/// `DATA_BUFFER_SIZE` in `original_source/proxy_impl.hpp`.
pub const BUF_CAP: usize = 10_240;

/// Compile-time bound on the number of descriptors (sockets + channels) a
/// single engine's poll set may hold. Mirrors `POLLING_REQUESTS_SIZE`.
pub const POLL_CAP: usize = 1_000;

/// Wire size of one `Event` record, in bytes. Every channel write transmits
/// exactly this many bytes.
pub const RECORD_SIZE: usize = std::mem::size_of::<RawEvent>();

/// Routing direction of an `Event`. Authoritative for dispatch: a receiver
/// that observes a direction it did not expect on a given channel treats it
/// as an internal error (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Unknown = 0,
    ClientToServer = 1,
    ServerToClient = 2,
    ClientToWorker = 3,
    WorkerToClient = 4,
    ServerToWorker = 5,
    WorkerToServer = 6,
}

impl Direction {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Unknown,
            1 => Self::ClientToServer,
            2 => Self::ServerToClient,
            3 => Self::ClientToWorker,
            4 => Self::WorkerToClient,
            5 => Self::ServerToWorker,
            6 => Self::WorkerToServer,
            _ => return None,
        })
    }
}

/// Event kind. `kind == Data` implies a non-zero `buffer_len` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Unknown = 0,
    NewConnect = 1,
    Disconnect = 2,
    Data = 3,
    NotConnect = 4,
    ConnectNotFound = 5,
    Other = 6,
}

impl Kind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Unknown,
            1 => Self::NewConnect,
            2 => Self::Disconnect,
            3 => Self::Data,
            4 => Self::NotConnect,
            5 => Self::ConnectNotFound,
            6 => Self::Other,
            _ => return None,
        })
    }

    /// Control events are never subject to the DATA-headroom gate of §4.1.
    pub fn is_control(self) -> bool {
        !matches!(self, Kind::Data | Kind::Unknown)
    }
}

/// Wire form of a zero-filled-when-unknown IPv4 endpoint triple.
#[derive(Debug, Clone, Copy, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RawEndpoint {
    addr: [u8; 4],
    port: u16,
    _pad: [u8; 2],
}

impl From<SocketAddrV4> for RawEndpoint {
    fn from(a: SocketAddrV4) -> Self {
        Self {
            addr: a.ip().octets(),
            port: a.port(),
            _pad: [0; 2],
        }
    }
}

impl From<RawEndpoint> for SocketAddrV4 {
    fn from(r: RawEndpoint) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(r.addr), r.port)
    }
}

/// Wire shape of [`Event`]. `#[repr(C)]` plus zerocopy traits give it a
/// provable, constant, platform-stable layout so a single `write(2)` of
/// `event.as_bytes()` is the whole record.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RawEvent {
    direction: u8,
    kind: u8,
    _pad0: [u8; 2],
    c_sd: i32,
    s_sd: i32,
    buffer_len: u32,
    buffer: [u8; BUF_CAP],
    client_addr: RawEndpoint,
    proxy_addr: RawEndpoint,
    server_addr: RawEndpoint,
}

/// Error returned when a decoded [`RawEvent`] carries a `direction` or
/// `kind` tag outside the known enumeration (§7 "Protocol-internal").
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown direction tag {0}")]
    UnknownDirection(u8),
    #[error("unknown kind tag {0}")]
    UnknownKind(u8),
    #[error("buffer_len {0} exceeds BUF_CAP {BUF_CAP}")]
    BufferLenOverflow(u32),
}

/// The ergonomic, typed `Event` record described in spec.md §3.
#[derive(Debug, Clone)]
pub struct Event {
    pub direction: Direction,
    pub kind: Kind,
    /// Integer handle identifying the client-side socket, or `-1`.
    pub c_sd: i32,
    /// Integer handle identifying the server-side socket, or `-1`.
    pub s_sd: i32,
    payload: Vec<u8>,
    pub client_addr: Option<SocketAddrV4>,
    pub proxy_addr: Option<SocketAddrV4>,
    pub server_addr: Option<SocketAddrV4>,
}

impl Event {
    /// Builds a control event (`buffer_len == 0`).
    pub fn control(direction: Direction, kind: Kind, c_sd: i32, s_sd: i32) -> Self {
        Self {
            direction,
            kind,
            c_sd,
            s_sd,
            payload: Vec::new(),
            client_addr: None,
            proxy_addr: None,
            server_addr: None,
        }
    }

    /// Builds a `DATA` event. Panics if `payload` is empty or exceeds
    /// [`BUF_CAP`] — both are caller bugs, not runtime conditions (§3:
    /// `kind == DATA` implies `buffer_len > 0`).
    pub fn data(direction: Direction, c_sd: i32, s_sd: i32, payload: Vec<u8>) -> Self {
        assert!(!payload.is_empty(), "DATA event requires a non-empty payload");
        assert!(payload.len() <= BUF_CAP, "DATA payload exceeds BUF_CAP");
        Self {
            direction,
            kind: Kind::Data,
            c_sd,
            s_sd,
            payload,
            client_addr: None,
            proxy_addr: None,
            server_addr: None,
        }
    }

    /// Returns a copy of this event re-tagged with a different `direction`,
    /// for mirroring the same payload to a second recipient (e.g. CLIENT
    /// mirroring a client-bound event to WORKER).
    pub fn retargeted(&self, direction: Direction) -> Self {
        let mut copy = self.clone();
        copy.direction = direction;
        copy
    }

    pub fn with_addrs(
        mut self,
        client_addr: Option<SocketAddrV4>,
        proxy_addr: Option<SocketAddrV4>,
        server_addr: Option<SocketAddrV4>,
    ) -> Self {
        self.client_addr = client_addr;
        self.proxy_addr = proxy_addr;
        self.server_addr = server_addr;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn buffer_len(&self) -> usize {
        self.payload.len()
    }

    /// Encodes this event into its fixed-size wire record.
    pub fn to_raw(&self) -> RawEvent {
        let mut buffer = [0u8; BUF_CAP];
        buffer[..self.payload.len()].copy_from_slice(&self.payload);
        RawEvent {
            direction: self.direction as u8,
            kind: self.kind as u8,
            _pad0: [0; 2],
            c_sd: self.c_sd,
            s_sd: self.s_sd,
            buffer_len: self.payload.len() as u32,
            buffer,
            client_addr: self.client_addr.map(RawEndpoint::from).unwrap_or_default(),
            proxy_addr: self.proxy_addr.map(RawEndpoint::from).unwrap_or_default(),
            server_addr: self.server_addr.map(RawEndpoint::from).unwrap_or_default(),
        }
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let direction =
            Direction::from_u8(raw.direction).ok_or(EventError::UnknownDirection(raw.direction))?;
        let kind = Kind::from_u8(raw.kind).ok_or(EventError::UnknownKind(raw.kind))?;
        if raw.buffer_len as usize > BUF_CAP {
            return Err(EventError::BufferLenOverflow(raw.buffer_len));
        }
        let payload = raw.buffer[..raw.buffer_len as usize].to_vec();
        let none_if_zero = |r: RawEndpoint| -> Option<SocketAddrV4> {
            if r.addr == [0; 4] && r.port == 0 {
                None
            } else {
                Some(r.into())
            }
        };
        Ok(Event {
            direction,
            kind,
            c_sd: raw.c_sd,
            s_sd: raw.s_sd,
            payload,
            client_addr: none_if_zero(raw.client_addr),
            proxy_addr: none_if_zero(raw.proxy_addr),
            server_addr: none_if_zero(raw.server_addr),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_size_is_constant_and_dominated_by_buf_cap() {
        assert!(RECORD_SIZE >= BUF_CAP);
        assert!(RECORD_SIZE < BUF_CAP + 64);
    }

    #[test]
    fn control_event_round_trips() {
        let ev = Event::control(Direction::ClientToServer, Kind::NewConnect, 3, -1);
        let raw = ev.to_raw();
        let back = Event::try_from(raw).unwrap();
        assert_eq!(back.c_sd, 3);
        assert_eq!(back.s_sd, -1);
        assert_eq!(back.buffer_len(), 0);
        assert_eq!(back.kind, Kind::NewConnect);
    }

    #[test]
    fn data_event_round_trips_payload_exactly() {
        let ev = Event::data(Direction::ClientToServer, 1, 2, b"PING\n".to_vec());
        let raw = ev.to_raw();
        let back = Event::try_from(raw).unwrap();
        assert_eq!(back.payload(), b"PING\n");
        assert_eq!(back.kind, Kind::Data);
    }

    #[test]
    fn unknown_direction_tag_is_rejected() {
        let mut raw = Event::control(Direction::Unknown, Kind::Other, 0, 0).to_raw();
        raw.direction = 200;
        assert!(matches!(
            Event::try_from(raw),
            Err(EventError::UnknownDirection(200))
        ));
    }

    #[test]
    fn addr_triple_round_trips_and_zero_maps_to_none() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4880);
        let ev = Event::control(Direction::ClientToWorker, Kind::NewConnect, 1, -1)
            .with_addrs(Some(addr), None, None);
        let back = Event::try_from(ev.to_raw()).unwrap();
        assert_eq!(back.client_addr, Some(addr));
        assert_eq!(back.proxy_addr, None);
    }

    #[test]
    fn is_control_excludes_only_data_and_unknown() {
        assert!(Kind::NewConnect.is_control());
        assert!(Kind::Disconnect.is_control());
        assert!(Kind::NotConnect.is_control());
        assert!(Kind::ConnectNotFound.is_control());
        assert!(!Kind::Data.is_control());
        assert!(!Kind::Unknown.is_control());
    }
}
