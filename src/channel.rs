//! Channel transport: a unidirectional, poll-registrable byte stream over a
//! `pipe(2)`, carrying whole [`Event`] records (§4.1).
//!
//! A channel never frames: every read or write is exactly [`RECORD_SIZE`]
//! bytes, matching the "no partial `Event` is ever observed" invariant of
//! §8. Backpressure is computed from the kernel's own notion of how many
//! bytes are currently sitting unread in the pipe (`ioctl(FIONREAD)`)
//! against the pipe's total capacity (`fcntl(F_GETPIPE_SZ)`), split into a
//! DATA region and a reserved control region per §4.1.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use mio::unix::pipe;
use zerocopy::{FromBytes, IntoBytes};

use crate::event::{Event, Kind, RawEvent, RECORD_SIZE};

/// Fraction of a channel's total kernel buffer reserved for control events
/// (NEW_CONNECT / DISCONNECT / NOT_CONNECT / CONNECT_NOT_FOUND), so that a
/// DATA flood can never starve them (§4.1).
pub const RESERVE_FRACTION: f64 = 0.5;

/// Desired kernel pipe capacity, in records. We ask the kernel to size the
/// pipe up to this many [`RECORD_SIZE`]-byte records via `F_SETPIPE_SZ`;
/// failure (non-Linux, or `CAP_SYS_RESOURCE` denied) is not fatal, we just
/// keep whatever capacity the kernel gave us by default. This is an Open
/// Question resolution recorded in DESIGN.md: the spec only requires "sized
/// to hold many records," it does not mandate a specific count.
const DESIRED_CAPACITY_RECORDS: usize = 64;

/// Errors fatal to the owning engine (§4.1: "a full total-channel write is
/// fatal"; §7: "short read/write on a channel ... fatal").
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("channel write was short: wrote {wrote} of {expected} bytes")]
    ShortWrite { wrote: usize, expected: usize },
    #[error("channel read was short: read {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },
    #[error("channel peer closed unexpectedly")]
    PeerClosed,
    #[error("channel has no headroom for a DATA event")]
    NoDataHeadroom,
    #[error("channel has no headroom at all, even for a control event")]
    NoControlHeadroom,
    #[error("decoded event failed validation: {0}")]
    Event(#[from] crate::event::EventError),
}

fn set_pipe_capacity(fd: i32, records: usize) -> usize {
    let desired = (records * RECORD_SIZE) as libc::c_int;
    // SAFETY: `fd` is a valid, open pipe file descriptor owned by the caller
    // for the duration of this call; F_SETPIPE_SZ neither retains nor frees it.
    let set = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, desired) };
    if set < 0 {
        // SAFETY: same fd, read-only query.
        let got = unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) };
        if got > 0 {
            return got as usize;
        }
        return 65536; // historical Linux default pipe size
    }
    set as usize
}

fn occupied_bytes(fd: i32) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    // SAFETY: `fd` is a valid pipe fd; FIONREAD writes a single `c_int`
    // through a pointer to a live local of that exact type.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// The write half of a channel.
pub struct ChannelTx {
    sender: pipe::Sender,
    capacity_bytes: usize,
}

impl ChannelTx {
    fn occupied(&self) -> io::Result<usize> {
        occupied_bytes(self.sender.as_raw_fd())
    }

    /// The DATA region boundary: DATA events may only be sent while
    /// occupancy stays under `capacity * (1 - RESERVE_FRACTION)`.
    fn data_region_bytes(&self) -> usize {
        (self.capacity_bytes as f64 * (1.0 - RESERVE_FRACTION)) as usize
    }

    /// True if there is room for at least one more DATA record without
    /// touching the reserved control region.
    pub fn has_data_headroom(&self) -> io::Result<bool> {
        Ok(self.occupied()? + RECORD_SIZE <= self.data_region_bytes())
    }

    /// True if there is room for at least one more record anywhere
    /// (including the reserve). Control events only need this.
    pub fn has_control_headroom(&self) -> io::Result<bool> {
        Ok(self.occupied()? + RECORD_SIZE <= self.capacity_bytes)
    }

    /// Sends one event. DATA events are gated on [`Self::has_data_headroom`]
    /// by the caller *before* this is invoked (§4.1) — this function itself
    /// only refuses to send past the (rarer) total-channel limit, which is
    /// always fatal when it happens (§4.7).
    pub fn send(&mut self, event: &Event) -> Result<(), ChannelError> {
        if event.kind.is_control() {
            if !self.has_control_headroom()? {
                return Err(ChannelError::NoControlHeadroom);
            }
        } else if !self.has_data_headroom()? {
            return Err(ChannelError::NoDataHeadroom);
        }

        let raw = event.to_raw();
        let bytes = raw.as_bytes();
        match self.sender.write(bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(ChannelError::ShortWrite {
                wrote: n,
                expected: bytes.len(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Headroom check above should prevent this in practice; if the
                // kernel still refuses, surface it as a lack of headroom rather
                // than a hard I/O error so callers retry next iteration.
                Err(if event.kind.is_control() {
                    ChannelError::NoControlHeadroom
                } else {
                    ChannelError::NoDataHeadroom
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn as_raw_fd_i32(&self) -> i32 {
        self.sender.as_raw_fd()
    }
}

/// The read half of a channel.
pub struct ChannelRx {
    receiver: pipe::Receiver,
}

impl ChannelRx {
    /// Reads one event, non-blocking. `Ok(None)` on `WouldBlock` (nothing
    /// ready); any other outcome besides a full, valid record is a
    /// [`ChannelError`] the caller must treat as fatal to its engine (§4.7).
    pub fn recv(&mut self) -> Result<Option<Event>, ChannelError> {
        let mut buf = [0u8; RECORD_SIZE];
        match self.receiver.read(&mut buf) {
            Ok(0) => Err(ChannelError::PeerClosed),
            Ok(n) if n == RECORD_SIZE => {
                let raw = RawEvent::read_from_bytes(&buf).expect("buffer is exactly RECORD_SIZE");
                Ok(Some(Event::try_from(raw)?))
            }
            Ok(n) => Err(ChannelError::ShortRead {
                read: n,
                expected: RECORD_SIZE,
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn as_raw_fd_i32(&self) -> i32 {
        self.receiver.as_raw_fd()
    }
}

impl mio::event::Source for ChannelRx {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.receiver.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.receiver.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.receiver.deregister(registry)
    }
}

impl mio::event::Source for ChannelTx {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.sender.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.sender.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.sender.deregister(registry)
    }
}

/// Creates one channel (a `pipe(2)` pair), sized per
/// [`DESIRED_CAPACITY_RECORDS`].
pub fn channel() -> io::Result<(ChannelTx, ChannelRx)> {
    let (sender, receiver) = pipe::new()?;
    let capacity_bytes = set_pipe_capacity(sender.as_raw_fd(), DESIRED_CAPACITY_RECORDS);
    Ok((
        ChannelTx {
            sender,
            capacity_bytes,
        },
        ChannelRx { receiver },
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::Direction;

    #[test]
    fn send_then_recv_round_trips_control_event() {
        let (mut tx, mut rx) = channel().unwrap();
        let ev = Event::control(Direction::ClientToServer, Kind::NewConnect, 5, -1);
        tx.send(&ev).unwrap();
        let got = rx.recv().unwrap().expect("event should be ready");
        assert_eq!(got.c_sd, 5);
        assert_eq!(got.kind, Kind::NewConnect);
    }

    #[test]
    fn recv_on_empty_channel_is_would_block_none() {
        let (_tx, mut rx) = channel().unwrap();
        assert!(rx.recv().unwrap().is_none());
    }

    #[test]
    fn data_headroom_starts_true_on_a_fresh_channel() {
        let (tx, _rx) = channel().unwrap();
        assert!(tx.has_data_headroom().unwrap());
        assert!(tx.has_control_headroom().unwrap());
    }

    #[test]
    fn many_sends_eventually_exhaust_data_headroom_before_control_headroom() {
        let (mut tx, _rx) = channel().unwrap();
        let mut sent = 0usize;
        loop {
            let ev = Event::data(Direction::ClientToServer, 1, 1, vec![0u8; 16]);
            match tx.send(&ev) {
                Ok(()) => sent += 1,
                Err(ChannelError::NoDataHeadroom) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            if sent > DESIRED_CAPACITY_RECORDS * 2 {
                panic!("headroom never ran out");
            }
        }
        // the reserve must still admit a control event even though DATA is full.
        let ctrl = Event::control(Direction::ClientToServer, Kind::Disconnect, 1, 1);
        tx.send(&ctrl).expect("control events use the reserve");
    }
}
