//! Per-connection outbound byte queue and counters (§3, §4.2, §4.3).
//!
//! `sent + lost <= recv_from_peer + buffered_initial` and `buffered ==
//! queue_byte_sum` are maintained as invariants by construction: every
//! mutation of `chunks` goes through [`OutboundQueue::push`] or
//! [`OutboundQueue::flush`], both of which keep `buffered` in lock-step.

use std::collections::VecDeque;
use std::io::{self, Write};

/// Byte-accurate bookkeeping for one socket's outbound direction, plus the
/// ordered chunk queue backing it. `lost` is written exactly once, at close
/// (§8 "`lost` is assigned exactly once, at close").
#[derive(Debug, Default)]
pub struct OutboundQueue {
    chunks: VecDeque<Vec<u8>>,
    sent: u64,
    recv: u64,
    buffered: u64,
    lost: u64,
}

/// Outcome of a [`OutboundQueue::flush`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The queue is now empty.
    Drained,
    /// `WouldBlock` was hit; some bytes may still remain queued.
    WouldBlock,
}

impl OutboundQueue {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn recv(&self) -> u64 {
        self.recv
    }

    pub fn buffered(&self) -> u64 {
        self.buffered
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Records bytes newly read from the source socket (S→C or C→S, as
    /// appropriate for the owning engine), before they are queued for send.
    pub fn record_recv(&mut self, n: usize) {
        self.recv += n as u64;
    }

    /// Appends a chunk to the back of the queue — new payload is always
    /// appended behind buffered payload, never interleaved (§4.2).
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.buffered += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }

    /// Attempts an immediate send of `data` with no queueing, for the empty-
    /// queue fast path described in §4.2/§4.3 ("if the per-socket queue is
    /// empty and the immediate send is partial or EWOULDBLOCK, enqueue the
    /// tail"). Returns `true` if the whole slice was sent.
    pub fn try_send_direct<W: Write>(&mut self, writer: &mut W, data: &[u8]) -> io::Result<bool> {
        debug_assert!(self.chunks.is_empty());
        match writer.write(data) {
            Ok(n) if n == data.len() => {
                self.sent += n as u64;
                Ok(true)
            }
            Ok(n) => {
                self.sent += n as u64;
                self.push(data[n..].to_vec());
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.push(data.to_vec());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drains as much of the front of the queue as the socket will currently
    /// accept. A partial `write` leaves the unsent tail as the new front of
    /// the queue, bytewise (§8 boundary behavior).
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushOutcome> {
        while let Some(front) = self.chunks.pop_front() {
            match writer.write(&front) {
                Ok(n) if n == front.len() => {
                    self.sent += n as u64;
                    self.buffered -= front.len() as u64;
                }
                Ok(n) => {
                    self.sent += n as u64;
                    self.buffered -= n as u64;
                    self.chunks.push_front(front[n..].to_vec());
                    return Ok(FlushOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.chunks.push_front(front);
                    return Ok(FlushOutcome::WouldBlock);
                }
                Err(e) => {
                    self.chunks.push_front(front);
                    return Err(e);
                }
            }
        }
        Ok(FlushOutcome::Drained)
    }

    /// Sums the remaining queued bytes into `lost` and drops the queue.
    /// Called exactly once, when the connection is torn down (§4.5 step 2).
    pub fn close_and_account_lost(&mut self) -> (u64, u64, u64, u64) {
        self.lost += self.buffered;
        self.chunks.clear();
        self.buffered = 0;
        (self.sent, self.recv, 0, self.lost)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Blocking;
    impl Write for Blocking {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Partial(usize);
    impl Write for Partial {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len().min(self.0))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn direct_send_would_block_enqueues_whole_chunk() {
        let mut q = OutboundQueue::default();
        let mut w = Blocking;
        let sent_all = q.try_send_direct(&mut w, b"hello").unwrap();
        assert!(!sent_all);
        assert_eq!(q.buffered(), 5);
        assert!(!q.is_empty());
    }

    #[test]
    fn partial_write_leaves_exact_remainder_at_front() {
        let mut q = OutboundQueue::default();
        q.push(b"0123456789".to_vec());
        let mut w = Partial(4);
        let outcome = q.flush(&mut w).unwrap();
        assert_eq!(outcome, FlushOutcome::WouldBlock);
        assert_eq!(q.sent(), 4);
        assert_eq!(q.buffered(), 6);
        // next flush continues from byte 4, not from the start
        let outcome2 = q.flush(&mut w).unwrap();
        assert_eq!(outcome2, FlushOutcome::WouldBlock);
        assert_eq!(q.sent(), 8);
        assert_eq!(q.buffered(), 2);
    }

    #[test]
    fn full_drain_reports_drained_and_zero_buffered() {
        let mut q = OutboundQueue::default();
        q.push(b"abc".to_vec());
        q.push(b"def".to_vec());
        struct Full;
        impl Write for Full {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let outcome = q.flush(&mut Full).unwrap();
        assert_eq!(outcome, FlushOutcome::Drained);
        assert_eq!(q.buffered(), 0);
        assert_eq!(q.sent(), 6);
        assert!(q.is_empty());
    }

    #[test]
    fn close_accounts_remaining_bytes_as_lost_exactly_once() {
        let mut q = OutboundQueue::default();
        q.push(b"lost-bytes".to_vec());
        let (sent, _recv, buffered_after, lost) = q.close_and_account_lost();
        assert_eq!(sent, 0);
        assert_eq!(buffered_after, 0);
        assert_eq!(lost, 10);
        assert_eq!(q.buffered(), 0);
    }

    #[test]
    fn ordering_never_interleaves_appended_payload_ahead_of_buffered() {
        let mut q = OutboundQueue::default();
        q.push(b"first".to_vec());
        q.push(b"second".to_vec());
        let mut out = Vec::new();
        struct Collect<'a>(&'a mut Vec<u8>);
        impl<'a> Write for Collect<'a> {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        q.flush(&mut Collect(&mut out)).unwrap();
        assert_eq!(out, b"firstsecond");
    }
}
