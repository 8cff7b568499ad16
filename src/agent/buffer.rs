//! Sequenced output buffering with at-least-once delivery.
//!
//! Captured lines are staged until a flush trigger (elapsed time or
//! accumulated bytes), then packed into numbered output messages. A packed
//! message is retained until a cumulative ack covers its sequence number;
//! `sync_response` rewinds delivery to the server's contiguous prefix and
//! the retained tail is replayed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::OutputStream;

/// A packed output message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutput {
    pub seq: u64,
    pub stream: OutputStream,
    pub data: String,
}

#[derive(Debug)]
pub struct OutputBuffer {
    staged: Vec<(OutputStream, String)>,
    staged_bytes: usize,
    pending: VecDeque<PendingOutput>,
    next_seq: u64,
    acked: u64,
    last_flush: Instant,
    flush_interval: Duration,
    flush_max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(flush_interval: Duration, flush_max_bytes: usize) -> Self {
        Self {
            staged: Vec::new(),
            staged_bytes: 0,
            pending: VecDeque::new(),
            next_seq: 1,
            acked: 0,
            last_flush: Instant::now(),
            flush_interval,
            flush_max_bytes,
        }
    }

    /// Stage one captured line (with its trailing newline).
    pub fn push(&mut self, stream: OutputStream, line: String) {
        self.staged_bytes += line.len();
        self.staged.push((stream, line));
    }

    /// A flush is due when lines are staged and either threshold tripped.
    pub fn flush_due(&self) -> bool {
        !self.staged.is_empty()
            && (self.last_flush.elapsed() >= self.flush_interval
                || self.staged_bytes >= self.flush_max_bytes)
    }

    /// Pack every staged line into numbered messages, one per contiguous
    /// run of the same stream so the tag stays truthful. Returns the newly
    /// packed messages; they are also retained until acked.
    pub fn flush(&mut self) -> Vec<PendingOutput> {
        self.last_flush = Instant::now();
        if self.staged.is_empty() {
            return Vec::new();
        }
        let mut packed: Vec<PendingOutput> = Vec::new();
        for (stream, line) in self.staged.drain(..) {
            match packed.last_mut() {
                Some(last) if last.stream == stream => last.data.push_str(&line),
                _ => {
                    packed.push(PendingOutput {
                        seq: 0,
                        stream,
                        data: line,
                    });
                }
            }
        }
        self.staged_bytes = 0;
        for msg in &mut packed {
            msg.seq = self.next_seq;
            self.next_seq += 1;
            self.pending.push_back(msg.clone());
        }
        packed
    }

    /// Cumulative acknowledgement; buffer clearing is monotonic, stale or
    /// duplicate acks are no-ops.
    pub fn ack(&mut self, seq: u64) {
        if seq <= self.acked {
            return;
        }
        self.acked = seq;
        while self
            .pending
            .front()
            .map(|p| p.seq <= seq)
            .unwrap_or(false)
        {
            self.pending.pop_front();
        }
    }

    /// The server holds a contiguous prefix up to `last_seq`: drop what it
    /// has, return everything after it for replay, in order.
    pub fn resync(&mut self, last_seq: u64) -> Vec<PendingOutput> {
        self.ack(last_seq);
        self.pending.iter().cloned().collect()
    }

    /// Everything sent but not yet acked, for replay after a reconnect.
    pub fn unacked(&self) -> Vec<PendingOutput> {
        self.pending.iter().cloned().collect()
    }

    pub fn is_drained(&self) -> bool {
        self.staged.is_empty() && self.pending.is_empty()
    }

    pub fn highest_acked(&self) -> u64 {
        self.acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> OutputBuffer {
        // Zero interval: every staged line is immediately flushable.
        OutputBuffer::new(Duration::from_millis(0), 4096)
    }

    #[test]
    fn sequences_start_at_one_and_are_contiguous() {
        let mut buf = buffer();
        buf.push(OutputStream::Stdout, "a\n".into());
        let first = buf.flush();
        buf.push(OutputStream::Stdout, "b\n".into());
        let second = buf.flush();
        assert_eq!(first[0].seq, 1);
        assert_eq!(second[0].seq, 2);
    }

    #[test]
    fn mixed_streams_pack_into_per_run_messages() {
        let mut buf = buffer();
        buf.push(OutputStream::Stdout, "1\n".into());
        buf.push(OutputStream::Stdout, "2\n".into());
        buf.push(OutputStream::Stderr, "oops\n".into());
        buf.push(OutputStream::Stdout, "3\n".into());
        let packed = buf.flush();
        assert_eq!(packed.len(), 3);
        assert_eq!(packed[0].data, "1\n2\n");
        assert_eq!(packed[0].stream, OutputStream::Stdout);
        assert_eq!(packed[1].data, "oops\n");
        assert_eq!(packed[1].stream, OutputStream::Stderr);
        assert_eq!(packed[2].seq, 3);
    }

    #[test]
    fn messages_are_retained_until_acked() {
        let mut buf = buffer();
        buf.push(OutputStream::Stdout, "a\n".into());
        buf.flush();
        buf.push(OutputStream::Stdout, "b\n".into());
        buf.flush();
        assert_eq!(buf.unacked().len(), 2);

        buf.ack(1);
        assert_eq!(buf.unacked().len(), 1);
        assert_eq!(buf.unacked()[0].seq, 2);

        buf.ack(2);
        assert!(buf.is_drained());
    }

    #[test]
    fn ack_is_cumulative_and_monotonic() {
        let mut buf = buffer();
        for i in 0..5 {
            buf.push(OutputStream::Stdout, format!("{i}\n"));
            buf.flush();
        }
        buf.ack(3);
        assert_eq!(buf.unacked().len(), 2);
        // A duplicate or stale ack changes nothing.
        buf.ack(3);
        buf.ack(1);
        assert_eq!(buf.unacked().len(), 2);
        assert_eq!(buf.highest_acked(), 3);
    }

    #[test]
    fn resync_replays_everything_past_the_servers_prefix() {
        let mut buf = buffer();
        for i in 1..=4 {
            buf.push(OutputStream::Stdout, format!("{i}\n"));
            buf.flush();
        }
        let replay = buf.resync(2);
        let seqs: Vec<u64> = replay.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        // The prefix the server confirmed is gone for good.
        assert_eq!(buf.unacked().len(), 2);
    }

    #[test]
    fn byte_threshold_triggers_flush() {
        let mut buf = OutputBuffer::new(Duration::from_secs(3600), 8);
        buf.push(OutputStream::Stdout, "tiny\n".into());
        assert!(!buf.flush_due());
        buf.push(OutputStream::Stdout, "more\n".into());
        assert!(buf.flush_due());
    }

    #[test]
    fn flush_with_nothing_staged_is_empty() {
        let mut buf = buffer();
        assert!(buf.flush().is_empty());
        assert!(buf.is_drained());
    }
}
