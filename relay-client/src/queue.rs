use bytes::Bytes;
use relay_proto::{RelayError, Result};
use std::collections::VecDeque;

#[derive(Debug)]
struct Entry {
    payload: Bytes,
    /// Value of `bytes_sent` immediately after this entry's bytes were sent.
    end_offset: u64,
}

/// Ordered retention of sent-but-unacknowledged payloads, plus the two
/// cumulative byte counters. Invariant: the first entry starts exactly at
/// `bytes_acked`, and the queued payload lengths sum to
/// `bytes_sent - bytes_acked`.
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    entries: VecDeque<Entry>,
    bytes_sent: u64,
    bytes_acked: u64,
}

impl SendQueue {
    pub fn append(&mut self, payload: Bytes) {
        self.bytes_sent += payload.len() as u64;
        self.entries.push_back(Entry {
            payload,
            end_offset: self.bytes_sent,
        });
    }

    /// Applies a live ACK. The server must make strict progress.
    pub fn trim_to(&mut self, acked: u64) -> Result<u64> {
        if acked <= self.bytes_acked {
            return Err(RelayError::InvalidServerResponse(format!(
                "ack did not advance: got {acked}, already acked {}",
                self.bytes_acked
            )));
        }
        self.advance_to(acked)
    }

    /// Applies the ACK carried by a session resume. Unlike a live ACK the
    /// server may legitimately have received nothing since the last one.
    pub fn resume_to(&mut self, acked: u64) -> Result<u64> {
        if acked < self.bytes_acked {
            return Err(RelayError::InvalidServerResponse(format!(
                "resume ack went backwards: got {acked}, already acked {}",
                self.bytes_acked
            )));
        }
        if acked == self.bytes_acked {
            return Ok(0);
        }
        self.advance_to(acked)
    }

    fn advance_to(&mut self, acked: u64) -> Result<u64> {
        if acked > self.bytes_sent {
            return Err(RelayError::InvalidServerResponse(format!(
                "ack {acked} exceeds bytes sent {}",
                self.bytes_sent
            )));
        }

        let mut discarded = 0u64;
        let mut count = 0usize;
        for entry in &self.entries {
            if entry.end_offset > acked {
                break;
            }
            discarded += entry.payload.len() as u64;
            count += 1;
        }

        // Acks land on frame boundaries.
        if self.bytes_acked + discarded != acked {
            return Err(RelayError::InvalidServerResponse(format!(
                "ack {acked} does not land on a frame boundary"
            )));
        }

        self.entries.drain(..count);
        self.bytes_acked = acked;
        Ok(discarded)
    }

    /// Remaining payloads in send order, for replay on a new channel.
    pub fn replay(&self) -> Vec<Bytes> {
        self.entries.iter().map(|e| e.payload.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.bytes_sent - self.bytes_acked
    }

    /// The ack value the server is expected to produce next: the end offset
    /// of the first unacknowledged entry, or 0 when nothing is outstanding.
    pub fn expected_ack(&self) -> u64 {
        self.entries.front().map(|e| e.end_offset).unwrap_or(0)
    }
}
