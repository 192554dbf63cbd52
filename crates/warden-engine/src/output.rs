//! Output broker: byte buffers shared between the process supervisor
//! (writer) and the task (reader), plus the quota accounting that bounds
//! what is delivered to the control plane.

use std::sync::{Arc, Mutex};

/// Default terminal output quota in bytes when the task does not raise it.
pub const DEFAULT_QUOTA: usize = 12_000;

/// Budget for running-output chunks sent while the task is still executing.
pub const DEFAULT_QUOTA_PRE: u32 = 6_000;

/// Bytes drained per running-output tick, per stream.
pub const RUNNING_CHUNK: usize = 1024;

/// Thread-safe byte buffer. Single writer (the pipe pump), single reader
/// (the running-output ticker and the final drain); writes never block on
/// the reader.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, data: &[u8]) {
        self.inner.lock().expect("output buffer poisoned").extend_from_slice(data);
    }

    /// Remove and return up to `max` bytes from the front.
    pub fn read_chunk(&self, max: usize) -> Vec<u8> {
        let mut buf = self.inner.lock().expect("output buffer poisoned");
        let n = max.min(buf.len());
        buf.drain(..n).collect()
    }

    /// Remove and return everything buffered.
    pub fn drain(&self) -> Vec<u8> {
        let mut buf = self.inner.lock().expect("output buffer poisoned");
        std::mem::take(&mut *buf)
    }

    /// Copy of the current contents without consuming them.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("output buffer poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("output buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("output buffer poisoned").clear();
    }
}

/// Package the terminal output under the task quota.
///
/// The effective quota is `max(log_quota, DEFAULT_QUOTA)`; bytes already
/// delivered as running output count against it. When the buffered output
/// exceeds what remains, the *oldest* bytes are discarded and reported as
/// `dropped`.
pub fn report_slice(output: &[u8], log_quota: usize, sent: u32) -> (Vec<u8>, usize) {
    let quota = log_quota.max(DEFAULT_QUOTA);
    let remaining = quota.saturating_sub(sent as usize);
    if output.len() <= remaining {
        (output.to_vec(), 0)
    } else {
        let dropped = output.len() - remaining;
        (output[dropped..].to_vec(), dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_chunked_reads_preserve_order() {
        let buf = SharedBuffer::new();
        buf.write(b"abcdef");
        buf.write(b"ghij");

        assert_eq!(buf.read_chunk(4), b"abcd");
        assert_eq!(buf.read_chunk(100), b"efghij");
        assert!(buf.is_empty());
        assert_eq!(buf.read_chunk(4), b"");
    }

    #[test]
    fn drain_takes_everything() {
        let buf = SharedBuffer::new();
        buf.write(b"xyz");
        assert_eq!(buf.snapshot(), b"xyz");
        assert_eq!(buf.drain(), b"xyz");
        assert!(buf.is_empty());
    }

    #[test]
    fn report_slice_within_quota() {
        let out = vec![b'a'; 500];
        let (body, dropped) = report_slice(&out, 12_000, 0);
        assert_eq!(body.len(), 500);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn report_slice_drops_oldest_on_overflow() {
        let mut out = vec![b'x'; 12_500];
        out[12_499] = b'z';
        let (body, dropped) = report_slice(&out, 100, 0);
        // quota floors at DEFAULT_QUOTA even when the task asks for less
        assert_eq!(body.len(), 12_000);
        assert_eq!(dropped, 500);
        assert_eq!(*body.last().unwrap(), b'z');
    }

    #[test]
    fn report_slice_accounts_already_sent_bytes() {
        let out = vec![b'a'; 10_000];
        let (body, dropped) = report_slice(&out, 12_000, 6_000);
        // invariant: body length = min(L, Q - S), dropped = max(0, L - (Q - S))
        assert_eq!(body.len(), 6_000);
        assert_eq!(dropped, 4_000);

        let (body, dropped) = report_slice(&out, 20_000, 6_000);
        assert_eq!(body.len(), 10_000);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn report_slice_sent_exceeding_quota_reports_nothing() {
        let out = vec![b'a'; 10];
        let (body, dropped) = report_slice(&out, 0, 13_000);
        assert_eq!(body.len(), 0);
        assert_eq!(dropped, 10);
    }
}
