//! Fixed-size shared region plus control words used for blocking calls
//! between the interpreter thread and its database worker.
//!
//! Layout mirrors a futex-guarded shared memory segment:
//!
//! * bytes `0..8` are reserved header space, the payload starts at byte 8;
//! * control slot 0 is the call status, slot 1 the payload length, slot 2 the
//!   initialization barrier.
//!
//! Waiters block on a slot until its value differs from the one they expect;
//! writers store the new value and then notify. Only one call may be in flight
//! per buffer, which [`SharedTransferBuffer::begin_call`] enforces.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use super::BridgeReply;
use crate::error::{Result, SandboxError};

pub const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;
pub const HEADER_BYTES: usize = 8;

pub const STATUS_SLOT: usize = 0;
pub const LENGTH_SLOT: usize = 1;
pub const INIT_SLOT: usize = 2;

pub const STATUS_PENDING: i32 = 0;
pub const STATUS_SUCCESS: i32 = 1;
pub const STATUS_ERROR: i32 = 2;

pub const INIT_PENDING: i32 = 0;
pub const INIT_LOADED: i32 = 1;
pub const INIT_FAILED: i32 = 2;

/// Result of [`SharedTransferBuffer::wait`], named after `Atomics.wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Slot changed while we were blocked.
    Ok,
    /// Slot already held a different value; no blocking happened.
    NotEqual,
    TimedOut,
}

pub struct SharedTransferBuffer {
    bytes: Mutex<Vec<u8>>,
    control: [AtomicI32; 3],
    signal: Mutex<()>,
    wakeup: Condvar,
    in_flight: AtomicBool,
}

impl SharedTransferBuffer {
    pub fn new(size: usize) -> Result<Self> {
        if size <= HEADER_BYTES || size > i32::MAX as usize {
            return Err(SandboxError::Config {
                reason: format!("shared buffer size {} out of range", size),
            });
        }
        Ok(Self {
            bytes: Mutex::new(vec![0u8; size]),
            control: [AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)],
            signal: Mutex::new(()),
            wakeup: Condvar::new(),
            in_flight: AtomicBool::new(false),
        })
    }

    /// Total size in bytes, header included.
    pub fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Largest payload that fits after the header.
    pub fn payload_capacity(&self) -> usize {
        self.size() - HEADER_BYTES
    }

    pub fn load(&self, slot: usize) -> i32 {
        self.control[slot].load(Ordering::SeqCst)
    }

    pub fn store(&self, slot: usize, value: i32) {
        self.control[slot].store(value, Ordering::SeqCst);
    }

    /// Wake every thread blocked on the buffer. Waiters re-check their own slot.
    pub fn notify(&self, slot: usize) {
        let _guard = self.signal.lock();
        tracing::trace!(slot, value = self.load(slot), "notify");
        self.wakeup.notify_all();
    }

    /// Block while `slot` still holds `expected`.
    pub fn wait(&self, slot: usize, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
        let mut guard = self.signal.lock();
        if self.load(slot) != expected {
            return WaitOutcome::NotEqual;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while self.load(slot) == expected {
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut guard, deadline).timed_out()
                        && self.load(slot) == expected
                    {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => self.wakeup.wait(&mut guard),
            }
        }
        WaitOutcome::Ok
    }

    /// Claim the buffer for one call. Dropping the guard releases it.
    pub fn begin_call(&self) -> Result<CallGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SandboxError::BridgeBusy)?;
        Ok(CallGuard { buffer: self })
    }

    /// Publish a call reply: payload first, then length, then status, then notify.
    ///
    /// An oversized payload is never written. The caller is woken with a small
    /// `buffer_overflow` error reply instead and the overflow is returned.
    pub fn publish(&self, status: i32, payload: &[u8]) -> Result<()> {
        let capacity = self.payload_capacity();
        if payload.len() > capacity {
            let err = SandboxError::BufferOverflow {
                size: payload.len(),
                capacity,
            };
            let reply = BridgeReply::from_error(&err).to_bytes();
            self.write_frame(&reply[..reply.len().min(capacity)]);
            self.store(STATUS_SLOT, STATUS_ERROR);
            self.notify(STATUS_SLOT);
            return Err(err);
        }

        self.write_frame(payload);
        self.store(STATUS_SLOT, status);
        self.notify(STATUS_SLOT);
        Ok(())
    }

    /// Release the initialization barrier. A failure message travels in the payload region.
    pub fn signal_init(&self, outcome: std::result::Result<(), &SandboxError>) {
        match outcome {
            Ok(()) => {
                self.store(LENGTH_SLOT, 0);
                self.store(INIT_SLOT, INIT_LOADED);
            }
            Err(err) => {
                let reply = BridgeReply::from_error(err).to_bytes();
                let capacity = self.payload_capacity();
                self.write_frame(&reply[..reply.len().min(capacity)]);
                self.store(INIT_SLOT, INIT_FAILED);
            }
        }
        self.notify(INIT_SLOT);
    }

    /// Copy out the current payload (`length` bytes starting after the header).
    pub fn read_payload(&self) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let len = (self.load(LENGTH_SLOT).max(0) as usize).min(bytes.len() - HEADER_BYTES);
        bytes[HEADER_BYTES..HEADER_BYTES + len].to_vec()
    }

    fn write_frame(&self, payload: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[HEADER_BYTES..HEADER_BYTES + payload.len()].copy_from_slice(payload);
        self.store(LENGTH_SLOT, payload.len() as i32);
    }
}

/// Marks the single outstanding call on a buffer.
pub struct CallGuard<'a> {
    buffer: &'a SharedTransferBuffer,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.buffer.in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_payload_round_trip_is_byte_exact() {
        let buffer = SharedTransferBuffer::new(64).unwrap();
        let payload = "héllo, wörld ✓".as_bytes();
        buffer.publish(STATUS_SUCCESS, payload).unwrap();
        assert_eq!(buffer.load(STATUS_SLOT), STATUS_SUCCESS);
        assert_eq!(buffer.load(LENGTH_SLOT) as usize, payload.len());
        assert_eq!(buffer.read_payload(), payload);
    }

    #[test]
    fn test_payload_exactly_at_capacity_fits() {
        let buffer = SharedTransferBuffer::new(HEADER_BYTES + 16).unwrap();
        let payload = vec![b'a'; 16];
        buffer.publish(STATUS_SUCCESS, &payload).unwrap();
        assert_eq!(buffer.read_payload(), payload);
    }

    #[test]
    fn test_overflow_signals_error_without_partial_write() {
        let buffer = SharedTransferBuffer::new(256).unwrap();
        let payload = vec![0xffu8; 249];
        let err = buffer.publish(STATUS_SUCCESS, &payload).unwrap_err();
        assert_eq!(
            err,
            SandboxError::BufferOverflow {
                size: 249,
                capacity: 248
            }
        );
        assert_eq!(buffer.load(STATUS_SLOT), STATUS_ERROR);

        let reply = BridgeReply::from_bytes(&buffer.read_payload()).unwrap();
        assert_eq!(reply.into_result().unwrap_err(), err);
        assert!(!buffer.read_payload().contains(&0xff));
    }

    #[test]
    fn test_wait_returns_not_equal_when_already_changed() {
        let buffer = SharedTransferBuffer::new(64).unwrap();
        buffer.store(STATUS_SLOT, STATUS_SUCCESS);
        assert_eq!(
            buffer.wait(STATUS_SLOT, STATUS_PENDING, None),
            WaitOutcome::NotEqual
        );
    }

    #[test]
    fn test_wait_times_out() {
        let buffer = SharedTransferBuffer::new(64).unwrap();
        let outcome = buffer.wait(STATUS_SLOT, STATUS_PENDING, Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_wait_wakes_on_publish_from_other_thread() {
        let buffer = Arc::new(SharedTransferBuffer::new(64).unwrap());
        let writer = Arc::clone(&buffer);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.publish(STATUS_SUCCESS, b"done").unwrap();
        });

        let outcome = buffer.wait(STATUS_SLOT, STATUS_PENDING, Some(Duration::from_secs(5)));
        assert_ne!(outcome, WaitOutcome::TimedOut);
        assert_eq!(buffer.read_payload(), b"done");
        handle.join().unwrap();
    }

    #[test]
    fn test_single_outstanding_call() {
        let buffer = SharedTransferBuffer::new(64).unwrap();
        let guard = buffer.begin_call().unwrap();
        assert!(matches!(buffer.begin_call(), Err(SandboxError::BridgeBusy)));
        drop(guard);
        assert!(buffer.begin_call().is_ok());
    }

    #[test]
    fn test_failed_init_carries_message() {
        let buffer = SharedTransferBuffer::new(256).unwrap();
        let err = SandboxError::DumpLoad {
            dump_id: "broken".into(),
            message: "syntax error".into(),
        };
        buffer.signal_init(Err(&err));
        assert_eq!(buffer.load(INIT_SLOT), INIT_FAILED);
        let reply = BridgeReply::from_bytes(&buffer.read_payload()).unwrap();
        assert_eq!(reply.into_result().unwrap_err(), err);
    }

    #[test]
    fn test_rejects_header_sized_buffer() {
        assert!(SharedTransferBuffer::new(HEADER_BYTES).is_err());
    }
}
