//! Fixed set of raw frame buffers registered with the driver

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::frame::{Frame, Geometry};
use crate::driver::BufferDescriptor;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool needs at least one buffer")]
    Empty,
    #[error("device reported a zero payload size")]
    ZeroPayload,
    #[error("payload size {payload} is smaller than a {width}x{height} image")]
    InconsistentPayload { payload: usize, width: u32, height: u32 },
    #[error("could not allocate {bytes} bytes for buffer {slot}")]
    Allocation { slot: usize, bytes: usize },
}

/// Where a buffer currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Announced, owned by the pool
    Idle = 0,
    /// Sitting in the driver's pending-frame queue
    Queued = 1,
    /// Handed to the completion callback, not yet resubmitted
    Delivered = 2,
}

impl SlotState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SlotState::Queued,
            2 => SlotState::Delivered,
            _ => SlotState::Idle,
        }
    }
}

/// Per-slot state, shared with every frame of the pool
pub(crate) struct SlotLedger {
    states: Vec<AtomicU8>,
}

impl SlotLedger {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            states: (0..count).map(|_| AtomicU8::new(SlotState::Idle as u8)).collect(),
        }
    }

    pub(crate) fn set(&self, slot: usize, state: SlotState) {
        if let Some(cell) = self.states.get(slot) {
            cell.store(state as u8, Ordering::Release);
        }
    }

    fn get(&self, slot: usize) -> SlotState {
        SlotState::from_u8(self.states[slot].load(Ordering::Acquire))
    }
}

/// Snapshot of where the pool's buffers are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCensus {
    pub idle: usize,
    pub queued: usize,
    pub delivered: usize,
}

impl PoolCensus {
    pub fn total(&self) -> usize {
        self.idle + self.queued + self.delivered
    }
}

/// Buffers currently owned by the pool rather than the driver
pub(crate) struct FrameHome {
    frames: Mutex<Vec<Frame>>,
    returned: Condvar,
}

impl FrameHome {
    fn lock(&self) -> MutexGuard<'_, Vec<Frame>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a buffer back from the driver side
    pub(crate) fn put(&self, frame: Frame) {
        frame.mark(SlotState::Idle);
        self.lock().push(frame);
        self.returned.notify_all();
    }
}

/// Pre-allocated buffers for one camera.
///
/// Every buffer is a separate allocation owned by exactly one party at a
/// time, so it cannot be freed while the driver still holds it.
pub struct FramePool {
    count: usize,
    buffer_size: usize,
    ledger: Arc<SlotLedger>,
    home: Arc<FrameHome>,
}

impl FramePool {
    /// Allocate `count` buffers of the negotiated payload size
    pub fn allocate(count: usize, geometry: &Geometry) -> Result<Self, PoolError> {
        if count == 0 {
            return Err(PoolError::Empty);
        }
        let payload = geometry.payload_size;
        if payload == 0 {
            return Err(PoolError::ZeroPayload);
        }
        match geometry.image_bytes() {
            Some(needed) if needed <= payload => {}
            _ => {
                return Err(PoolError::InconsistentPayload {
                    payload,
                    width: geometry.width,
                    height: geometry.height,
                })
            }
        }

        let ledger = Arc::new(SlotLedger::new(count));
        let mut frames = Vec::with_capacity(count);
        for slot in 0..count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(payload)
                .map_err(|_| PoolError::Allocation {
                    slot,
                    bytes: payload,
                })?;
            buffer.resize(payload, 0);
            frames.push(Frame::new(buffer.into_boxed_slice(), slot, ledger.clone()));
        }

        debug!(count, payload, "Frame pool allocated");

        Ok(Self {
            count,
            buffer_size: payload,
            ledger,
            home: Arc::new(FrameHome {
                frames: Mutex::new(frames),
                returned: Condvar::new(),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Registration records for every buffer
    pub fn descriptors(&self) -> Vec<BufferDescriptor> {
        (0..self.count)
            .map(|slot| BufferDescriptor {
                slot,
                capacity: self.buffer_size,
            })
            .collect()
    }

    /// Hand out every buffer the pool currently holds, in slot order
    pub fn take_idle(&self) -> Vec<Frame> {
        let mut frames = std::mem::take(&mut *self.home.lock());
        frames.sort_by_key(Frame::slot);
        frames
    }

    /// Take back a buffer returned by the driver
    pub fn reclaim(&self, frame: Frame) {
        self.home.put(frame);
    }

    pub(crate) fn home(&self) -> Arc<FrameHome> {
        self.home.clone()
    }

    pub fn census(&self) -> PoolCensus {
        let mut census = PoolCensus::default();
        for slot in 0..self.count {
            match self.ledger.get(slot) {
                SlotState::Idle => census.idle += 1,
                SlotState::Queued => census.queued += 1,
                SlotState::Delivered => census.delivered += 1,
            }
        }
        census
    }

    /// Number of buffers physically back in the pool
    pub fn held(&self) -> usize {
        self.home.lock().len()
    }

    /// Block until every buffer is back in the pool; false on timeout
    pub fn wait_all_idle(&self, timeout: Duration) -> bool {
        let guard = self.home.lock();
        let (guard, _) = self
            .home
            .returned
            .wait_timeout_while(guard, timeout, |frames| frames.len() < self.count)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.len() == self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use std::thread;

    fn geometry(width: u32, height: u32, payload_size: usize) -> Geometry {
        Geometry {
            width,
            height,
            payload_size,
            pixel_format: PixelFormat::Mono8,
        }
    }

    #[test]
    fn allocates_payload_sized_buffers() {
        let pool = FramePool::allocate(3, &geometry(10, 10, 100)).unwrap();
        let frames = pool.take_idle();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.capacity() == 100));
        assert_eq!(
            frames.iter().map(Frame::slot).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(pool.descriptors()[2].capacity, 100);
    }

    #[test]
    fn rejects_bad_payloads() {
        assert!(matches!(
            FramePool::allocate(3, &geometry(10, 10, 0)),
            Err(PoolError::ZeroPayload)
        ));
        assert!(matches!(
            FramePool::allocate(3, &geometry(10, 10, 99)),
            Err(PoolError::InconsistentPayload { payload: 99, .. })
        ));
        assert!(matches!(
            FramePool::allocate(0, &geometry(10, 10, 100)),
            Err(PoolError::Empty)
        ));
    }

    #[test]
    fn census_always_accounts_for_every_buffer() {
        let pool = FramePool::allocate(3, &geometry(4, 4, 16)).unwrap();
        let mut frames = pool.take_idle();
        assert_eq!(pool.census().idle, 3);

        frames[0].mark(SlotState::Queued);
        frames[1].mark(SlotState::Delivered);
        let census = pool.census();
        assert_eq!(census, PoolCensus { idle: 1, queued: 1, delivered: 1 });
        assert_eq!(census.total(), 3);

        for frame in frames.drain(..) {
            pool.reclaim(frame);
        }
        assert_eq!(pool.census().idle, 3);
        assert_eq!(pool.held(), 3);
    }

    #[test]
    fn wait_all_idle_wakes_on_return() {
        let pool = FramePool::allocate(2, &geometry(4, 4, 16)).unwrap();
        let frames = pool.take_idle();
        assert!(!pool.wait_all_idle(Duration::from_millis(10)));

        let home = pool.home();
        let returner = thread::spawn(move || {
            for frame in frames {
                thread::sleep(Duration::from_millis(5));
                home.put(frame);
            }
        });

        assert!(pool.wait_all_idle(Duration::from_secs(5)));
        returner.join().unwrap();
    }
}
