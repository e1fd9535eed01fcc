//! Two-party rendezvous pairing the newest image from each camera

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::capture::frame::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

/// Where the current cycle stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    WaitingBoth,
    WaitingOne,
    PairReady,
}

/// One image from each camera
#[derive(Debug, Clone)]
pub struct FramePair {
    pub left: Image,
    pub right: Image,
    /// Cycle number, starting at 1
    pub sequence: u64,
}

#[derive(Default)]
struct Cycle {
    /// Images posted during the current cycle
    cells: [Option<Image>; 2],
    /// Images posted while a pair was waiting to be consumed
    staged: [Option<Image>; 2],
    sequence: u64,
    closed: bool,
}

impl Cycle {
    fn phase(&self) -> PairPhase {
        match self.cells.iter().filter(|cell| cell.is_some()).count() {
            0 => PairPhase::WaitingBoth,
            1 => PairPhase::WaitingOne,
            _ => PairPhase::PairReady,
        }
    }

    /// Empty both cells and open the next cycle with anything staged
    fn take_pair(&mut self) -> Option<FramePair> {
        if self.phase() != PairPhase::PairReady {
            return None;
        }
        let [left, right] = std::mem::take(&mut self.cells);
        self.cells = std::mem::take(&mut self.staged);
        self.sequence += 1;
        Some(FramePair {
            left: left?,
            right: right?,
            sequence: self.sequence,
        })
    }
}

/// Holding cells for both cameras behind one lock.
///
/// "Both posted" and reading both cells happen under the same lock, so a
/// consumer never sees a fresh image next to one from an earlier cycle.
#[derive(Default)]
pub struct PairRendezvous {
    cycle: Mutex<Cycle>,
    ready: Condvar,
}

impl PairRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Cycle> {
        self.cycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the newest image from one camera
    pub fn post(&self, side: Side, image: Image) {
        let mut cycle = self.lock();
        if cycle.closed {
            return;
        }
        if cycle.phase() == PairPhase::PairReady {
            cycle.staged[side.index()] = Some(image);
            return;
        }
        cycle.cells[side.index()] = Some(image);
        if cycle.phase() == PairPhase::PairReady {
            self.ready.notify_all();
        }
    }

    pub fn phase(&self) -> PairPhase {
        self.lock().phase()
    }

    /// Pairs handed out so far
    pub fn cycles(&self) -> u64 {
        self.lock().sequence
    }

    /// Block until a pair is ready. `None` once closed.
    pub fn wait_pair(&self) -> Option<FramePair> {
        let guard = self.lock();
        let mut cycle = self
            .ready
            .wait_while(guard, |cycle| {
                !cycle.closed && cycle.phase() != PairPhase::PairReady
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.consume(&mut cycle)
    }

    pub fn wait_pair_timeout(&self, timeout: Duration) -> Option<FramePair> {
        let guard = self.lock();
        let (mut cycle, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |cycle| {
                !cycle.closed && cycle.phase() != PairPhase::PairReady
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.consume(&mut cycle)
    }

    pub fn try_take(&self) -> Option<FramePair> {
        let mut cycle = self.lock();
        self.consume(&mut cycle)
    }

    fn consume(&self, cycle: &mut Cycle) -> Option<FramePair> {
        if cycle.closed {
            return None;
        }
        let pair = cycle.take_pair()?;
        if cycle.phase() == PairPhase::PairReady {
            self.ready.notify_all();
        }
        Some(pair)
    }

    /// Release every waiter and ignore further posts
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Clear all cells and reopen for a new capture session
    pub fn reset(&self) {
        *self.lock() = Cycle::default();
    }
}
