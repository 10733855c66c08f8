//! Frame Queue - fixed pool of frame records bucketed by life-cycle state
//!
//! Every record is a member of exactly one bucket at all times. Acquisition
//! moves the head of one bucket to the tail of another in a single critical
//! section, so the pool never loses or duplicates a record.

use crate::error::{Result, SchedError};
use crate::frame::{FrameHandle, FrameRecord, FrameView};
use crate::types::FrameState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;

/// Bucket contents, only reachable with the queue lock held
pub struct Buckets {
    records: Vec<FrameRecord>,
    lists: [VecDeque<usize>; 4],
    location: Vec<FrameState>,
    next_seq: u64,
    /// Buffers per logical frame of the last admission
    pub batch_num: u32,
    /// Consecutive frame starts that saw duplicated CONFIGURED records
    pub proc_warn_cnt: u32,
}

impl Buckets {
    fn new(capacity: usize) -> Self {
        let records = (0..capacity).map(FrameRecord::new).collect();
        let mut lists: [VecDeque<usize>; 4] = Default::default();
        lists[FrameState::Free.index()] = (0..capacity).collect();
        Self {
            records,
            lists,
            location: vec![FrameState::Free; capacity],
            next_seq: 0,
            batch_num: 1,
            proc_warn_cnt: 0,
        }
    }

    pub fn len(&self, state: FrameState) -> usize {
        self.lists[state.index()].len()
    }

    pub fn is_empty(&self, state: FrameState) -> bool {
        self.lists[state.index()].is_empty()
    }

    pub fn counts(&self) -> [usize; 4] {
        FrameState::ALL.map(|s| self.len(s))
    }

    pub fn total(&self) -> usize {
        self.counts().iter().sum()
    }

    pub fn peek(&self, state: FrameState) -> Option<&FrameRecord> {
        let slot = *self.lists[state.index()].front()?;
        self.records.get(slot)
    }

    pub fn peek_tail(&self, state: FrameState) -> Option<&FrameRecord> {
        let slot = *self.lists[state.index()].back()?;
        self.records.get(slot)
    }

    /// Records of a bucket in queue order
    pub fn iter(&self, state: FrameState) -> impl DoubleEndedIterator<Item = &FrameRecord> + '_ {
        self.lists[state.index()]
            .iter()
            .filter_map(move |slot| self.records.get(*slot))
    }

    /// Pop the head of `from` and append it to `to`
    ///
    /// Leaving FREE starts a new dispatch cycle and invalidates every handle
    /// issued for the record's previous cycle.
    pub fn acquire(&mut self, from: FrameState, to: FrameState) -> Result<FrameHandle> {
        let slot = match self.lists[from.index()].pop_front() {
            Some(slot) => slot,
            None if from == FrameState::Free => {
                return Err(SchedError::PoolExhausted {
                    capacity: self.records.len(),
                    needed: 1,
                })
            }
            None => return Err(SchedError::EmptyBucket(from)),
        };

        if from == FrameState::Free {
            self.next_seq += 1;
            self.records[slot].seq = self.next_seq;
        }
        self.lists[to.index()].push_back(slot);
        self.location[slot] = to;
        Ok(self.records[slot].handle())
    }

    /// Move a record to the tail of `to`
    pub fn transition(&mut self, handle: FrameHandle, to: FrameState) -> Result<()> {
        let from = self.state_of(handle)?;
        let list = &mut self.lists[from.index()];
        if let Some(pos) = list.iter().position(|s| *s == handle.slot) {
            list.remove(pos);
        }
        self.lists[to.index()].push_back(handle.slot);
        self.location[handle.slot] = to;
        Ok(())
    }

    pub fn state_of(&self, handle: FrameHandle) -> Result<FrameState> {
        self.get(handle)?;
        Ok(self.location[handle.slot])
    }

    pub fn get(&self, handle: FrameHandle) -> Result<&FrameRecord> {
        match self.records.get(handle.slot) {
            Some(record) if record.seq == handle.seq => Ok(record),
            _ => Err(SchedError::StaleFrame { slot: handle.slot }),
        }
    }

    pub fn get_mut(&mut self, handle: FrameHandle) -> Result<&mut FrameRecord> {
        match self.records.get_mut(handle.slot) {
            Some(record) if record.seq == handle.seq => Ok(record),
            _ => Err(SchedError::StaleFrame { slot: handle.slot }),
        }
    }

    /// Oldest record in `state` with the given frame number
    pub fn find(&self, state: FrameState, fcount: u64) -> Option<FrameHandle> {
        self.find_by(state, |r| r.fcount == fcount)
    }

    pub fn find_by<F>(&self, state: FrameState, mut predicate: F) -> Option<FrameHandle>
    where
        F: FnMut(&FrameRecord) -> bool,
    {
        self.iter(state).find(|r| predicate(r)).map(|r| r.handle())
    }

    /// One-line queue state for diagnostics
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for state in FrameState::ALL {
            let _ = write!(out, "{}({}):", state, self.len(state));
            for record in self.iter(state) {
                let _ = write!(out, " [F:{}]", record.fcount);
            }
            out.push(' ');
        }
        out.trim_end().to_string()
    }
}

/// Per-chain frame queue
pub struct FrameQueue {
    capacity: usize,
    inner: Mutex<Buckets>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Buckets::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run `f` inside the queue's critical section
    ///
    /// The closure must only manipulate buckets and records; stage
    /// operations are never invoked with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut Buckets) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    pub fn acquire(&self, from: FrameState, to: FrameState) -> Result<FrameHandle> {
        self.with(|b| b.acquire(from, to))
    }

    pub fn transition(&self, handle: FrameHandle, to: FrameState) -> Result<()> {
        self.with(|b| b.transition(handle, to))
    }

    pub fn peek(&self, state: FrameState) -> Option<FrameView> {
        self.with(|b| b.peek(state).map(FrameRecord::view))
    }

    pub fn find(&self, state: FrameState, fcount: u64) -> Option<FrameView> {
        self.with(|b| {
            let handle = b.find(state, fcount)?;
            b.get(handle).ok().map(FrameRecord::view)
        })
    }

    pub fn view(&self, handle: FrameHandle) -> Result<FrameView> {
        self.with(|b| b.get(handle).map(FrameRecord::view))
    }

    pub fn len(&self, state: FrameState) -> usize {
        self.with(|b| b.len(state))
    }

    pub fn counts(&self) -> [usize; 4] {
        self.with(|b| b.counts())
    }

    /// Records outside FREE
    pub fn in_flight(&self) -> usize {
        self.with(|b| b.total() - b.len(FrameState::Free))
    }

    pub fn summary(&self) -> String {
        self.with(|b| b.summary())
    }
}
