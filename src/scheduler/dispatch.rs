//! Admission and dispatch
//!
//! `grp_shot` admits caller frames, `config_lock` keeps trigger-driven chains
//! fed, and every dispatch funnels through `run_shot`, which walks the chain
//! tail-to-head so consumers are armed before their producers.

use super::{Scheduler, SchedulerStats};
use crate::chain::StageChain;
use crate::error::{Result, SchedError};
use crate::frame::{FrameHandle, FrameTemplate, FrameView};
use crate::frame_queue::Buckets;
use crate::stage::StageEvent;
use crate::types::{DoneReason, FrameState, Instance, ShotType};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A caller request with frame number `fcount` is too old for trigger count
/// `trigger` when it trails it by more than `run_ahead` frames.
pub fn is_late(fcount: u64, trigger: u64, run_ahead: u32) -> bool {
    fcount.saturating_add(u64::from(run_ahead)) < trigger
}

/// Result of one config-lock tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// This record was dispatched
    Dispatched(FrameView),
    /// A record for the next frame number is already in flight
    Duplicate(u64),
    /// The chain is not trigger driven
    Ignored,
}

enum LockStep {
    Exists(u64),
    Late(FrameView),
    Dispatch(FrameHandle, ShotType),
}

enum Synth {
    Created,
    Exists,
}

impl Scheduler {
    /// Admit one caller frame onto the instance's chain
    ///
    /// Burst frames become one replica per buffer unless the hardware batches
    /// natively. Either every record is queued or none is.
    pub fn grp_shot(&self, instance: Instance, template: &FrameTemplate) -> Result<()> {
        let chain = self.chain(instance)?;
        let queue = chain.queue();
        let num_buffers = template.num_buffers.max(1);
        let replicate = num_buffers > 1 && !self.config.fast_readout;
        let needed = if replicate { num_buffers as usize } else { 1 };
        let streaming = self.registry.is_streaming(instance);

        if !streaming {
            log::info!(
                "[{}][{}] grp_shot [F:{}] B:{} O:{:?}",
                instance,
                chain.id(),
                template.fcount,
                num_buffers,
                template.out_flag
            );
        }

        let taken = queue.with(|b| -> Result<Vec<FrameHandle>> {
            let mut taken: Vec<FrameHandle> = Vec::with_capacity(needed);
            for index in 0..needed {
                let handle = match b.acquire(FrameState::Free, FrameState::Requested) {
                    Ok(handle) => handle,
                    Err(_) => {
                        for handle in taken {
                            b.transition(handle, FrameState::Free)?;
                        }
                        return Err(SchedError::PoolExhausted {
                            capacity: queue.capacity(),
                            needed,
                        });
                    }
                };
                let record = b.get_mut(handle)?;
                record.fill_from(instance, template);
                if replicate {
                    record.make_replica(index as u32, index + 1 == needed);
                }
                taken.push(handle);
            }
            b.batch_num = num_buffers;
            Ok(taken)
        })
        .map_err(|e| {
            log::error!("[{}][{}] free frame exhausted: {}", instance, chain.id(), queue.summary());
            e
        })?;

        self.stats.admitted.fetch_add(needed as u64, Ordering::Relaxed);
        log::debug!(
            "[{}] batch_num({}) fast readout({})",
            instance,
            num_buffers,
            self.config.fast_readout
        );

        if chain.is_trigger_driven() {
            if streaming {
                // config lock takes it from here
                self.registry.reset_log_count();
                return Ok(());
            }
            log::info!("[{}][{}] OTF start [F:{}]", instance, chain.id(), template.fcount);
        } else {
            self.arm_watchdog(&chain);
        }

        let fcount = template.fcount.saturating_sub(1);
        for stage in chain.head_to_tail() {
            stage.counters().set_all(fcount);
        }

        let handle = queue.acquire(FrameState::Requested, FrameState::Configured)?;
        if let Err(e) = self.run_shot(&chain, handle) {
            let dropped = queue.with(|b| -> Result<usize> {
                let mut dropped = 0;
                for &replica in &taken {
                    if matches!(b.state_of(replica), Ok(FrameState::Requested)) {
                        b.transition(replica, FrameState::Free)?;
                        dropped += 1;
                    }
                }
                Ok(dropped)
            })?;
            if dropped > 0 {
                log::warn!(
                    "[{}][{}] dropped {} queued replicas of [F:{}]",
                    instance,
                    chain.id(),
                    dropped,
                    template.fcount
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Dispatch the oldest REQUESTED record of the instance's chain
    pub fn shot(&self, instance: Instance) -> Result<FrameView> {
        let chain = self.chain(instance)?;
        if !chain.is_trigger_driven() {
            self.arm_watchdog(&chain);
        }
        let handle = chain.queue().acquire(FrameState::Requested, FrameState::Configured)?;
        self.run_shot(&chain, handle)
    }

    /// Next replica of a multi-buffer batch
    pub(super) fn mshot(&self, instance: Instance) -> Result<()> {
        let chain = self.chain(instance)?;
        let handle = match chain.queue().acquire(FrameState::Requested, FrameState::Configured) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("[{}][{}] shot frame is empty", instance, chain.id());
                return Err(e);
            }
        };
        self.arm_watchdog(&chain);
        self.run_shot(&chain, handle).map(|_| ())
    }

    /// Config-lock tick of a trigger-driven chain at trigger count `framenum`
    pub fn config_lock(&self, instance: Instance, framenum: u64) -> Result<LockOutcome> {
        let chain = self.chain(instance)?;
        if !chain.is_trigger_driven() {
            return Ok(LockOutcome::Ignored);
        }
        chain.leader().counters().bump(StageEvent::ConfigLock);
        let queue = chain.queue();
        let run_ahead = chain.config().run_ahead;

        loop {
            let mut low_free = false;
            let step = queue.with(|b| -> Result<LockStep> {
                if b.is_empty(FrameState::Requested) {
                    let batch = if self.config.fast_readout { 1 } else { b.batch_num.max(1) };
                    for index in 0..batch {
                        let (synth, low) = self.make_internal_shot(b, &chain, framenum + 1, index)?;
                        low_free |= low;
                        if let Synth::Exists = synth {
                            return Ok(LockStep::Exists(framenum + 1));
                        }
                    }
                }

                let head = b
                    .peek(FrameState::Requested)
                    .ok_or(SchedError::EmptyBucket(FrameState::Requested))?;
                let (handle, shot_type, fcount) = (head.handle(), head.shot_type, head.fcount);

                if shot_type != ShotType::Internal && is_late(fcount, framenum, run_ahead) {
                    let record = b.get_mut(handle)?;
                    record.shot_type = ShotType::Late;
                    let view = record.view();
                    b.transition(handle, FrameState::WaitCompletion)?;
                    return Ok(LockStep::Late(view));
                }

                let handle = b.acquire(FrameState::Requested, FrameState::Configured)?;
                Ok(LockStep::Dispatch(handle, shot_type))
            });

            if low_free {
                log::warn!("[{}] free frame is less than {}: {}", instance, self.config.low_free_warning, queue.summary());
                self.registry.report_bug("low free frames at config lock");
            }

            match step? {
                LockStep::Exists(fcount) => {
                    log::info!("[{}][F:{}] already in flight, internal shot skipped", instance, fcount);
                    return Ok(LockOutcome::Duplicate(fcount));
                }
                LockStep::Late(view) => {
                    SchedulerStats::bump(&self.stats.late_shots);
                    log::warn!(
                        "[{}][{}] LATE_SHOT [F:{}] trigger({}) run_ahead({}) O:{:?}",
                        instance,
                        chain.id(),
                        view.fcount,
                        framenum,
                        run_ahead,
                        view.out_flag
                    );
                    self.hooks.late_shot(instance, &view);
                    if let Err(e) = self.frame_ndone_on(&chain, view.handle, DoneReason::Late) {
                        log::error!("[{}][F:{}] late frame retire failed: {}", instance, view.fcount, e);
                    }
                }
                LockStep::Dispatch(handle, shot_type) => {
                    let view = queue.view(handle)?;
                    if shot_type == ShotType::Internal {
                        let count = self.registry.log_count();
                        if self.config.log_internal(count) {
                            log::info!("[{}] config_lock: INTERNAL_SHOT [F:{}] count({})", instance, view.fcount, count);
                        }
                    }
                    return self.run_shot(&chain, handle).map(LockOutcome::Dispatched);
                }
            }
        }
    }

    /// Synthesize one internal record at `fcount` unless that frame is already in flight
    ///
    /// Runs inside the queue's critical section. The second value reports
    /// that FREE ran low, for the caller to count once the lock is released.
    fn make_internal_shot(
        &self,
        b: &mut Buckets,
        chain: &StageChain,
        fcount: u64,
        buf_index: u32,
    ) -> Result<(Synth, bool)> {
        let free = b.len(FrameState::Free);
        let low_free = free < self.config.low_free_warning;
        if free > self.config.free_reset_level {
            self.registry.reset_bug_count();
        }

        if b.find(FrameState::WaitCompletion, fcount).is_some()
            || b.find(FrameState::Configured, fcount).is_some()
        {
            return Ok((Synth::Exists, low_free));
        }

        let handle = b.acquire(FrameState::Free, FrameState::Requested)?;
        let num_buffers = if self.config.fast_readout { b.batch_num.max(1) } else { 1 };
        b.get_mut(handle)?
            .fill_internal(chain.instance(), fcount, num_buffers, buf_index);
        SchedulerStats::bump(&self.stats.internal_shots);
        Ok((Synth::Created, low_free))
    }

    /// Re-dispatch after a chain restore, synthesizing an internal record at
    /// `fcount` when nothing is queued
    pub fn recovery_shot(&self, instance: Instance, fcount: u64) -> Result<FrameView> {
        let chain = self.chain(instance)?;
        let handle = chain.queue().with(|b| -> Result<FrameHandle> {
            if b.is_empty(FrameState::Requested) {
                let handle = b.acquire(FrameState::Free, FrameState::Requested)?;
                b.get_mut(handle)?.fill_internal(instance, fcount, 1, 0);
                SchedulerStats::bump(&self.stats.internal_shots);
            }
            b.acquire(FrameState::Requested, FrameState::Configured)
        })?;
        let view = chain.queue().view(handle)?;
        log::info!("[{}][{}] recovery shot [F:{}]", instance, chain.id(), view.fcount);

        self.arm_watchdog(&chain);
        self.run_shot(&chain, handle)
    }

    /// Walk the chain tail-to-head shooting `handle` (already CONFIGURED)
    ///
    /// On the first failure the record returns to FREE and every stage that
    /// took part is restored. The returned view carries the core-done bits
    /// the stages asked for.
    pub(super) fn run_shot(&self, chain: &Arc<StageChain>, handle: FrameHandle) -> Result<FrameView> {
        let queue = chain.queue();
        let view = queue.view(handle)?;
        let instance = chain.instance();
        let active = chain.stage_set();
        let mut touched = Vec::with_capacity(chain.len());

        for stage in chain.tail_to_head() {
            touched.push(stage);
            let ack = match stage.shot(&view, active) {
                Ok(ack) => ack,
                Err(e) => {
                    log::error!("[{}][{}][F:{}] shot failed: {}", instance, stage.name(), view.fcount, e);
                    SchedulerStats::bump(&self.stats.dispatch_failures);
                    if let Err(t) = queue.transition(handle, FrameState::Free) {
                        log::error!("[{}][F:{}] rollback failed: {}", instance, view.fcount, t);
                    }
                    for done in touched.iter().rev() {
                        if let Err(r) = done.restore(instance) {
                            log::error!("[{}][{}] restore failed: {}", instance, done.name(), r);
                        }
                    }
                    // the rolled-back cycle never starts
                    if !chain.is_trigger_driven() && queue.in_flight() == queue.len(FrameState::Requested) {
                        chain.leader().watchdog().cancel();
                        chain.leader().clear_trace();
                    }
                    return Err(e);
                }
            };

            if ack.core_done {
                let id = stage.id();
                queue.with(|b| b.get_mut(handle).map(|r| r.core_flag.insert(id)))?;
            }
        }

        SchedulerStats::bump(&self.stats.dispatched);
        log::trace!("[{}][{}] shot [F:{}] dispatched", instance, chain.id(), view.fcount);

        let view = queue.view(handle).unwrap_or(view);
        if let Err(e) = self.hooks.shot_callback(instance, &view) {
            SchedulerStats::bump(&self.stats.hook_failures);
            log::warn!("[{}][F:{}] shot callback failed: {}", instance, view.fcount, e);
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_late_boundaries() {
        assert!(!is_late(10, 10, 0));
        assert!(is_late(9, 10, 0));
        assert!(!is_late(8, 10, 2));
        assert!(is_late(7, 10, 2));
        assert!(!is_late(u64::MAX, 3, 5));
    }

    #[test]
    fn test_is_late_random_triples() {
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..10_000 {
            let trigger = rng.u64(0..1_000_000);
            let run_ahead = rng.u32(0..64);
            let fcount = rng.u64(0..1_000_000);
            let expected = (fcount as i128) < trigger as i128 - run_ahead as i128;
            assert_eq!(is_late(fcount, trigger, run_ahead), expected);
        }
    }
}
