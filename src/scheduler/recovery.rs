//! Timeout and recovery
//!
//! A watchdog expiry is only acted on when the leader's trace shows a cycle
//! that never finished. Flush and forced stop both retire records through
//! `frame_ndone`, newest first, with a bounded retry budget per bucket.

use super::{DoneOutcome, Scheduler, SchedulerStats};
use crate::chain::StageChain;
use crate::error::Result;
use crate::frame::FrameHandle;
use crate::frame_queue::Buckets;
use crate::registry::StageCounts;
use crate::stage::RegisterDump;
use crate::types::{DoneReason, FrameState, Instance, StageId};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Scheduler {
    /// Expiry of the leader's shot timer
    pub(super) fn on_watchdog_expired(&self, instance: Instance) {
        let chain = match self.chain(instance) {
            Ok(chain) => chain,
            Err(_) => {
                log::debug!("[{}] shot timer expired after chain close", instance);
                return;
            }
        };
        let leader = chain.leader();

        let Some(entry) = leader.stalled_cycle() else {
            SchedulerStats::bump(&self.stats.false_alarms);
            log::warn!(
                "[{}][{}] shot timer expired but every cycle completed (false alarm)",
                instance,
                leader.name()
            );
            return;
        };

        SchedulerStats::bump(&self.stats.timeouts);
        log::error!(
            "[{}][{}][F:{}] shot timeout ({:?}): {}",
            instance,
            leader.name(),
            entry.fcount,
            chain.config().shot_timeout(),
            chain.queue().summary()
        );
        self.log_frame_counts();

        for stage in chain.head_to_tail() {
            let dump = stage.dump_registers();
            SchedulerStats::bump(&self.stats.register_dumps);
            log_dump(&dump);
            if let Err(e) = stage.notify_timeout(instance) {
                log::warn!("[{}][{}] notify timeout failed: {}", instance, stage.name(), e);
            }
        }

        let flushed = self.flush(&chain, DoneReason::Unprocessed);
        leader.clear_trace();
        log::info!("[{}][{}] timeout recovery flushed {} frames", instance, chain.id(), flushed);
    }

    /// Retire every CONFIGURED and WAIT record of the chain, newest first
    pub(super) fn flush(&self, chain: &Arc<StageChain>, reason: DoneReason) -> usize {
        let retired: usize = [FrameState::WaitCompletion, FrameState::Configured]
            .into_iter()
            .map(|state| {
                self.drain_bucket(chain, state, reason, |b| {
                    b.peek_tail(state).map(|r| r.handle())
                })
            })
            .sum();
        self.stats.flushed.fetch_add(retired as u64, Ordering::Relaxed);
        retired
    }

    /// Unconditional drain at stream shutdown, REQUESTED included
    pub(super) fn drain(&self, chain: &Arc<StageChain>) -> usize {
        let instance = chain.instance();
        let retired: usize = [
            FrameState::WaitCompletion,
            FrameState::Configured,
            FrameState::Requested,
        ]
        .into_iter()
        .map(|state| {
            self.drain_bucket(chain, state, DoneReason::Unprocessed, |b| {
                b.iter(state)
                    .rev()
                    .find(|r| r.instance == instance)
                    .map(|r| r.handle())
            })
        })
        .sum();
        if retired > 0 {
            log::info!("[{}][{}] forced stop retired {} frames", instance, chain.id(), retired);
        }
        retired
    }

    fn drain_bucket<F>(&self, chain: &Arc<StageChain>, state: FrameState, reason: DoneReason, mut next: F) -> usize
    where
        F: FnMut(&Buckets) -> Option<FrameHandle>,
    {
        let mut budget = self.config.flush_retry_budget;
        let mut retired = 0;

        while let Some(handle) = chain.queue().with(|b| next(b)) {
            if budget == 0 {
                log::error!(
                    "[{}][{}] {} drain exceeded retry budget: {}",
                    chain.instance(),
                    chain.id(),
                    state,
                    chain.queue().summary()
                );
                break;
            }
            budget -= 1;

            match self.frame_ndone_on(chain, handle, reason) {
                Ok(DoneOutcome::Retired(_)) => retired += 1,
                Ok(DoneOutcome::Pending(view)) => {
                    log::warn!("[{}][F:{}] still pending after ndone", chain.instance(), view.fcount);
                }
                Err(e) => {
                    log::warn!("[{}] ndone during drain failed: {}", chain.instance(), e);
                }
            }
        }
        retired
    }

    /// Operator flush of one chain
    pub fn flush_by_chain(&self, instance: Instance, reason: DoneReason) -> Result<usize> {
        let chain = self.chain(instance)?;
        let flushed = self.flush(&chain, reason);
        log::info!("[{}][{}] flushed {} frames ({})", instance, chain.id(), flushed, reason);
        Ok(flushed)
    }

    /// Forced drain of every record the chain holds
    pub fn force_stop(&self, instance: Instance) -> Result<usize> {
        let chain = self.chain(instance)?;
        Ok(self.drain(&chain))
    }

    /// Restore every stage tail-to-head; the first failure is returned after
    /// the walk completes
    pub fn restore_by_chain(&self, instance: Instance) -> Result<()> {
        let chain = self.chain(instance)?;
        let mut first = None;
        for stage in chain.tail_to_head() {
            if let Err(e) = stage.restore(instance) {
                log::error!("[{}][{}] restore failed: {}", instance, stage.name(), e);
                first.get_or_insert(e);
            }
        }
        log::info!("[{}][{}] chain restored", instance, chain.id());
        first.map_or(Ok(()), Err)
    }

    /// Overflow raised by `stage`: flush with the overflow status and
    /// optionally restore the chain
    pub fn report_overflow(&self, stage: StageId, instance: Instance, restore: bool) -> Result<usize> {
        let chain = self.chain(instance)?;
        log::error!("[{}][{}] overflow: {}", instance, stage, chain.queue().summary());
        self.registry.set_overflow_recovery(true);

        let flushed = self.flush(&chain, DoneReason::Overflow);
        if restore {
            self.restore_by_chain(instance)?;
        }
        Ok(flushed)
    }

    /// Register snapshot of one stage, or of every opened stage
    pub fn dump_registers(&self, stage: Option<StageId>) -> Result<Vec<RegisterDump>> {
        let dumps = self.registry.dump_registers(stage)?;
        for dump in &dumps {
            SchedulerStats::bump(&self.stats.register_dumps);
            log_dump(dump);
        }
        Ok(dumps)
    }

    pub fn frame_counts(&self) -> Vec<StageCounts> {
        self.registry.frame_counts()
    }
}

fn log_dump(dump: &RegisterDump) {
    log::info!("[{}] register dump ({} registers)", dump.name, dump.registers.len());
    for (offset, value) in &dump.registers {
        log::debug!("[{}] 0x{:04x}: 0x{:08x}", dump.name, offset, value);
    }
}
