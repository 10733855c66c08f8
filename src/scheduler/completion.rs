//! Completion path
//!
//! Frame start moves the dispatched record from CONFIGURED to WAIT, frame
//! done clears the record's pending outputs and core bits, and the record is
//! retired once nothing but the leader output is outstanding. The readiness
//! check, the shot-done reference and the move to FREE share one critical
//! section, which is what makes retirement happen once.

use super::{Scheduler, SchedulerStats};
use crate::chain::StageChain;
use crate::error::{Result, SchedError};
use crate::frame::{FrameHandle, FrameView};
use crate::frame_queue::Buckets;
use crate::notifier::{DoneKind, DoneMessage};
use crate::stage::{HardwareStage, StageEvent, TracePoint};
use crate::types::{DoneReason, FrameState, Instance, OutputId, OutputSet, ShotType, StageId, StageSet};
use std::sync::Arc;

/// Which completion line fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneSignal {
    /// The stage's core finished processing
    Core,
    /// One output of the stage was written
    Output(OutputId),
    /// Every output of the stage was written
    AllOutputs,
}

/// Completion signal raised by a stage's interrupt path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneEvent {
    pub stage: StageId,
    pub instance: Instance,
    /// Record the signal belongs to; `None` means the oldest waiting record
    pub frame: Option<FrameHandle>,
    pub signal: DoneSignal,
    pub reason: DoneReason,
    /// Collect metadata from the stage when the completion allows it
    pub get_meta: bool,
}

impl DoneEvent {
    fn new(stage: StageId, instance: Instance, signal: DoneSignal) -> Self {
        Self {
            stage,
            instance,
            frame: None,
            signal,
            reason: DoneReason::Success,
            get_meta: true,
        }
    }

    pub fn core(stage: StageId, instance: Instance) -> Self {
        Self::new(stage, instance, DoneSignal::Core)
    }

    pub fn output(stage: StageId, instance: Instance, output: OutputId) -> Self {
        Self::new(stage, instance, DoneSignal::Output(output))
    }

    pub fn outputs(stage: StageId, instance: Instance) -> Self {
        Self::new(stage, instance, DoneSignal::AllOutputs)
    }

    pub fn with_frame(mut self, frame: FrameHandle) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_reason(mut self, reason: DoneReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn without_meta(mut self) -> Self {
        self.get_meta = false;
        self
    }
}

/// Result of a completion signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    /// The record still waits on other stages
    Pending(FrameView),
    /// This signal retired the record
    Retired(FrameView),
}

impl DoneOutcome {
    pub fn is_retired(&self) -> bool {
        matches!(self, DoneOutcome::Retired(_))
    }

    pub fn view(&self) -> &FrameView {
        match self {
            DoneOutcome::Pending(v) | DoneOutcome::Retired(v) => v,
        }
    }
}

/// Result of a frame-start signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The oldest CONFIGURED record moved to WAIT
    Started(FrameView),
    /// The frame was already waiting; nothing changed
    Duplicate(u64),
    /// A non-leader stage started; only its own state is updated
    Follower,
}

enum StartStep {
    Moved(FrameView),
    Duplicate(u64),
    Violation(String),
}

/// A record that just went back to FREE
struct Retired {
    view: FrameView,
    reports: bool,
    free: usize,
    idle: bool,
}

/// Snapshot a record still waiting for completion
fn waiting_view(b: &Buckets, handle: FrameHandle) -> Result<FrameView> {
    let view = b.get(handle)?.view();
    match b.state_of(handle)? {
        FrameState::WaitCompletion => Ok(view),
        state => Err(SchedError::NoMatchingFrame { state, fcount: view.fcount }),
    }
}

/// Retire the record if it is ready and this call drops the shot-done reference
fn try_retire(b: &mut Buckets, handle: FrameHandle, leader_output: OutputId) -> Result<Option<Retired>> {
    let record = b.get_mut(handle)?;
    if !record.is_ready_for_shot_done(leader_output) || !record.release_done_ref() {
        return Ok(None);
    }
    let view = record.view();
    let reports = record.reports_done();
    record.out_flag = OutputSet::empty();
    b.transition(handle, FrameState::Free)?;

    Ok(Some(Retired {
        view,
        reports,
        free: b.len(FrameState::Free),
        idle: b.is_empty(FrameState::Configured) && b.is_empty(FrameState::WaitCompletion),
    }))
}

impl Scheduler {
    /// Frame-start signal from `stage`
    pub fn frame_start(&self, stage: StageId, instance: Instance) -> Result<StartOutcome> {
        let chain = self.chain(instance)?;
        let hw = chain
            .stage(stage)
            .ok_or(SchedError::NotMapped { stage, instance })?;
        hw.counters().bump(StageEvent::FrameStart);

        if hw.id() != chain.leader().id() {
            hw.mark_started();
            // followers start the record the leader is about to move
            let fcount = chain
                .queue()
                .peek(FrameState::Configured)
                .map_or_else(|| hw.target_fcount(), |view| view.fcount);
            hw.trace(TracePoint::FrameStart, instance, fcount);
            return Ok(StartOutcome::Follower);
        }

        let target = hw.target_fcount();
        let trigger_driven = chain.is_trigger_driven();
        let limit = self.config.configured_flush_limit;
        let mut flushed: Vec<u64> = Vec::new();

        let step = chain.queue().with(|b| -> Result<StartStep> {
            if trigger_driven {
                while b.len(FrameState::Configured) > 1 {
                    b.proc_warn_cnt += 1;
                    if b.proc_warn_cnt <= limit {
                        break;
                    }
                    let handle = b.acquire(FrameState::Configured, FrameState::WaitCompletion)?;
                    flushed.push(b.get(handle)?.fcount);
                }
                if b.len(FrameState::Configured) <= 1 {
                    b.proc_warn_cnt = 0;
                }
            }

            if let Some(head) = b.peek(FrameState::Configured) {
                let handle = head.handle();
                b.transition(handle, FrameState::WaitCompletion)?;
                return Ok(StartStep::Moved(b.get(handle)?.view()));
            }
            if b.find(FrameState::WaitCompletion, target).is_some() {
                return Ok(StartStep::Duplicate(target));
            }
            Ok(StartStep::Violation(b.summary()))
        })?;

        for fcount in flushed {
            log::warn!("[{}][{}] flushed duplicated configured frame [F:{}]", instance, hw.name(), fcount);
        }

        match step {
            StartStep::Moved(view) => {
                if trigger_driven {
                    self.arm_watchdog(&chain);
                    let fs = hw.counters().get(StageEvent::FrameStart);
                    if chain.queue().with(|b| b.batch_num) == 1 && fs != view.fcount {
                        log::info!(
                            "[{}][{}] frame start count corrected {} -> [F:{}]",
                            instance,
                            hw.name(),
                            fs,
                            view.fcount
                        );
                        hw.counters().set(StageEvent::FrameStart, view.fcount);
                    }
                }
                hw.mark_started();
                hw.trace(TracePoint::FrameStart, instance, view.fcount);
                log::trace!("[{}][{}][F:{}] frame start", instance, hw.name(), view.fcount);
                Ok(StartOutcome::Started(view))
            }
            StartStep::Duplicate(fcount) => {
                hw.mark_started();
                SchedulerStats::bump(&self.stats.duplicate_starts);
                log::debug!("[{}][{}][F:{}] duplicated frame start", instance, hw.name(), fcount);
                Ok(StartOutcome::Duplicate(fcount))
            }
            StartStep::Violation(summary) => {
                log::error!("[{}][{}][F:{}] frame start without configured frame: {}", instance, hw.name(), target, summary);
                self.protocol_violation("frame start without configured frame");
                Err(SchedError::NoMatchingFrame {
                    state: FrameState::Configured,
                    fcount: target,
                })
            }
        }
    }

    /// Completion signal from a stage's interrupt path
    pub fn frame_done(&self, event: DoneEvent) -> Result<DoneOutcome> {
        let chain = self.chain(event.instance)?;
        let hw = chain
            .stage(event.stage)
            .ok_or(SchedError::NotMapped { stage: event.stage, instance: event.instance })?;

        let event_kind = match event.signal {
            DoneSignal::Core => StageEvent::FrameEnd,
            DoneSignal::Output(_) | DoneSignal::AllOutputs => StageEvent::DmaEnd,
        };
        hw.counters().bump(event_kind);

        let handle = match event.frame {
            Some(handle) => handle,
            None => match chain.queue().peek(FrameState::WaitCompletion) {
                Some(view) => view.handle,
                None => {
                    log::error!(
                        "[{}][{}] frame done without waiting frame: {}",
                        event.instance,
                        hw.name(),
                        chain.queue().summary()
                    );
                    self.protocol_violation("frame done without waiting frame");
                    return Err(SchedError::EmptyBucket(FrameState::WaitCompletion));
                }
            },
        };

        self.complete(&chain, hw, handle, event.signal, event.reason, event.get_meta)
    }

    /// Apply one completion for `hw` to the record
    fn complete(
        &self,
        chain: &StageChain,
        hw: &HardwareStage,
        handle: FrameHandle,
        signal: DoneSignal,
        reason: DoneReason,
        get_meta: bool,
    ) -> Result<DoneOutcome> {
        let queue = chain.queue();
        let instance = chain.instance();
        let id = hw.id();
        let leader_output = chain.leader_output();

        let view = match queue.with(|b| waiting_view(b, handle)) {
            Ok(view) => view,
            Err(e) => {
                log::error!("[{}][{}] done for a frame not waiting: {} {}", instance, hw.name(), e, queue.summary());
                self.protocol_violation("done for a frame not waiting");
                return Err(e);
            }
        };
        let point = match signal {
            DoneSignal::Core => TracePoint::FrameEnd,
            DoneSignal::Output(_) | DoneSignal::AllOutputs => TracePoint::DmaEnd,
        };
        hw.trace(point, instance, view.fcount);

        let owes_core = view.core_flag.contains(id);
        let meta = reason.is_success() && get_meta;

        let cleared = match signal {
            DoneSignal::Core => {
                if owes_core && meta {
                    self.collect_meta(chain, hw, &view);
                }
                OutputSet::empty()
            }
            DoneSignal::Output(_) | DoneSignal::AllOutputs => {
                let targets = match signal {
                    DoneSignal::Output(output) if !hw.outputs().contains(output) => {
                        return Err(SchedError::InvalidOutput(output));
                    }
                    DoneSignal::Output(output) => OutputSet::single(output),
                    _ => hw.outputs(),
                };
                let pending = targets.intersection(&view.out_flag);
                if pending.is_empty() {
                    log::warn!(
                        "[{}][{}][F:{}] invalid output done O:{:?} pending O:{:?}",
                        instance,
                        hw.name(),
                        view.fcount,
                        targets,
                        view.out_flag
                    );
                } else if meta && !owes_core {
                    self.collect_meta(chain, hw, &view);
                }
                pending.without(leader_output)
            }
        };

        let (updated, notify_outputs, retired) = queue.with(|b| -> Result<_> {
            let record = b.get_mut(handle)?;
            if signal == DoneSignal::Core {
                record.core_flag.remove(id);
            }
            for output in cleared.iter() {
                record.out_flag.remove(output);
            }
            if !reason.is_success() && record.reason.is_success() {
                record.reason = reason;
            }
            let updated = record.view();
            let notify_outputs = record.reports_done();
            let retired = try_retire(b, handle, leader_output)?;
            Ok((updated, notify_outputs, retired))
        })?;

        if notify_outputs {
            for output in cleared.iter() {
                self.post(DoneMessage {
                    kind: DoneKind::Output(output),
                    instance,
                    chain: chain.id(),
                    fcount: view.fcount,
                    rcount: view.rcount,
                    reason,
                });
            }
        }

        let stage_idle = !updated.core_flag.contains(id)
            && hw.outputs().intersection(&updated.out_flag).without(leader_output).is_empty();
        if retired.is_some() || stage_idle {
            hw.set_frame_valid(false);
        }

        match retired {
            Some(retired) => {
                self.shot_done(chain, &retired);
                Ok(DoneOutcome::Retired(retired.view))
            }
            None => Ok(DoneOutcome::Pending(updated)),
        }
    }

    fn collect_meta(&self, chain: &StageChain, hw: &HardwareStage, view: &FrameView) {
        if let Err(e) = hw.get_meta(view, chain.stage_set()) {
            log::warn!("[{}][{}][F:{}] get meta failed: {}", chain.instance(), hw.name(), view.fcount, e);
        }
    }

    /// Post-retirement bookkeeping; runs outside the queue lock
    fn shot_done(&self, chain: &StageChain, retired: &Retired) {
        let view = &retired.view;
        let instance = chain.instance();

        if retired.reports && view.out_flag.contains(chain.leader_output()) {
            self.post(DoneMessage {
                kind: DoneKind::Shot,
                instance,
                chain: chain.id(),
                fcount: view.fcount,
                rcount: view.rcount,
                reason: view.reason,
            });
        }

        if !view.reason.is_success() {
            log::warn!("[{}][{}][F:{}] SHOT_NDONE({})", instance, chain.id(), view.fcount, view.reason);
        } else {
            match view.shot_type {
                ShotType::Internal => {
                    self.registry.bump_log_count();
                }
                ShotType::Multi if !chain.is_trigger_driven() && !view.batch_last => {
                    self.schedule_mshot(instance);
                }
                ShotType::External => self.registry.reset_log_count(),
                ShotType::Multi | ShotType::Late => {}
            }
        }

        if retired.free > self.config.free_reset_level {
            self.registry.reset_bug_count();
        }
        if retired.idle && !chain.is_trigger_driven() {
            chain.leader().watchdog().cancel();
        }
        SchedulerStats::bump(&self.stats.retired);
        log::trace!("[{}][{}][F:{}] shot done", instance, chain.id(), view.fcount);
    }

    /// Force a record to retire with a non-success reason
    pub fn frame_ndone(&self, instance: Instance, frame: FrameHandle, reason: DoneReason) -> Result<DoneOutcome> {
        let chain = self.chain(instance)?;
        self.frame_ndone_on(&chain, frame, reason)
    }

    /// Walk the chain head-to-tail completing on every stage's behalf
    ///
    /// A record still in REQUESTED or CONFIGURED is moved to WAIT first.
    pub(super) fn frame_ndone_on(
        &self,
        chain: &Arc<StageChain>,
        handle: FrameHandle,
        reason: DoneReason,
    ) -> Result<DoneOutcome> {
        let queue = chain.queue();
        let leader_output = chain.leader_output();
        let leader = chain.leader().id();

        queue.with(|b| -> Result<()> {
            match b.state_of(handle)? {
                FrameState::Free => return Err(SchedError::StaleFrame { slot: handle.slot }),
                FrameState::WaitCompletion => {}
                _ => b.transition(handle, FrameState::WaitCompletion)?,
            }
            let record = b.get_mut(handle)?;
            if record.out_flag.without(leader_output).is_empty() {
                record.core_flag.insert(leader);
            }
            Ok(())
        })?;

        for stage in chain.head_to_tail() {
            let view = queue.with(|b| waiting_view(b, handle))?;
            if let Err(e) = stage.frame_ndone(&view, reason) {
                log::warn!("[{}][{}][F:{}] frame ndone failed: {}", chain.instance(), stage.name(), view.fcount, e);
            }

            let owes_core = view.core_flag.contains(stage.id());
            let owes_outputs = !stage.outputs().intersection(&view.out_flag).without(leader_output).is_empty();
            if owes_core {
                if let DoneOutcome::Retired(v) = self.complete(chain, stage, handle, DoneSignal::Core, reason, false)? {
                    return Ok(DoneOutcome::Retired(v));
                }
            }
            if owes_outputs {
                if let DoneOutcome::Retired(v) =
                    self.complete(chain, stage, handle, DoneSignal::AllOutputs, reason, false)?
                {
                    return Ok(DoneOutcome::Retired(v));
                }
            }
        }

        // outputs no stage in the chain owns
        let (view, retired) = queue.with(|b| -> Result<_> {
            let record = b.get_mut(handle)?;
            record.out_flag = record.out_flag.intersection(&OutputSet::single(leader_output));
            record.core_flag = StageSet::empty();
            if record.reason.is_success() {
                record.reason = reason;
            }
            let view = record.view();
            Ok((view, try_retire(b, handle, leader_output)?))
        })?;

        log::warn!("[{}][F:{}] frame ndone left pending state, forced retire", chain.instance(), view.fcount);
        match retired {
            Some(retired) => {
                self.shot_done(chain, &retired);
                Ok(DoneOutcome::Retired(retired.view))
            }
            None => Ok(DoneOutcome::Pending(view)),
        }
    }

    fn protocol_violation(&self, context: &str) {
        SchedulerStats::bump(&self.stats.protocol_violations);
        self.log_frame_counts();
        self.registry.report_bug(context);
    }
}
