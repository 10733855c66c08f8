//! Shared fixtures for the scheduler integration tests

#![allow(dead_code)]

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use rayos_ischain::{
    ChainConfig, ChainId, ChainRoute, ChainTable, DeviceHooks, DoneEvent, DoneMessage, DoneReason, FrameView, HardwareRegistry,
    Instance, NoopHooks, OutputId, OutputSet, ParamRegion, Scheduler, SchedulerConfig, ShotAck, StageChain,
    StageError, StageId, StageOps, StageSet, TriggerMode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

pub const HEAD: StageId = StageId(0);
pub const MID: StageId = StageId(1);
pub const TAIL: StageId = StageId(2);
pub const M2M: StageId = StageId(3);
pub const ALT: StageId = StageId(4);

/// Leader output of the three-stage route
pub const LEADER: OutputId = OutputId(0);
pub const HEAD_STATS: OutputId = OutputId(1);
pub const MID_OUT: OutputId = OutputId(2);
pub const TAIL_OUT: OutputId = OutputId(3);
pub const M2M_OUT: OutputId = OutputId(4);
pub const ALT_OUT: OutputId = OutputId(5);

/// head -> mid -> tail
pub const LINE: ChainId = ChainId(0);
/// single memory-to-memory stage
pub const SINGLE: ChainId = ChainId(1);

const NO_FAULT: u64 = u64::MAX;

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub stage: &'static str,
    pub op: &'static str,
    pub value: u64,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Driver stub that records every call into a shared log
pub struct StubOps {
    name: &'static str,
    calls: CallLog,
    core_done: bool,
    fail_at: Arc<AtomicU64>,
}

impl StubOps {
    fn record(&self, op: &'static str, value: u64) {
        self.calls.lock().push(Call { stage: self.name, op, value });
    }
}

impl StageOps for StubOps {
    fn name(&self) -> &str {
        self.name
    }

    fn init(&self, _instance: Instance, replicated: bool, _module_id: u32) -> Result<(), StageError> {
        self.record("init", u64::from(replicated));
        Ok(())
    }

    fn shot(&self, frame: &FrameView, _active: StageSet) -> Result<ShotAck, StageError> {
        self.record("shot", frame.fcount);
        if self.fail_at.load(Ordering::SeqCst) == frame.fcount {
            return Err(StageError::Rejected(format!("fault injected at {}", frame.fcount)));
        }
        Ok(ShotAck { core_done: self.core_done })
    }

    fn set_param(
        &self,
        region: &ParamRegion,
        _lindex: u64,
        _hindex: u64,
        _instance: Instance,
        _active: StageSet,
    ) -> Result<(), StageError> {
        self.record("set_param", region.words.len() as u64);
        Ok(())
    }

    fn frame_ndone(&self, frame: &FrameView, _instance: Instance, _reason: DoneReason) -> Result<(), StageError> {
        self.record("ndone", frame.fcount);
        Ok(())
    }

    fn load_setfile(&self, _instance: Instance, scenario: u32, _active: StageSet) -> Result<(), StageError> {
        self.record("load_setfile", u64::from(scenario));
        Ok(())
    }

    fn apply_setfile(&self, _instance: Instance, scenario: u32, _active: StageSet) -> Result<(), StageError> {
        self.record("apply_setfile", u64::from(scenario));
        Ok(())
    }

    fn delete_setfile(&self, _instance: Instance, scenario: u32, _active: StageSet) -> Result<(), StageError> {
        self.record("delete_setfile", u64::from(scenario));
        Ok(())
    }

    fn restore(&self, _instance: Instance) -> Result<(), StageError> {
        self.record("restore", 0);
        Ok(())
    }

    fn notify_timeout(&self, _instance: Instance) -> Result<(), StageError> {
        self.record("notify_timeout", 0);
        Ok(())
    }

    fn change_chain(&self, _instance: Instance, next: StageId) -> Result<(), StageError> {
        self.record("change_chain", u64::from(next.0));
        Ok(())
    }

    fn dump_registers(&self) -> Vec<(u32, u32)> {
        vec![(0x0, 0x1), (0x4, 0x2)]
    }
}

/// Device hooks that remember late frames and shot callbacks
#[derive(Default)]
pub struct RecordingHooks {
    pub late: Mutex<Vec<u64>>,
    pub shot: Mutex<Vec<FrameView>>,
}

impl DeviceHooks for RecordingHooks {
    fn shot_callback(&self, _instance: Instance, frame: &FrameView) -> Result<(), StageError> {
        self.shot.lock().push(*frame);
        Ok(())
    }

    fn late_shot(&self, _instance: Instance, frame: &FrameView) {
        self.late.lock().push(frame.fcount);
    }
}

/// Scheduler over five stub stages
///
/// `LINE` routes head -> mid -> tail (the tail reports core-done), `SINGLE`
/// is the m2m stage alone. `ALT` is registered but on no route.
pub struct Rig {
    pub scheduler: Arc<Scheduler>,
    pub calls: CallLog,
    faults: Vec<Arc<AtomicU64>>,
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        bug_threshold: None,
        notifier_capacity: 1024,
        ..SchedulerConfig::default()
    }
}

impl Rig {
    /// Must be called from inside a tokio runtime
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(config: SchedulerConfig, hooks: Arc<dyn DeviceHooks>) -> Self {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HardwareRegistry::new(config.bug_threshold);
        let mut faults = Vec::new();

        let blocks: [(StageId, &'static str, &[OutputId], bool); 5] = [
            (HEAD, "head", &[LEADER, HEAD_STATS], false),
            (MID, "mid", &[MID_OUT], false),
            (TAIL, "tail", &[TAIL_OUT], true),
            (M2M, "m2m", &[M2M_OUT], false),
            (ALT, "alt", &[ALT_OUT], false),
        ];
        for (id, name, outputs, core_done) in blocks {
            let fail_at = Arc::new(AtomicU64::new(NO_FAULT));
            let ops = StubOps {
                name,
                calls: Arc::clone(&calls),
                core_done,
                fail_at: Arc::clone(&fail_at),
            };
            registry
                .register(id, outputs.iter().copied().collect(), Box::new(ops))
                .unwrap();
            faults.push(fail_at);
        }

        let table: ChainTable = [
            ChainRoute {
                id: LINE,
                name: "line".into(),
                stages: vec![HEAD, MID, TAIL],
                leader_output: LEADER,
            },
            ChainRoute {
                id: SINGLE,
                name: "single".into(),
                stages: vec![M2M],
                leader_output: M2M_OUT,
            },
        ]
        .into_iter()
        .collect();

        let scheduler = Scheduler::with_hooks(Arc::new(registry), table, config, hooks, Handle::current());
        Self { scheduler, calls, faults }
    }

    pub fn open(&self, instance: Instance, chain: ChainId, trigger: TriggerMode, timeout_ms: u64) -> Arc<StageChain> {
        self.scheduler
            .open_chain(
                instance,
                chain,
                ChainConfig {
                    trigger,
                    shot_timeout_ms: timeout_ms,
                    run_ahead: 1,
                },
            )
            .unwrap()
    }

    /// Make `stage` reject the shot of frame `fcount`
    pub fn fail_shot_at(&self, stage: StageId, fcount: u64) {
        self.faults[stage.0 as usize].store(fcount, Ordering::SeqCst);
    }

    pub fn calls(&self, op: &str) -> Vec<Call> {
        self.calls.lock().iter().filter(|c| c.op == op).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

/// Every output of the line route
pub fn line_outputs() -> OutputSet {
    [LEADER, HEAD_STATS, MID_OUT, TAIL_OUT].into_iter().collect()
}

/// Done signals that complete a record dispatched on the line route
pub fn line_signals(instance: Instance, view: &FrameView) -> Vec<DoneEvent> {
    vec![
        DoneEvent::outputs(HEAD, instance).with_frame(view.handle),
        DoneEvent::output(MID, instance, MID_OUT).with_frame(view.handle),
        DoneEvent::core(TAIL, instance).with_frame(view.handle),
        DoneEvent::outputs(TAIL, instance).with_frame(view.handle),
    ]
}

pub fn drain(rx: &Receiver<DoneMessage>) -> Vec<DoneMessage> {
    rx.try_iter().collect()
}
