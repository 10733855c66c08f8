//! Block drivers - simulated operation tables for the reference pipeline
//!
//! Register programming is replaced by in-memory state so the scheduler can
//! be driven end to end without hardware. Each driver is a cheap clonable
//! handle; the registry owns one clone and callers may keep another to
//! inspect state or inject faults.

use crate::chain::{ChainRoute, ChainTable};
use crate::error::{Result, StageError};
use crate::frame::FrameView;
use crate::registry::HardwareRegistry;
use crate::stage::{ParamRegion, ShotAck, StageOps};
use crate::types::{DoneReason, Instance, OutputId, OutputSet, StageId, StageSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NO_FAULT: u64 = u64::MAX;

/// Hardware block family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BlockKind {
    /// Sensor-facing front end (3AA); owns the sensor stream
    FrontEnd,
    /// Tone and colour pipeline (ISP)
    Tone,
    /// Multi-output scaler (MCSC)
    Scaler,
    /// Motion estimator (LME)
    MotionEstimator,
    /// Vision accelerator (VRA)
    Vision,
}

impl BlockKind {
    fn register_base(self) -> u32 {
        match self {
            BlockKind::FrontEnd => 0x1000,
            BlockKind::Tone => 0x2000,
            BlockKind::Scaler => 0x3000,
            BlockKind::MotionEstimator => 0x4000,
            BlockKind::Vision => 0x5000,
        }
    }
}

/// State counters of one driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverSnapshot {
    pub shots: u64,
    pub last_fcount: u64,
    pub metas: u64,
    pub ndones: u64,
    pub restores: u32,
    pub timeouts: u32,
    pub params: usize,
    pub loaded_setfiles: usize,
    pub applied_scenario: Option<u32>,
    pub streaming: bool,
}

#[derive(Default)]
struct DriverState {
    shots: u64,
    last_fcount: u64,
    metas: u64,
    ndones: u64,
    restores: u32,
    timeouts: u32,
    params: BTreeMap<u64, Vec<u32>>,
    setfiles: BTreeSet<(Instance, u32)>,
    applied: Option<u32>,
    streaming: bool,
    ndone_reasons: Vec<DoneReason>,
}

struct DriverInner {
    kind: BlockKind,
    name: String,
    outputs: OutputSet,
    state: Mutex<DriverState>,
    fail_shot_at: AtomicU64,
}

/// Simulated driver for one block
#[derive(Clone)]
pub struct BlockDriver {
    inner: Arc<DriverInner>,
}

impl BlockDriver {
    pub fn new(kind: BlockKind, name: impl Into<String>, outputs: OutputSet) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                kind,
                name: name.into(),
                outputs,
                state: Mutex::new(DriverState::default()),
                fail_shot_at: AtomicU64::new(NO_FAULT),
            }),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.inner.kind
    }

    pub fn outputs(&self) -> OutputSet {
        self.inner.outputs
    }

    /// Reject the shot for frame `fcount` once
    pub fn fail_shot_at(&self, fcount: u64) {
        self.inner.fail_shot_at.store(fcount, Ordering::Release);
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        let state = self.inner.state.lock();
        DriverSnapshot {
            shots: state.shots,
            last_fcount: state.last_fcount,
            metas: state.metas,
            ndones: state.ndones,
            restores: state.restores,
            timeouts: state.timeouts,
            params: state.params.len(),
            loaded_setfiles: state.setfiles.len(),
            applied_scenario: state.applied,
            streaming: state.streaming,
        }
    }

    pub fn ndone_reasons(&self) -> Vec<DoneReason> {
        self.inner.state.lock().ndone_reasons.clone()
    }

    /// Whether a shot of `frame` is followed by a core-done signal
    fn owes_core_done(&self, frame: &FrameView) -> bool {
        match self.inner.kind {
            BlockKind::Vision => true,
            BlockKind::MotionEstimator => self.inner.outputs.intersection(&frame.out_flag).is_empty(),
            _ => false,
        }
    }
}

impl StageOps for BlockDriver {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn open(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        *self.inner.state.lock() = DriverState::default();
        Ok(())
    }

    fn shot(&self, frame: &FrameView, _active: StageSet) -> std::result::Result<ShotAck, StageError> {
        if self
            .inner
            .fail_shot_at
            .compare_exchange(frame.fcount, NO_FAULT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Err(StageError::Rejected(format!("shot [F:{}] refused", frame.fcount)));
        }

        let mut state = self.inner.state.lock();
        state.shots += 1;
        state.last_fcount = frame.fcount;
        Ok(ShotAck {
            core_done: self.owes_core_done(frame),
        })
    }

    fn set_param(
        &self,
        region: &ParamRegion,
        lindex: u64,
        hindex: u64,
        _instance: Instance,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        if hindex < lindex {
            return Err(StageError::InvalidArgument(format!("index range {}..{}", lindex, hindex)));
        }
        self.inner.state.lock().params.insert(lindex, region.words.clone());
        Ok(())
    }

    fn get_meta(&self, _frame: &FrameView, _active: StageSet) -> std::result::Result<(), StageError> {
        self.inner.state.lock().metas += 1;
        Ok(())
    }

    fn frame_ndone(
        &self,
        _frame: &FrameView,
        _instance: Instance,
        reason: DoneReason,
    ) -> std::result::Result<(), StageError> {
        let mut state = self.inner.state.lock();
        state.ndones += 1;
        state.ndone_reasons.push(reason);
        Ok(())
    }

    fn load_setfile(
        &self,
        instance: Instance,
        scenario: u32,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        self.inner.state.lock().setfiles.insert((instance, scenario));
        Ok(())
    }

    fn apply_setfile(
        &self,
        instance: Instance,
        scenario: u32,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        let mut state = self.inner.state.lock();
        if !state.setfiles.contains(&(instance, scenario)) {
            return Err(StageError::Rejected(format!("scenario {} not loaded", scenario)));
        }
        state.applied = Some(scenario);
        Ok(())
    }

    fn delete_setfile(
        &self,
        instance: Instance,
        scenario: u32,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        let mut state = self.inner.state.lock();
        state.setfiles.remove(&(instance, scenario));
        if state.applied == Some(scenario) {
            state.applied = None;
        }
        Ok(())
    }

    fn restore(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        self.inner.state.lock().restores += 1;
        Ok(())
    }

    fn notify_timeout(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        self.inner.state.lock().timeouts += 1;
        Ok(())
    }

    fn sensor_start(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        if self.inner.kind == BlockKind::FrontEnd {
            self.inner.state.lock().streaming = true;
        }
        Ok(())
    }

    fn sensor_stop(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        match self.inner.kind {
            BlockKind::FrontEnd => {
                self.inner.state.lock().streaming = false;
                Ok(())
            }
            _ => Err(StageError::Unsupported),
        }
    }

    fn dump_registers(&self) -> Vec<(u32, u32)> {
        let base = self.inner.kind.register_base();
        let state = self.inner.state.lock();
        vec![
            (base, state.last_fcount as u32),
            (base + 0x4, state.shots as u32),
            (base + 0x8, state.applied.unwrap_or(0)),
            (base + 0xC, state.restores),
            (base + 0x10, self.inner.outputs.bits() as u32),
        ]
    }
}

/// Stage ids of the reference pipeline
pub mod ids {
    use crate::types::{ChainId, OutputId, StageId};

    pub const FRONT_END: StageId = StageId(0);
    pub const TONE: StageId = StageId(1);
    pub const SCALER: StageId = StageId(2);
    pub const VISION: StageId = StageId(3);
    pub const MOTION: StageId = StageId(4);
    pub const SCALER_ALT: StageId = StageId(5);

    /// Front-end capture; leader output of the sensor chain
    pub const FRONT_CAPTURE: OutputId = OutputId(0);
    pub const FRONT_STATS: OutputId = OutputId(1);
    pub const TONE_OUT: OutputId = OutputId(2);
    pub const SCALER_PREVIEW: OutputId = OutputId(3);
    pub const SCALER_CAPTURE: OutputId = OutputId(4);
    /// Motion vectors; leader output of the memory-to-memory chain
    pub const MOTION_OUT: OutputId = OutputId(5);
    pub const SCALER_ALT_OUT: OutputId = OutputId(6);

    pub const SENSOR_CHAIN: ChainId = ChainId(0);
    pub const MOTION_CHAIN: ChainId = ChainId(1);
}

/// Registry, route table and driver handles of the reference pipeline
pub struct ReferenceLayout {
    pub registry: HardwareRegistry,
    pub table: ChainTable,
    pub drivers: BTreeMap<StageId, BlockDriver>,
}

fn outputs(ids: &[OutputId]) -> OutputSet {
    ids.iter().copied().collect()
}

/// Sensor chain FrontEnd -> Tone -> Scaler -> Vision and a standalone
/// motion-estimator chain
pub fn reference_layout(bug_threshold: Option<u32>) -> Result<ReferenceLayout> {
    use ids::*;

    let blocks = [
        (FRONT_END, BlockKind::FrontEnd, "3AA", outputs(&[FRONT_CAPTURE, FRONT_STATS])),
        (TONE, BlockKind::Tone, "ISP", outputs(&[TONE_OUT])),
        (SCALER, BlockKind::Scaler, "MCSC0", outputs(&[SCALER_PREVIEW, SCALER_CAPTURE])),
        (VISION, BlockKind::Vision, "VRA", OutputSet::empty()),
        (MOTION, BlockKind::MotionEstimator, "LME", outputs(&[MOTION_OUT])),
        (SCALER_ALT, BlockKind::Scaler, "MCSC1", outputs(&[SCALER_ALT_OUT])),
    ];

    let mut registry = HardwareRegistry::new(bug_threshold);
    let mut drivers = BTreeMap::new();
    for (id, kind, name, outs) in blocks {
        let driver = BlockDriver::new(kind, name, outs);
        registry.register(id, outs, Box::new(driver.clone()))?;
        drivers.insert(id, driver);
    }

    let table: ChainTable = [
        ChainRoute {
            id: SENSOR_CHAIN,
            name: "sensor-otf".into(),
            stages: vec![FRONT_END, TONE, SCALER, VISION],
            leader_output: FRONT_CAPTURE,
        },
        ChainRoute {
            id: MOTION_CHAIN,
            name: "m2m-lme".into(),
            stages: vec![MOTION],
            leader_output: MOTION_OUT,
        },
    ]
    .into_iter()
    .collect();

    Ok(ReferenceLayout { registry, table, drivers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameRecord, FrameTemplate};

    fn view(out_flag: OutputSet) -> FrameView {
        let mut record = FrameRecord::new(0);
        record.fill_from(Instance(0), &FrameTemplate::new(3, out_flag));
        record.view()
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let driver = BlockDriver::new(BlockKind::Tone, "ISP", OutputSet::single(OutputId(2)));
        driver.fail_shot_at(3);
        let frame = view(OutputSet::single(OutputId(2)));

        assert!(driver.shot(&frame, StageSet::empty()).is_err());
        assert!(driver.shot(&frame, StageSet::empty()).is_ok());
        assert_eq!(driver.snapshot().shots, 1);
    }

    #[test]
    fn test_motion_core_done_without_outputs() {
        let driver = BlockDriver::new(BlockKind::MotionEstimator, "LME", OutputSet::single(OutputId(5)));
        let with_output = driver.shot(&view(OutputSet::single(OutputId(5))), StageSet::empty()).unwrap();
        let without = driver.shot(&view(OutputSet::empty()), StageSet::empty()).unwrap();
        assert!(!with_output.core_done);
        assert!(without.core_done);
    }

    #[test]
    fn test_apply_requires_load() {
        let driver = BlockDriver::new(BlockKind::Scaler, "MCSC0", OutputSet::empty());
        assert!(driver.apply_setfile(Instance(0), 2, StageSet::empty()).is_err());
        driver.load_setfile(Instance(0), 2, StageSet::empty()).unwrap();
        driver.apply_setfile(Instance(0), 2, StageSet::empty()).unwrap();
        assert_eq!(driver.snapshot().applied_scenario, Some(2));
        driver.delete_setfile(Instance(0), 2, StageSet::empty()).unwrap();
        assert_eq!(driver.snapshot().applied_scenario, None);
    }

    #[test]
    fn test_reference_layout_routes() {
        let layout = reference_layout(None).unwrap();
        assert_eq!(layout.table.len(), 2);
        assert_eq!(layout.registry.stages().count(), 6);
        let route = layout.table.get(ids::SENSOR_CHAIN).unwrap();
        assert_eq!(route.stages.first(), Some(&ids::FRONT_END));
        assert!(layout.drivers[&ids::FRONT_END].outputs().contains(route.leader_output));
    }
}
