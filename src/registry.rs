//! Hardware Registry - arena of every stage in the system
//!
//! Owns the stage handles, the per-instance logical/physical activation maps,
//! per-sensor streaming state and the diagnostic counters that feed the
//! fail-fast threshold.

use crate::error::{Result, SchedError};
use crate::stage::{FrameCounts, HardwareStage, RegisterDump, StageOps};
use crate::types::{Instance, OutputSet, StageFlags, StageId, StageSet, MAX_SET_INDEX};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Activation maps of one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceMap {
    /// Stages the instance has opened
    pub logical: StageSet,
    /// Stages currently wired into the instance's chain
    pub physical: StageSet,
}

/// One row of a frame-count dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCounts {
    pub stage: StageId,
    pub name: String,
    pub counts: FrameCounts,
    pub target_fcount: u64,
}

pub struct HardwareRegistry {
    stages: Vec<Option<Arc<HardwareStage>>>,
    maps: RwLock<HashMap<Instance, InstanceMap>>,
    sensor_position: RwLock<HashMap<Instance, u32>>,
    streaming: RwLock<HashMap<u32, bool>>,
    bug_count: AtomicU32,
    log_count: AtomicU32,
    overflow_recovery: AtomicBool,
    bug_threshold: Option<u32>,
}

impl HardwareRegistry {
    pub fn new(bug_threshold: Option<u32>) -> Self {
        Self {
            stages: Vec::new(),
            maps: RwLock::new(HashMap::new()),
            sensor_position: RwLock::new(HashMap::new()),
            streaming: RwLock::new(HashMap::new()),
            bug_count: AtomicU32::new(0),
            log_count: AtomicU32::new(0),
            overflow_recovery: AtomicBool::new(false),
            bug_threshold,
        }
    }

    /// Register a block; done once at startup, before the registry is shared
    pub fn register(
        &mut self,
        id: StageId,
        outputs: OutputSet,
        ops: Box<dyn StageOps>,
    ) -> Result<Arc<HardwareStage>> {
        if id.0 > MAX_SET_INDEX {
            return Err(SchedError::InvalidStage(id));
        }
        let index = id.0 as usize;
        if self.stages.len() <= index {
            self.stages.resize(index + 1, None);
        }
        if self.stages[index].is_some() {
            return Err(SchedError::InvalidStage(id));
        }

        let stage = Arc::new(HardwareStage::new(id, outputs, ops));
        log::debug!("registered {} as {}", stage.name(), id);
        self.stages[index] = Some(Arc::clone(&stage));
        Ok(stage)
    }

    pub fn stage(&self, id: StageId) -> Result<&Arc<HardwareStage>> {
        self.stages
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SchedError::InvalidStage(id))
    }

    pub fn stages(&self) -> impl Iterator<Item = &Arc<HardwareStage>> {
        self.stages.iter().flatten()
    }

    pub fn map(&self, instance: Instance) -> InstanceMap {
        self.maps.read().get(&instance).copied().unwrap_or_default()
    }

    pub fn set_mapped(&self, instance: Instance, id: StageId) {
        let mut maps = self.maps.write();
        let map = maps.entry(instance).or_default();
        map.logical.insert(id);
        map.physical.insert(id);
    }

    pub fn clear_mapped(&self, instance: Instance, id: StageId) {
        let mut maps = self.maps.write();
        if let Some(map) = maps.get_mut(&instance) {
            map.logical.remove(id);
            map.physical.remove(id);
            if map.logical.is_empty() && map.physical.is_empty() {
                maps.remove(&instance);
            }
        }
    }

    /// Put a stage on the instance's route without making it part of the
    /// route it was opened with
    pub fn set_physical(&self, instance: Instance, id: StageId) {
        self.maps.write().entry(instance).or_default().physical.insert(id);
    }

    /// Take a stage out of the instance's route while it stays opened
    pub fn clear_physical(&self, instance: Instance, id: StageId) {
        if let Some(map) = self.maps.write().get_mut(&instance) {
            map.physical.remove(id);
        }
    }

    pub fn set_sensor_position(&self, instance: Instance, position: u32) {
        self.sensor_position.write().insert(instance, position);
    }

    pub fn sensor_position(&self, instance: Instance) -> u32 {
        self.sensor_position.read().get(&instance).copied().unwrap_or(0)
    }

    pub fn set_streaming(&self, instance: Instance, on: bool) {
        let position = self.sensor_position(instance);
        self.streaming.write().insert(position, on);
    }

    pub fn is_streaming(&self, instance: Instance) -> bool {
        let position = self.sensor_position(instance);
        self.streaming.read().get(&position).copied().unwrap_or(false)
    }

    /// Count a protocol anomaly; aborts once the configured threshold is passed
    pub fn report_bug(&self, context: &str) -> u32 {
        let count = self.bug_count.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!("bug count {} ({})", count, context);
        if let Some(threshold) = self.bug_threshold {
            if count > threshold {
                for row in self.frame_counts() {
                    log::error!(
                        "[{}] fs({}) cl({}) fe({}) dma({}) target F:{}",
                        row.name,
                        row.counts.fs,
                        row.counts.cl,
                        row.counts.fe,
                        row.counts.dma,
                        row.target_fcount
                    );
                }
                panic!("bug count {} exceeded threshold {}: {}", count, threshold, context);
            }
        }
        count
    }

    pub fn bug_count(&self) -> u32 {
        self.bug_count.load(Ordering::Acquire)
    }

    pub fn reset_bug_count(&self) {
        self.bug_count.store(0, Ordering::Release);
    }

    /// Consecutive internal shots, returns the new value
    pub fn bump_log_count(&self) -> u32 {
        self.log_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn log_count(&self) -> u32 {
        self.log_count.load(Ordering::Acquire)
    }

    pub fn reset_log_count(&self) {
        self.log_count.store(0, Ordering::Release);
    }

    pub fn set_overflow_recovery(&self, on: bool) {
        self.overflow_recovery.store(on, Ordering::Release);
    }

    pub fn overflow_recovery(&self) -> bool {
        self.overflow_recovery.load(Ordering::Acquire)
    }

    /// Counters of every opened stage
    pub fn frame_counts(&self) -> Vec<StageCounts> {
        self.stages()
            .filter(|s| s.has(StageFlags::OPENED))
            .map(|s| StageCounts {
                stage: s.id(),
                name: s.name().to_string(),
                counts: s.counters().snapshot(),
                target_fcount: s.target_fcount(),
            })
            .collect()
    }

    /// Register snapshot of one stage, or of every opened stage
    pub fn dump_registers(&self, id: Option<StageId>) -> Result<Vec<RegisterDump>> {
        match id {
            Some(id) => Ok(vec![self.stage(id)?.dump_registers()]),
            None => Ok(self
                .stages()
                .filter(|s| s.has(StageFlags::OPENED))
                .map(|s| s.dump_registers())
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::frame::FrameView;
    use crate::stage::ShotAck;

    struct Dummy;

    impl StageOps for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }

        fn shot(&self, _frame: &FrameView, _active: StageSet) -> std::result::Result<ShotAck, StageError> {
            Ok(ShotAck::default())
        }

        fn dump_registers(&self) -> Vec<(u32, u32)> {
            vec![(0x0, 0xCAFE)]
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = HardwareRegistry::new(None);
        registry.register(StageId(2), OutputSet::empty(), Box::new(Dummy)).unwrap();
        assert!(registry.register(StageId(2), OutputSet::empty(), Box::new(Dummy)).is_err());
        assert!(registry.register(StageId(64), OutputSet::empty(), Box::new(Dummy)).is_err());
        assert!(registry.stage(StageId(2)).is_ok());
        assert!(registry.stage(StageId(1)).is_err());
        assert_eq!(registry.stages().count(), 1);
    }

    #[test]
    fn test_maps_and_streaming() {
        let registry = HardwareRegistry::new(None);
        registry.set_mapped(Instance(1), StageId(3));
        registry.set_mapped(Instance(1), StageId(4));
        registry.clear_physical(Instance(1), StageId(4));

        let map = registry.map(Instance(1));
        assert!(map.logical.contains(StageId(4)));
        assert!(!map.physical.contains(StageId(4)));

        registry.set_sensor_position(Instance(1), 2);
        registry.set_streaming(Instance(1), true);
        assert!(registry.is_streaming(Instance(1)));
        assert!(!registry.is_streaming(Instance(0)));
    }

    #[test]
    fn test_dump_only_opened() {
        let mut registry = HardwareRegistry::new(None);
        let stage = registry.register(StageId(0), OutputSet::empty(), Box::new(Dummy)).unwrap();
        registry.register(StageId(1), OutputSet::empty(), Box::new(Dummy)).unwrap();
        stage.open(Instance(0)).unwrap();

        let dumps = registry.dump_registers(None).unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].registers, vec![(0x0, 0xCAFE)]);
    }

    #[test]
    fn test_bug_count_below_threshold() {
        let registry = HardwareRegistry::new(Some(2));
        registry.report_bug("a");
        registry.report_bug("b");
        assert_eq!(registry.bug_count(), 2);
        registry.reset_bug_count();
        assert_eq!(registry.bug_count(), 0);
    }

    #[test]
    #[should_panic(expected = "exceeded threshold")]
    fn test_bug_count_fail_fast() {
        let registry = HardwareRegistry::new(Some(1));
        registry.report_bug("first");
        registry.report_bug("second");
    }
}
