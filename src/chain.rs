//! Stage Chain - ordered route of stages for one stream instance
//!
//! Chains are immutable. A topology change builds a new chain that shares
//! the old one's frame queue and swaps it in as a whole.

use crate::error::{Result, SchedError};
use crate::frame_queue::FrameQueue;
use crate::stage::HardwareStage;
use crate::types::{ChainConfig, ChainId, Instance, OutputId, StageId, StageSet, TriggerMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Static description of one physical route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRoute {
    pub id: ChainId,
    pub name: String,
    /// Head first
    pub stages: Vec<StageId>,
    /// Output that stands for the whole shot
    pub leader_output: OutputId,
}

/// Route table, resolved once per pipeline open
#[derive(Debug, Clone, Default)]
pub struct ChainTable {
    routes: BTreeMap<u32, ChainRoute>,
}

impl ChainTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, route: ChainRoute) {
        self.routes.insert(route.id.0, route);
    }

    pub fn get(&self, id: ChainId) -> Result<&ChainRoute> {
        self.routes.get(&id.0).ok_or(SchedError::ChainNotFound(id))
    }

    pub fn routes(&self) -> impl Iterator<Item = &ChainRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<ChainRoute> for ChainTable {
    fn from_iter<I: IntoIterator<Item = ChainRoute>>(iter: I) -> Self {
        let mut table = ChainTable::new();
        for route in iter {
            table.insert(route);
        }
        table
    }
}

/// Resolved chain bound to one instance
pub struct StageChain {
    id: ChainId,
    instance: Instance,
    stages: Vec<Arc<HardwareStage>>,
    leader_output: OutputId,
    config: ChainConfig,
    queue: Arc<FrameQueue>,
}

impl StageChain {
    pub fn new(
        id: ChainId,
        instance: Instance,
        stages: Vec<Arc<HardwareStage>>,
        leader_output: OutputId,
        config: ChainConfig,
        queue: Arc<FrameQueue>,
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(SchedError::ChainNotFound(id));
        }
        Ok(Self {
            id,
            instance,
            stages,
            leader_output,
            config,
            queue,
        })
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    /// Head stage; it raises frame start and owns the shot watchdog
    pub fn leader(&self) -> &Arc<HardwareStage> {
        &self.stages[0]
    }

    pub fn leader_output(&self) -> OutputId {
        self.leader_output
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn is_trigger_driven(&self) -> bool {
        self.config.trigger == TriggerMode::FreeRunning
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn head_to_tail(&self) -> impl DoubleEndedIterator<Item = &Arc<HardwareStage>> {
        self.stages.iter()
    }

    /// Downstream first; dispatch order
    pub fn tail_to_head(&self) -> impl Iterator<Item = &Arc<HardwareStage>> {
        self.stages.iter().rev()
    }

    pub fn stage(&self, id: StageId) -> Option<&Arc<HardwareStage>> {
        self.stages.iter().find(|s| s.id() == id)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.stage(id).is_some()
    }

    pub fn stage_set(&self) -> StageSet {
        self.stages.iter().map(|s| s.id()).collect()
    }

    /// Copy of this chain with `from` replaced by `to`
    pub fn replaced(&self, from: StageId, to: Arc<HardwareStage>) -> Result<StageChain> {
        let position = self
            .stages
            .iter()
            .position(|s| s.id() == from)
            .ok_or(SchedError::NotMapped { stage: from, instance: self.instance })?;
        let mut stages = self.stages.clone();
        stages[position] = to;
        StageChain::new(
            self.id,
            self.instance,
            stages,
            self.leader_output,
            self.config,
            Arc::clone(&self.queue),
        )
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("StageChain")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("stages", &names)
            .field("trigger", &self.config.trigger)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::frame::FrameView;
    use crate::stage::{ShotAck, StageOps};
    use crate::types::OutputSet;

    struct Named(&'static str);

    impl StageOps for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn shot(&self, _frame: &FrameView, _active: StageSet) -> std::result::Result<ShotAck, StageError> {
            Ok(ShotAck::default())
        }
    }

    fn stage(id: u8, name: &'static str) -> Arc<HardwareStage> {
        Arc::new(HardwareStage::new(StageId(id), OutputSet::empty(), Box::new(Named(name))))
    }

    fn config() -> ChainConfig {
        ChainConfig {
            trigger: TriggerMode::OnDemand,
            shot_timeout_ms: 100,
            run_ahead: 1,
        }
    }

    #[test]
    fn test_order_and_replace() {
        let chain = StageChain::new(
            ChainId(0),
            Instance(0),
            vec![stage(0, "fe"), stage(1, "tone"), stage(2, "scaler")],
            OutputId(0),
            config(),
            Arc::new(FrameQueue::new(4)),
        )
        .unwrap();

        let order: Vec<&str> = chain.tail_to_head().map(|s| s.name()).collect();
        assert_eq!(order, vec!["scaler", "tone", "fe"]);
        assert_eq!(chain.leader().name(), "fe");

        let swapped = chain.replaced(StageId(1), stage(7, "tone-b")).unwrap();
        assert!(swapped.contains(StageId(7)));
        assert!(!swapped.contains(StageId(1)));
        assert!(Arc::ptr_eq(swapped.queue(), chain.queue()));
        assert!(chain.replaced(StageId(9), stage(8, "x")).is_err());
    }

    #[test]
    fn test_route_table_lookup() {
        let mut table = ChainTable::new();
        table.insert(ChainRoute {
            id: ChainId(3),
            name: "m2m".into(),
            stages: vec![StageId(4)],
            leader_output: OutputId(10),
        });
        assert_eq!(table.get(ChainId(3)).unwrap().stages, vec![StageId(4)]);
        assert!(matches!(table.get(ChainId(1)), Err(SchedError::ChainNotFound(_))));
    }
}
