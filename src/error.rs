//! Error types for the scheduler and the stage operation table

use crate::types::{ChainId, FrameState, Instance, OutputId, StageId};
use thiserror::Error;

/// Failure reported by a [`StageOps`](crate::stage::StageOps) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("hardware rejected the request: {0}")]
    Rejected(String),
    #[error("stage busy")]
    Busy,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation not supported")]
    Unsupported,
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

/// Scheduler, queue and lifecycle errors
#[derive(Debug, Clone, Error)]
pub enum SchedError {
    #[error("frame pool exhausted ({capacity} records, {needed} needed)")]
    PoolExhausted { capacity: usize, needed: usize },
    #[error("{0} bucket is empty")]
    EmptyBucket(FrameState),
    #[error("stale frame handle (slot {slot})")]
    StaleFrame { slot: usize },
    #[error("no frame [F:{fcount}] in {state}")]
    NoMatchingFrame { state: FrameState, fcount: u64 },
    #[error("unknown stage {0}")]
    InvalidStage(StageId),
    #[error("unknown output {0}")]
    InvalidOutput(OutputId),
    #[error("unknown chain {0}")]
    ChainNotFound(ChainId),
    #[error("no chain opened for instance {0}")]
    NoChain(Instance),
    #[error("stage {0} is not opened")]
    NotOpened(StageId),
    #[error("stage {stage} is not initialized for {instance}")]
    NotInitialized { stage: StageId, instance: Instance },
    #[error("stage {stage} is not mapped for {instance}")]
    NotMapped { stage: StageId, instance: Instance },
    #[error("chain for {0} has a dispatch outstanding")]
    Busy(Instance),
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: StageError,
    },
    #[error("device callback failed: {0}")]
    Hook(StageError),
    #[error("invalid scenario {0}")]
    InvalidScenario(u32),
    #[error("notifier queue full")]
    NotifierFull,
    #[error("notifier disconnected")]
    NotifierClosed,
    #[error("no runtime available for timers")]
    NoRuntime,
}

impl SchedError {
    pub fn stage(stage: StageId, source: StageError) -> Self {
        SchedError::Stage { stage, source }
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
