//! # RayOS ISChain - imaging stage-chain scheduler
//!
//! Drives chains of fixed-function imaging blocks: admits caller frames,
//! dispatches them down each chain in a safe order, aggregates per-stage
//! completion into a single shot-done, and recovers from stalls.
//!
//! ## Architecture
//!
//! - **Frame Queue**: fixed pool of frame records bucketed FREE / REQUESTED /
//!   CONFIGURED / WAIT-COMPLETION
//! - **Hardware Registry**: arena of stages with refcounted open/close,
//!   event counters and a debug trace
//! - **Scheduler**: grp_shot, shot, config lock, frame start, frame done,
//!   watchdog recovery and chain lifecycle
//!
//! ## Example
//!
//! ```no_run
//! use rayos_ischain::stages::{ids, reference_layout};
//! use rayos_ischain::{ChainConfig, Instance, Scheduler, SchedulerConfig, TriggerMode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SchedulerConfig::default();
//!     let layout = reference_layout(config.bug_threshold)?;
//!     let scheduler = Scheduler::new(Arc::new(layout.registry), layout.table, config)?;
//!
//!     scheduler.open_chain(
//!         Instance(0),
//!         ids::MOTION_CHAIN,
//!         ChainConfig { trigger: TriggerMode::OnDemand, shot_timeout_ms: 100, run_ahead: 1 },
//!     )?;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod error;
pub mod frame;
pub mod frame_queue;
pub mod notifier;
pub mod registry;
pub mod scheduler;
pub mod stage;
pub mod stages;
pub mod types;
pub mod watchdog;

pub use chain::{ChainRoute, ChainTable, StageChain};
pub use error::{Result, SchedError, StageError};
pub use frame::{FrameHandle, FrameTemplate, FrameView, PlaneBuffer};
pub use frame_queue::FrameQueue;
pub use notifier::{DeviceHooks, DoneKind, DoneMessage, DoneNotifier, NoopHooks};
pub use registry::HardwareRegistry;
pub use scheduler::{DoneEvent, DoneOutcome, DoneSignal, LockOutcome, Scheduler, SchedulerStatistics, StartOutcome};
pub use stage::{HardwareStage, ParamRegion, ShotAck, StageOps};
pub use types::*;
