//! Scheduler - shot / completion protocol over the stage chains
//!
//! The scheduler is the composition root: it owns the chain map, the done
//! notifier, the multi-shot worker and the statistics, and borrows the
//! hardware registry. Entry points are grouped by concern:
//!
//! - `dispatch`: admission (`grp_shot`), dispatch (`shot`), config lock
//! - `completion`: frame start, frame done, shot done, frame not-done
//! - `recovery`: watchdog expiry, flush, forced stop, overflow
//! - `lifecycle`: open/close, process and sensor start/stop, reconfiguration

mod completion;
mod dispatch;
mod lifecycle;
mod recovery;

pub use completion::{DoneEvent, DoneOutcome, DoneSignal, StartOutcome};
pub use dispatch::{is_late, LockOutcome};

use crate::chain::{ChainTable, StageChain};
use crate::error::{Result, SchedError};
use crate::notifier::{DeviceHooks, DoneMessage, DoneNotifier, NoopHooks};
use crate::registry::HardwareRegistry;
use crate::types::{Instance, SchedulerConfig};
use crossbeam::channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

#[derive(Default)]
struct SchedulerStats {
    admitted: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    internal_shots: AtomicU64,
    late_shots: AtomicU64,
    duplicate_starts: AtomicU64,
    protocol_violations: AtomicU64,
    retired: AtomicU64,
    timeouts: AtomicU64,
    false_alarms: AtomicU64,
    register_dumps: AtomicU64,
    flushed: AtomicU64,
    hook_failures: AtomicU64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatistics {
    pub admitted: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub internal_shots: u64,
    pub late_shots: u64,
    pub duplicate_starts: u64,
    pub protocol_violations: u64,
    pub retired: u64,
    pub timeouts: u64,
    pub false_alarms: u64,
    pub register_dumps: u64,
    pub flushed: u64,
    pub hook_failures: u64,
    pub notifications: u64,
    pub notifications_dropped: u64,
}

/// Shot / completion scheduler
pub struct Scheduler {
    registry: Arc<HardwareRegistry>,
    table: ChainTable,
    config: SchedulerConfig,
    chains: RwLock<HashMap<Instance, Arc<StageChain>>>,
    notifier: DoneNotifier,
    hooks: Arc<dyn DeviceHooks>,
    runtime: Handle,
    mshot_tx: mpsc::UnboundedSender<Instance>,
    lifecycle: Mutex<()>,
    stats: SchedulerStats,
    this: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler on the current tokio runtime with no device hooks
    pub fn new(
        registry: Arc<HardwareRegistry>,
        table: ChainTable,
        config: SchedulerConfig,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| SchedError::NoRuntime)?;
        Ok(Self::with_hooks(registry, table, config, Arc::new(NoopHooks), runtime))
    }

    pub fn with_hooks(
        registry: Arc<HardwareRegistry>,
        table: ChainTable,
        config: SchedulerConfig,
        hooks: Arc<dyn DeviceHooks>,
        runtime: Handle,
    ) -> Arc<Self> {
        log::info!(
            "Initializing scheduler: {} routes, queue depth {}, fast readout {}",
            table.len(),
            config.queue_depth,
            config.fast_readout
        );

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let (mshot_tx, mshot_rx) = mpsc::unbounded_channel();
            runtime.spawn(run_mshot_worker(weak.clone(), mshot_rx));

            Self {
                notifier: DoneNotifier::new(config.notifier_capacity),
                registry,
                table,
                config,
                chains: RwLock::new(HashMap::new()),
                hooks,
                runtime,
                mshot_tx,
                lifecycle: Mutex::new(()),
                stats: SchedulerStats::default(),
                this: weak.clone(),
            }
        })
    }

    pub fn registry(&self) -> &Arc<HardwareRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &ChainTable {
        &self.table
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn notifier(&self) -> &DoneNotifier {
        &self.notifier
    }

    /// Receiving end of the done work queue
    pub fn subscribe(&self) -> Receiver<DoneMessage> {
        self.notifier.subscribe()
    }

    pub fn chain(&self, instance: Instance) -> Result<Arc<StageChain>> {
        self.chains
            .read()
            .get(&instance)
            .cloned()
            .ok_or(SchedError::NoChain(instance))
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let s = &self.stats;
        SchedulerStatistics {
            admitted: s.admitted.load(Ordering::Relaxed),
            dispatched: s.dispatched.load(Ordering::Relaxed),
            dispatch_failures: s.dispatch_failures.load(Ordering::Relaxed),
            internal_shots: s.internal_shots.load(Ordering::Relaxed),
            late_shots: s.late_shots.load(Ordering::Relaxed),
            duplicate_starts: s.duplicate_starts.load(Ordering::Relaxed),
            protocol_violations: s.protocol_violations.load(Ordering::Relaxed),
            retired: s.retired.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            false_alarms: s.false_alarms.load(Ordering::Relaxed),
            register_dumps: s.register_dumps.load(Ordering::Relaxed),
            flushed: s.flushed.load(Ordering::Relaxed),
            hook_failures: s.hook_failures.load(Ordering::Relaxed),
            notifications: self.notifier.posted(),
            notifications_dropped: self.notifier.dropped(),
        }
    }

    /// (Re)arm the chain leader's shot timer
    fn arm_watchdog(&self, chain: &StageChain) {
        let weak = self.this.clone();
        let instance = chain.instance();
        chain
            .leader()
            .watchdog()
            .arm(&self.runtime, chain.config().shot_timeout(), move || {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.on_watchdog_expired(instance);
                }
            });
    }

    fn schedule_mshot(&self, instance: Instance) {
        if self.mshot_tx.send(instance).is_err() {
            log::error!("[{}] multi-shot worker is gone", instance);
        }
    }

    fn post(&self, message: DoneMessage) {
        if let Err(e) = self.notifier.post(message) {
            log::error!("[{}][{}][F:{}] done notify failed: {}", message.instance, message.chain, message.fcount, e);
        }
    }

    /// Log every opened stage's event counters
    fn log_frame_counts(&self) {
        for row in self.registry.frame_counts() {
            log::info!(
                "[{}] fs({}) cl({}) fe({}) dma({}) target F:{}",
                row.name,
                row.counts.fs,
                row.counts.cl,
                row.counts.fe,
                row.counts.dma,
                row.target_fcount
            );
        }
    }
}

/// Re-issues the next queued replica after a multi-buffer shot retires
async fn run_mshot_worker(scheduler: Weak<Scheduler>, mut rx: mpsc::UnboundedReceiver<Instance>) {
    while let Some(instance) = rx.recv().await {
        let Some(strong) = scheduler.upgrade() else {
            break;
        };
        if let Err(e) = strong.mshot(instance) {
            log::error!("[{}] multi-shot dispatch failed: {}", instance, e);
        }
    }
    log::debug!("multi-shot worker stopped");
}
