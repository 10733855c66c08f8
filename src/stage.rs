//! Hardware Stage - handle to one physical processing block
//!
//! A stage owns its event counters, lifecycle bits, a small debug trace of
//! recent dispatch cycles, its shot watchdog and the driver operation table.
//! The scheduler never calls a driver directly; every call goes through the
//! guarded wrappers here so the OPENED / INITIALIZED rules hold everywhere.

use crate::error::{Result, SchedError, StageError};
use crate::frame::FrameView;
use crate::types::{DoneReason, Instance, OutputSet, StageFlags, StageId, StageSet};
use crate::watchdog::Watchdog;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Dispatch cycles kept in the debug trace
pub const DEBUG_FRAME_COUNT: usize = 3;

/// Scenario ids at or above this are rejected by apply-setfile
pub const MAX_SCENARIO: u32 = 128;

const NO_SCENARIO: u32 = u32::MAX;

/// Result of a successful shot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShotAck {
    /// The stage will raise a core-done signal for this record
    pub core_done: bool,
}

/// Opaque parameter block handed to `set_param`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamRegion {
    pub words: Vec<u32>,
}

/// Register snapshot taken for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDump {
    pub stage: StageId,
    pub name: String,
    pub registers: Vec<(u32, u32)>,
}

/// Driver operation table of one block type
///
/// Each call is synchronous; completion comes back through the scheduler's
/// frame-start / frame-done entry points.
pub trait StageOps: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn init(
        &self,
        _instance: Instance,
        _replicated: bool,
        _module_id: u32,
    ) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn deinit(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn close(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn enable(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn disable(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    /// Program the block for one record
    fn shot(&self, frame: &FrameView, active: StageSet) -> std::result::Result<ShotAck, StageError>;

    fn set_param(
        &self,
        _region: &ParamRegion,
        _lindex: u64,
        _hindex: u64,
        _instance: Instance,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn get_meta(&self, _frame: &FrameView, _active: StageSet) -> std::result::Result<(), StageError> {
        Ok(())
    }

    /// Told that `frame` is being completed without hardware completion
    fn frame_ndone(
        &self,
        _frame: &FrameView,
        _instance: Instance,
        _reason: DoneReason,
    ) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn load_setfile(
        &self,
        _instance: Instance,
        _scenario: u32,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn apply_setfile(
        &self,
        _instance: Instance,
        _scenario: u32,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn delete_setfile(
        &self,
        _instance: Instance,
        _scenario: u32,
        _active: StageSet,
    ) -> std::result::Result<(), StageError> {
        Ok(())
    }

    /// Reset and recover the block
    fn restore(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn notify_timeout(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn change_chain(&self, _instance: Instance, _next: StageId) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn sensor_start(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn sensor_stop(&self, _instance: Instance) -> std::result::Result<(), StageError> {
        Ok(())
    }

    fn dump_registers(&self) -> Vec<(u32, u32)> {
        Vec::new()
    }
}

/// Hardware event a counter tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    FrameStart,
    ConfigLock,
    FrameEnd,
    DmaEnd,
}

/// Snapshot of the four event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub fs: u64,
    pub cl: u64,
    pub fe: u64,
    pub dma: u64,
}

/// Monotonic per-stage event counters
#[derive(Debug, Default)]
pub struct EventCounters {
    fs: AtomicU64,
    cl: AtomicU64,
    fe: AtomicU64,
    dma: AtomicU64,
}

impl EventCounters {
    fn cell(&self, event: StageEvent) -> &AtomicU64 {
        match event {
            StageEvent::FrameStart => &self.fs,
            StageEvent::ConfigLock => &self.cl,
            StageEvent::FrameEnd => &self.fe,
            StageEvent::DmaEnd => &self.dma,
        }
    }

    /// Increment and return the new value
    pub fn bump(&self, event: StageEvent) -> u64 {
        self.cell(event).fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn get(&self, event: StageEvent) -> u64 {
        self.cell(event).load(Ordering::Acquire)
    }

    pub fn set(&self, event: StageEvent, value: u64) {
        self.cell(event).store(value, Ordering::Release);
    }

    pub fn set_all(&self, value: u64) {
        for event in [
            StageEvent::FrameStart,
            StageEvent::ConfigLock,
            StageEvent::FrameEnd,
            StageEvent::DmaEnd,
        ] {
            self.set(event, value);
        }
    }

    pub fn snapshot(&self) -> FrameCounts {
        FrameCounts {
            fs: self.get(StageEvent::FrameStart),
            cl: self.get(StageEvent::ConfigLock),
            fe: self.get(StageEvent::FrameEnd),
            dma: self.get(StageEvent::DmaEnd),
        }
    }
}

/// Point in a dispatch cycle recorded by the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    Shot,
    FrameStart,
    FrameEnd,
    DmaEnd,
}

/// Timestamps of one dispatch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceEntry {
    pub fcount: u64,
    pub instance: Instance,
    pub shot: Option<Instant>,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
    pub dma_end: Option<Instant>,
}

impl TraceEntry {
    /// The cycle was dispatched or started and never finished
    pub fn is_stalled(&self) -> bool {
        let end = self.end.max(self.dma_end);
        // `None` orders before every timestamp
        self.start > end || self.shot > self.start
    }
}

/// Ring of the last [`DEBUG_FRAME_COUNT`] dispatch cycles, slotted by frame number
#[derive(Debug, Default)]
pub struct DebugTrace {
    entries: [TraceEntry; DEBUG_FRAME_COUNT],
}

impl DebugTrace {
    pub fn record(&mut self, point: TracePoint, instance: Instance, fcount: u64, now: Instant) {
        let entry = &mut self.entries[(fcount % DEBUG_FRAME_COUNT as u64) as usize];
        if point == TracePoint::Shot {
            *entry = TraceEntry {
                fcount,
                instance,
                shot: Some(now),
                ..TraceEntry::default()
            };
            return;
        }
        // the slot was taken over by a newer cycle
        if entry.fcount != fcount || entry.shot.is_none() {
            return;
        }
        match point {
            TracePoint::FrameStart => entry.start = Some(now),
            TracePoint::FrameEnd => entry.end = Some(now),
            TracePoint::DmaEnd => entry.dma_end = Some(now),
            TracePoint::Shot => {}
        }
    }

    pub fn entries(&self) -> &[TraceEntry; DEBUG_FRAME_COUNT] {
        &self.entries
    }

    pub fn stalled(&self) -> Option<TraceEntry> {
        self.entries.iter().copied().find(TraceEntry::is_stalled)
    }

    pub fn clear(&mut self) {
        *self = DebugTrace::default();
    }
}

/// One physical block registered with the system
pub struct HardwareStage {
    id: StageId,
    outputs: OutputSet,
    ops: Box<dyn StageOps>,
    flags: AtomicU32,
    init_mask: AtomicU64,
    open_count: AtomicU32,
    counters: EventCounters,
    fcount: AtomicU64,
    instance: AtomicU32,
    trace: Mutex<DebugTrace>,
    frame_valid: Mutex<bool>,
    frame_valid_cv: Condvar,
    watchdog: Watchdog,
    scenario: AtomicU32,
}

impl HardwareStage {
    pub fn new(id: StageId, outputs: OutputSet, ops: Box<dyn StageOps>) -> Self {
        Self {
            id,
            outputs,
            ops,
            flags: AtomicU32::new(0),
            init_mask: AtomicU64::new(0),
            open_count: AtomicU32::new(0),
            counters: EventCounters::default(),
            fcount: AtomicU64::new(0),
            instance: AtomicU32::new(0),
            trace: Mutex::new(DebugTrace::default()),
            frame_valid: Mutex::new(false),
            frame_valid_cv: Condvar::new(),
            watchdog: Watchdog::new(),
            scenario: AtomicU32::new(NO_SCENARIO),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.ops.name()
    }

    /// Outputs this block writes
    pub fn outputs(&self) -> OutputSet {
        self.outputs
    }

    pub fn counters(&self) -> &EventCounters {
        &self.counters
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn flags(&self) -> StageFlags {
        StageFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn has(&self, flag: StageFlags) -> bool {
        self.flags().contains(flag)
    }

    fn set_flag(&self, flag: StageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: StageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    fn instance_bit(instance: Instance) -> u64 {
        1u64.checked_shl(instance.0).unwrap_or(0)
    }

    pub fn is_initialized(&self, instance: Instance) -> bool {
        self.has(StageFlags::INITIALIZED)
            && self.init_mask.load(Ordering::Acquire) & Self::instance_bit(instance) != 0
    }

    /// Frame number of the last shot
    pub fn target_fcount(&self) -> u64 {
        self.fcount.load(Ordering::Acquire)
    }

    pub fn target_instance(&self) -> Instance {
        Instance(self.instance.load(Ordering::Acquire))
    }

    pub fn applied_scenario(&self) -> Option<u32> {
        match self.scenario.load(Ordering::Acquire) {
            NO_SCENARIO => None,
            s => Some(s),
        }
    }

    pub fn trace(&self, point: TracePoint, instance: Instance, fcount: u64) {
        self.trace.lock().record(point, instance, fcount, Instant::now());
    }

    pub fn trace_entries(&self) -> [TraceEntry; DEBUG_FRAME_COUNT] {
        *self.trace.lock().entries()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().clear();
    }

    /// First trace entry that shows a stalled cycle
    pub fn stalled_cycle(&self) -> Option<TraceEntry> {
        self.trace.lock().stalled()
    }

    pub fn frame_valid(&self) -> bool {
        *self.frame_valid.lock()
    }

    pub fn set_frame_valid(&self, valid: bool) {
        let mut guard = self.frame_valid.lock();
        *guard = valid;
        if !valid {
            self.frame_valid_cv.notify_all();
        }
    }

    /// Wait for frame-valid to clear; false when `timeout` expired first
    pub fn wait_frame_blank(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.frame_valid.lock();
        while *guard {
            if self.frame_valid_cv.wait_until(&mut guard, deadline).timed_out() {
                return !*guard;
            }
        }
        true
    }

    fn ensure_opened(&self) -> Result<()> {
        if self.has(StageFlags::OPENED) {
            Ok(())
        } else {
            Err(SchedError::NotOpened(self.id))
        }
    }

    fn ensure_initialized(&self, instance: Instance) -> Result<()> {
        self.ensure_opened()?;
        if self.is_initialized(instance) {
            Ok(())
        } else {
            Err(SchedError::NotInitialized { stage: self.id, instance })
        }
    }

    fn wrap<T>(&self, r: std::result::Result<T, StageError>) -> Result<T> {
        r.map_err(|e| SchedError::stage(self.id, e))
    }

    /// Take a reference; the first one opens the block. Returns true for the first.
    pub fn open(&self, instance: Instance) -> Result<bool> {
        let previous = self.open_count.fetch_add(1, Ordering::AcqRel);
        if previous > 0 {
            return Ok(false);
        }

        if let Err(e) = self.ops.open(instance) {
            self.open_count.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedError::stage(self.id, e));
        }
        self.counters.set_all(0);
        self.trace.lock().clear();
        self.fcount.store(0, Ordering::Release);
        self.scenario.store(NO_SCENARIO, Ordering::Release);
        self.init_mask.store(0, Ordering::Release);
        self.flags.store(StageFlags::OPENED.bits(), Ordering::Release);
        self.set_frame_valid(false);
        Ok(true)
    }

    pub fn init(&self, instance: Instance, replicated: bool, module_id: u32) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.init(instance, replicated, module_id))?;
        self.init_mask.fetch_or(Self::instance_bit(instance), Ordering::AcqRel);
        self.set_flag(StageFlags::INITIALIZED);
        Ok(())
    }

    /// Undo `open` after a failed `init`
    pub(crate) fn release_open(&self) {
        if self.open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.flags.store(0, Ordering::Release);
        }
    }

    /// Drop a reference; the last one closes the block. Returns true for the last.
    pub fn close(&self, instance: Instance) -> Result<bool> {
        self.ensure_opened()?;
        if let Err(e) = self.ops.deinit(instance) {
            log::warn!("[{}][{}] deinit failed: {}", instance, self.name(), e);
        }
        let remaining = self.init_mask.fetch_and(!Self::instance_bit(instance), Ordering::AcqRel)
            & !Self::instance_bit(instance);
        if remaining == 0 {
            self.clear_flag(StageFlags::INITIALIZED);
        }

        if self.open_count.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(false);
        }

        let result = self.ops.close(instance);
        self.flags.store(0, Ordering::Release);
        self.init_mask.store(0, Ordering::Release);
        self.set_frame_valid(false);
        self.wrap(result).map(|_| true)
    }

    pub fn enable(&self, instance: Instance) -> Result<()> {
        self.ensure_initialized(instance)?;
        self.wrap(self.ops.enable(instance))?;
        self.set_flag(StageFlags::RUNNING);
        Ok(())
    }

    /// Wait (bounded) for the block to go idle, then disable it
    ///
    /// Returns false when the wait expired with a frame still valid.
    pub fn disable(&self, instance: Instance, timeout: Duration) -> Result<bool> {
        self.ensure_opened()?;
        let idle = self.wait_frame_blank(timeout);
        if !idle {
            log::warn!(
                "[{}][{}] frame end not seen within {:?}, forcing disable",
                instance,
                self.name(),
                timeout
            );
        }
        self.wrap(self.ops.disable(instance))?;
        self.clear_flag(StageFlags::RUNNING);
        self.clear_flag(StageFlags::CONFIGURED);
        Ok(idle)
    }

    pub fn shot(&self, frame: &FrameView, active: StageSet) -> Result<ShotAck> {
        self.ensure_initialized(frame.instance)?;
        self.fcount.store(frame.fcount, Ordering::Release);
        self.instance.store(frame.instance.0, Ordering::Release);
        self.trace(TracePoint::Shot, frame.instance, frame.fcount);

        let ack = self.wrap(self.ops.shot(frame, active))?;
        self.set_flag(StageFlags::CONFIGURED);
        Ok(ack)
    }

    /// Frame start seen: CONFIGURED cleared, frame valid raised
    pub(crate) fn mark_started(&self) {
        self.clear_flag(StageFlags::CONFIGURED);
        self.set_frame_valid(true);
    }

    pub fn set_param(
        &self,
        region: &ParamRegion,
        lindex: u64,
        hindex: u64,
        instance: Instance,
        active: StageSet,
    ) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.set_param(region, lindex, hindex, instance, active))
    }

    pub fn get_meta(&self, frame: &FrameView, active: StageSet) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.get_meta(frame, active))
    }

    pub fn frame_ndone(&self, frame: &FrameView, reason: DoneReason) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.frame_ndone(frame, frame.instance, reason))
    }

    pub fn load_setfile(&self, instance: Instance, scenario: u32, active: StageSet) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.load_setfile(instance, scenario, active))
    }

    pub fn apply_setfile(&self, instance: Instance, scenario: u32, active: StageSet) -> Result<()> {
        self.ensure_opened()?;
        if scenario >= MAX_SCENARIO {
            return Err(SchedError::InvalidScenario(scenario));
        }
        self.wrap(self.ops.apply_setfile(instance, scenario, active))?;
        self.scenario.store(scenario, Ordering::Release);
        self.set_flag(StageFlags::TUNED);
        Ok(())
    }

    pub fn delete_setfile(&self, instance: Instance, scenario: u32, active: StageSet) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.delete_setfile(instance, scenario, active))?;
        if self.applied_scenario() == Some(scenario) {
            self.scenario.store(NO_SCENARIO, Ordering::Release);
            self.clear_flag(StageFlags::TUNED);
        }
        Ok(())
    }

    pub fn restore(&self, instance: Instance) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.restore(instance))
    }

    pub fn notify_timeout(&self, instance: Instance) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.notify_timeout(instance))
    }

    pub fn change_chain(&self, instance: Instance, next: StageId) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.change_chain(instance, next))
    }

    pub fn sensor_start(&self, instance: Instance) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.sensor_start(instance))
    }

    pub fn sensor_stop(&self, instance: Instance) -> Result<()> {
        self.ensure_opened()?;
        self.wrap(self.ops.sensor_stop(instance))
    }

    pub fn dump_registers(&self) -> RegisterDump {
        RegisterDump {
            stage: self.id,
            name: self.name().to_string(),
            registers: self.ops.dump_registers(),
        }
    }
}

impl std::fmt::Debug for HardwareStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareStage")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("flags", &self.flags())
            .field("open_count", &self.open_count())
            .field("counts", &self.counters.snapshot())
            .finish()
    }
}
