//! ISChain - Core data types
//!
//! Identifiers, id sets, frame/stage state enums and the deployment
//! configuration shared by every component of the scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

/// Hardware stage identifier (slot in the registry arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub u8);

/// Logical output identifier (one DMA destination or the chain leader)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputId(pub u8);

/// Logical stream instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instance(pub u32);

/// Route identifier from the static chain table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HW{}", self.0)
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Largest id an [`IdSet`] can hold
pub const MAX_SET_INDEX: u8 = 63;

/// Ids that can be members of an [`IdSet`]
pub trait SetIndex: Copy {
    fn index(self) -> u8;
    fn from_index(index: u8) -> Self;
}

impl SetIndex for StageId {
    fn index(self) -> u8 {
        self.0
    }
    fn from_index(index: u8) -> Self {
        StageId(index)
    }
}

impl SetIndex for OutputId {
    fn index(self) -> u8 {
        self.0
    }
    fn from_index(index: u8) -> Self {
        OutputId(index)
    }
}

/// Fixed-width set of ids backed by a single word
pub struct IdSet<T> {
    bits: u64,
    _marker: PhantomData<T>,
}

/// Set of hardware stages (core-done tracking, activation maps)
pub type StageSet = IdSet<StageId>;

/// Set of logical outputs (output-done tracking)
pub type OutputSet = IdSet<OutputId>;

impl<T: SetIndex> IdSet<T> {
    pub const fn empty() -> Self {
        Self { bits: 0, _marker: PhantomData }
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self { bits, _marker: PhantomData }
    }

    pub fn single(id: T) -> Self {
        let mut set = Self::empty();
        set.insert(id);
        set
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    fn mask(id: T) -> u64 {
        1u64.checked_shl(u32::from(id.index())).unwrap_or(0)
    }

    pub fn insert(&mut self, id: T) {
        self.bits |= Self::mask(id);
    }

    /// Remove `id`, returning whether it was present
    pub fn remove(&mut self, id: T) -> bool {
        let present = self.contains(id);
        self.bits &= !Self::mask(id);
        present
    }

    pub fn contains(&self, id: T) -> bool {
        let mask = Self::mask(id);
        mask != 0 && self.bits & mask != 0
    }

    pub fn union(&self, other: &Self) -> Self {
        Self::from_bits(self.bits | other.bits)
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self::from_bits(self.bits & !other.bits)
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self::from_bits(self.bits & other.bits)
    }

    /// Set without `id`
    pub fn without(&self, id: T) -> Self {
        Self::from_bits(self.bits & !Self::mask(id))
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Members in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..=MAX_SET_INDEX)
            .filter(move |i| self.bits & (1u64 << i) != 0)
            .map(T::from_index)
    }
}

impl<T> Clone for IdSet<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for IdSet<T> {}

impl<T> PartialEq for IdSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for IdSet<T> {}

impl<T> Default for IdSet<T> {
    fn default() -> Self {
        Self { bits: 0, _marker: PhantomData }
    }
}

impl<T> fmt::Debug for IdSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits)
    }
}

impl<T: SetIndex> FromIterator<T> for IdSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::empty();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// Life-cycle bucket a frame record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameState {
    Free = 0,
    Requested = 1,
    Configured = 2,
    WaitCompletion = 3,
}

impl FrameState {
    pub const ALL: [FrameState; 4] = [
        FrameState::Free,
        FrameState::Requested,
        FrameState::Configured,
        FrameState::WaitCompletion,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameState::Free => "FREE",
            FrameState::Requested => "REQUEST",
            FrameState::Configured => "CONFIGURE",
            FrameState::WaitCompletion => "WAIT_DONE",
        };
        f.write_str(name)
    }
}

/// Origin of a frame record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShotType {
    /// Submitted by the upstream caller
    External,
    /// Synthesized to keep a trigger-driven chain busy
    Internal,
    /// Caller request that fell behind the trigger
    Late,
    /// One replica of a multi-buffer submission
    Multi,
}

/// Completion status reported downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DoneReason {
    Success,
    Late,
    Unprocessed,
    Overflow,
    InvalidFrameNumber,
    Timeout,
}

impl DoneReason {
    pub fn is_success(self) -> bool {
        self == DoneReason::Success
    }
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DoneReason::Success => "SUCCESS",
            DoneReason::Late => "LATE",
            DoneReason::Unprocessed => "UNPROCESSED",
            DoneReason::Overflow => "OVERFLOW",
            DoneReason::InvalidFrameNumber => "INVALID_FCOUNT",
            DoneReason::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Hardware stage lifecycle/status bits
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StageFlags(u32);

impl StageFlags {
    pub const OPENED: StageFlags = StageFlags(1 << 0);
    pub const INITIALIZED: StageFlags = StageFlags(1 << 1);
    /// Armed by a shot, cleared at frame start
    pub const CONFIGURED: StageFlags = StageFlags(1 << 2);
    pub const RUNNING: StageFlags = StageFlags(1 << 3);
    pub const TUNED: StageFlags = StageFlags(1 << 4);

    pub const fn empty() -> Self {
        StageFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        StageFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: StageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StageFlags {
    type Output = StageFlags;
    fn bitor(self, rhs: StageFlags) -> StageFlags {
        StageFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for StageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (StageFlags::OPENED, "OPENED"),
            (StageFlags::INITIALIZED, "INITIALIZED"),
            (StageFlags::CONFIGURED, "CONFIGURED"),
            (StageFlags::RUNNING, "RUNNING"),
            (StageFlags::TUNED, "TUNED"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join("|"))
    }
}

/// How a chain's head stage is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free-running upstream trigger (sensor OTF); admission via config lock
    FreeRunning,
    /// Explicit per-frame command (memory-to-memory)
    OnDemand,
}

/// Per-chain deployment settings
///
/// No `Default`: every chain states its own timeout and run-ahead window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub trigger: TriggerMode,
    pub shot_timeout_ms: u64,
    /// Frames a caller request may trail the trigger before it is late
    pub run_ahead: u32,
}

impl ChainConfig {
    pub fn shot_timeout(&self) -> Duration {
        Duration::from_millis(self.shot_timeout_ms)
    }
}

/// Scheduler-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frame records per frame queue
    pub queue_depth: usize,

    /// Native multi-buffer batching present
    pub fast_readout: bool,

    /// Consecutive bug events tolerated before aborting
    pub bug_threshold: Option<u32>,

    /// FREE level below which internal synthesis counts a bug
    pub low_free_warning: usize,

    /// FREE level above which the bug counter is cleared
    pub free_reset_level: usize,

    /// Frame starts tolerated with duplicated CONFIGURED records
    pub configured_flush_limit: u32,

    /// Per-bucket retry budget of a forced drain
    pub flush_retry_budget: u32,

    pub stop_wait_retries: u32,
    pub stop_wait_interval_ms: u64,

    pub sensor_stop_retries: u32,
    pub sensor_stop_interval_ms: u64,

    /// Bounded wait for frame-valid to clear on disable
    pub stage_stop_timeout_ms: u64,

    /// Downstream notifier depth
    pub notifier_capacity: usize,

    pub internal_log_burst: u32,
    pub internal_log_every: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 20,
            fast_readout: false,
            bug_threshold: Some(10),
            low_free_warning: 3,
            free_reset_level: 10,
            configured_flush_limit: 5,
            flush_retry_budget: 150,
            stop_wait_retries: 10,
            stop_wait_interval_ms: 5,
            sensor_stop_retries: 99,
            sensor_stop_interval_ms: 1,
            stage_stop_timeout_ms: 250,
            notifier_capacity: 64,
            internal_log_burst: 20,
            internal_log_every: 100,
        }
    }
}

impl SchedulerConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }

    pub fn stage_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_stop_timeout_ms)
    }

    /// Whether the n-th consecutive internal shot should be logged
    pub fn log_internal(&self, count: u32) -> bool {
        count <= self.internal_log_burst
            || (self.internal_log_every != 0 && count % self.internal_log_every == 0)
    }
}
