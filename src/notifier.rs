//! Downstream notifier and device hooks
//!
//! Retired records are reported as [`DoneMessage`] work items over a bounded
//! crossbeam channel. Posting never blocks the completion path.

use crate::error::{Result, SchedError, StageError};
use crate::frame::FrameView;
use crate::types::{ChainId, DoneReason, Instance, OutputId};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a work item reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DoneKind {
    /// One output of the record finished
    Output(OutputId),
    /// The whole shot retired
    Shot,
}

/// Completion work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DoneMessage {
    pub kind: DoneKind,
    pub instance: Instance,
    pub chain: ChainId,
    pub fcount: u64,
    pub rcount: u32,
    pub reason: DoneReason,
}

/// Bounded work queue toward the upstream request layer
pub struct DoneNotifier {
    tx: Sender<DoneMessage>,
    rx: Receiver<DoneMessage>,
    posted: AtomicU64,
    dropped: AtomicU64,
}

impl DoneNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            posted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Receiving side; every clone competes for the same items
    pub fn subscribe(&self) -> Receiver<DoneMessage> {
        self.rx.clone()
    }

    pub fn post(&self, message: DoneMessage) -> Result<()> {
        let retry = match self.tx.try_send(message) {
            Ok(()) => None,
            Err(TrySendError::Full(m)) => Some(m),
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(SchedError::NotifierClosed);
            }
        };

        if let Some(m) = retry {
            std::thread::yield_now();
            if self.tx.try_send(m).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "[{}][{}][F:{}] done work queue full, dropping {:?}",
                    m.instance,
                    m.chain,
                    m.fcount,
                    m.kind
                );
                return Err(SchedError::NotifierFull);
            }
        }

        self.posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Callbacks into the cooperating upstream device (frame source)
pub trait DeviceHooks: Send + Sync {
    /// Per-frame finalisation after a successful dispatch
    fn shot_callback(&self, _instance: Instance, _frame: &FrameView) -> std::result::Result<(), StageError> {
        Ok(())
    }

    /// A caller request fell behind the trigger and will not be dispatched
    fn late_shot(&self, _instance: Instance, _frame: &FrameView) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl DeviceHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(fcount: u64) -> DoneMessage {
        DoneMessage {
            kind: DoneKind::Shot,
            instance: Instance(0),
            chain: ChainId(0),
            fcount,
            rcount: 0,
            reason: DoneReason::Success,
        }
    }

    #[test]
    fn test_post_and_receive() {
        let notifier = DoneNotifier::new(4);
        let rx = notifier.subscribe();
        notifier.post(message(1)).unwrap();
        notifier.post(message(2)).unwrap();

        assert_eq!(rx.try_recv().unwrap().fcount, 1);
        assert_eq!(rx.try_recv().unwrap().fcount, 2);
        assert_eq!(notifier.posted(), 2);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let notifier = DoneNotifier::new(1);
        notifier.post(message(1)).unwrap();
        assert!(matches!(notifier.post(message(2)), Err(SchedError::NotifierFull)));
        assert_eq!(notifier.dropped(), 1);
        assert_eq!(notifier.pending(), 1);
    }
}
