//! Frame records - one unit of work travelling through a stage chain
//!
//! Records live in a fixed pool owned by a [`FrameQueue`](crate::frame_queue::FrameQueue)
//! and are only ever touched while the queue lock is held. Everything that
//! leaves the critical section does so as a [`FrameView`] snapshot.

use crate::types::{DoneReason, Instance, OutputId, OutputSet, ShotType, StageSet};

/// Planes carried per record
pub const MAX_PLANES: usize = 8;

/// One plane of a buffer (device and kernel-visible address)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneBuffer {
    pub dva: u64,
    pub kva: u64,
}

/// Logical frame submitted by the upstream caller
///
/// The scheduler copies what it needs out of the template; the caller keeps
/// ownership of the buffers it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTemplate {
    pub fcount: u64,
    pub rcount: u32,
    /// Outputs requested for this frame, leader included
    pub out_flag: OutputSet,
    pub planes: Vec<PlaneBuffer>,
    /// Buffers in a burst capture
    pub num_buffers: u32,
}

impl FrameTemplate {
    pub fn new(fcount: u64, out_flag: OutputSet) -> Self {
        Self {
            fcount,
            rcount: 0,
            out_flag,
            planes: Vec::new(),
            num_buffers: 1,
        }
    }

    pub fn with_planes(mut self, planes: Vec<PlaneBuffer>) -> Self {
        self.planes = planes;
        self
    }

    pub fn with_buffers(mut self, num_buffers: u32) -> Self {
        self.num_buffers = num_buffers.max(1);
        self
    }

    pub fn with_rcount(mut self, rcount: u32) -> Self {
        self.rcount = rcount;
        self
    }
}

/// Stable reference to a record for one dispatch cycle
///
/// `seq` changes every time the record leaves FREE, so a handle kept past
/// retirement is detected instead of aliasing the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pub slot: usize,
    pub seq: u64,
}

/// Read-only snapshot of a frame record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameView {
    pub handle: FrameHandle,
    pub fcount: u64,
    pub instance: Instance,
    pub rcount: u32,
    pub shot_type: ShotType,
    pub num_buffers: u32,
    pub cur_buf_index: u32,
    pub batch_last: bool,
    pub out_flag: OutputSet,
    pub bak_flag: OutputSet,
    pub core_flag: StageSet,
    pub planes: [PlaneBuffer; MAX_PLANES],
    pub plane_count: usize,
    pub reason: DoneReason,
}

impl FrameView {
    pub fn planes(&self) -> &[PlaneBuffer] {
        &self.planes[..self.plane_count]
    }
}

/// Pool-resident frame record
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub(crate) slot: usize,
    pub(crate) seq: u64,
    pub fcount: u64,
    pub instance: Instance,
    pub rcount: u32,
    pub shot_type: ShotType,
    pub num_buffers: u32,
    pub cur_buf_index: u32,
    /// Last replica of a multi-buffer submission
    pub batch_last: bool,
    /// Outputs still pending
    pub out_flag: OutputSet,
    /// Outputs requested at admission
    pub bak_flag: OutputSet,
    /// Stages whose core-done is still pending
    pub core_flag: StageSet,
    planes: [PlaneBuffer; MAX_PLANES],
    plane_count: usize,
    /// Reference toward shot-done; saturates at zero
    done_ref: u32,
    pub reason: DoneReason,
}

impl FrameRecord {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            seq: 0,
            fcount: 0,
            instance: Instance(0),
            rcount: 0,
            shot_type: ShotType::Internal,
            num_buffers: 1,
            cur_buf_index: 0,
            batch_last: true,
            out_flag: OutputSet::empty(),
            bak_flag: OutputSet::empty(),
            core_flag: StageSet::empty(),
            planes: [PlaneBuffer::default(); MAX_PLANES],
            plane_count: 0,
            done_ref: 0,
            reason: DoneReason::Success,
        }
    }

    pub fn handle(&self) -> FrameHandle {
        FrameHandle { slot: self.slot, seq: self.seq }
    }

    /// Copy routing and buffer metadata from a caller frame
    pub fn fill_from(&mut self, instance: Instance, template: &FrameTemplate) {
        self.fcount = template.fcount;
        self.instance = instance;
        self.rcount = template.rcount;
        self.shot_type = ShotType::External;
        self.num_buffers = template.num_buffers;
        self.cur_buf_index = 0;
        self.batch_last = true;
        self.out_flag = template.out_flag;
        self.bak_flag = template.out_flag;
        self.core_flag = StageSet::empty();
        self.plane_count = template.planes.len().min(MAX_PLANES);
        self.planes = [PlaneBuffer::default(); MAX_PLANES];
        self.planes[..self.plane_count].copy_from_slice(&template.planes[..self.plane_count]);
        self.done_ref = 1;
        self.reason = DoneReason::Success;
    }

    /// Turn the record into one replica of a multi-buffer batch
    pub fn make_replica(&mut self, index: u32, last: bool) {
        self.shot_type = ShotType::Multi;
        self.num_buffers = 1;
        self.cur_buf_index = index;
        self.batch_last = last;
        let plane = self.planes.get(index as usize).copied().unwrap_or_default();
        self.planes = [PlaneBuffer::default(); MAX_PLANES];
        self.planes[0] = plane;
        self.plane_count = 1;
    }

    /// Reset as a synthetic record with no outputs
    pub fn fill_internal(&mut self, instance: Instance, fcount: u64, num_buffers: u32, buf_index: u32) {
        self.fcount = fcount;
        self.instance = instance;
        self.rcount = 0;
        self.shot_type = ShotType::Internal;
        self.num_buffers = num_buffers;
        self.cur_buf_index = buf_index;
        self.batch_last = true;
        self.out_flag = OutputSet::empty();
        self.bak_flag = OutputSet::empty();
        self.core_flag = StageSet::empty();
        self.planes = [PlaneBuffer::default(); MAX_PLANES];
        self.plane_count = 0;
        self.done_ref = 1;
        self.reason = DoneReason::Success;
    }

    /// Nothing but the leader output is outstanding and no stage owes a core-done
    pub fn is_ready_for_shot_done(&self, leader: OutputId) -> bool {
        self.out_flag.without(leader).is_empty() && self.core_flag.is_empty()
    }

    /// Drop the shot-done reference; true only for the call that reaches zero
    pub fn release_done_ref(&mut self) -> bool {
        match self.done_ref {
            0 => false,
            1 => {
                self.done_ref = 0;
                true
            }
            n => {
                self.done_ref = n - 1;
                false
            }
        }
    }

    pub fn done_ref(&self) -> u32 {
        self.done_ref
    }

    /// Whether retirement posts a work item downstream
    pub fn reports_done(&self) -> bool {
        match self.shot_type {
            ShotType::External | ShotType::Late => true,
            ShotType::Multi => self.batch_last,
            ShotType::Internal => false,
        }
    }

    pub fn view(&self) -> FrameView {
        FrameView {
            handle: self.handle(),
            fcount: self.fcount,
            instance: self.instance,
            rcount: self.rcount,
            shot_type: self.shot_type,
            num_buffers: self.num_buffers,
            cur_buf_index: self.cur_buf_index,
            batch_last: self.batch_last,
            out_flag: self.out_flag,
            bak_flag: self.bak_flag,
            core_flag: self.core_flag,
            planes: self.planes,
            plane_count: self.plane_count,
            reason: self.reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StageId;

    fn outputs(ids: &[u8]) -> OutputSet {
        ids.iter().map(|i| OutputId(*i)).collect()
    }

    #[test]
    fn test_fill_from_snapshots_outputs() {
        let mut record = FrameRecord::new(0);
        let template = FrameTemplate::new(7, outputs(&[0, 2, 3]))
            .with_planes(vec![PlaneBuffer { dva: 0x1000, kva: 0 }]);
        record.fill_from(Instance(1), &template);

        assert_eq!(record.fcount, 7);
        assert_eq!(record.bak_flag, record.out_flag);
        assert_eq!(record.view().planes().len(), 1);
        assert_eq!(record.done_ref(), 1);
        assert!(record.reports_done());
    }

    #[test]
    fn test_ready_predicate_ignores_leader() {
        let mut record = FrameRecord::new(0);
        record.fill_from(Instance(0), &FrameTemplate::new(1, outputs(&[0, 4])));
        let leader = OutputId(0);

        assert!(!record.is_ready_for_shot_done(leader));
        record.out_flag.remove(OutputId(4));
        assert!(record.is_ready_for_shot_done(leader));

        record.core_flag.insert(StageId(2));
        assert!(!record.is_ready_for_shot_done(leader));
    }

    #[test]
    fn test_done_ref_saturates() {
        let mut record = FrameRecord::new(0);
        record.fill_internal(Instance(0), 3, 1, 0);
        assert!(record.release_done_ref());
        assert!(!record.release_done_ref());
        assert!(!record.release_done_ref());
        assert_eq!(record.done_ref(), 0);
    }

    #[test]
    fn test_replica_takes_its_plane() {
        let mut record = FrameRecord::new(0);
        let planes = (0..4).map(|i| PlaneBuffer { dva: 0x100 * i, kva: 0 }).collect();
        record.fill_from(
            Instance(0),
            &FrameTemplate::new(5, outputs(&[0])).with_planes(planes).with_buffers(4),
        );
        record.make_replica(2, false);

        assert_eq!(record.shot_type, ShotType::Multi);
        assert_eq!(record.view().planes()[0].dva, 0x200);
        assert!(!record.reports_done());
    }
}
