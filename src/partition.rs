//! One logical volume inside the managed device.
//!
//! A `VPartition`'s identity is its slot index in the partition table;
//! external handles are indices, never pointers. The partition lock guards
//! only the extent map and status and nests inside the manager's metadata
//! lock; pure I/O dispatch takes it alone and never waits on metadata
//! persistence.

use crate::device::{BlockDevice, IoCallback, IoOp};
use crate::error::{Result, VolumeError};
use crate::extent::ExtentMap;
use crate::layout::Layout;
use crate::mapper::{self, IoGroup, PhysicalSpan};
use crate::store::MetadataStore;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Active,
    /// Terminal: the whole virtual address space was freed. Never
    /// resurrected.
    Killed,
}

pub struct PartitionState {
    pub extents: ExtentMap,
    pub status: PartitionStatus,
}

pub struct VPartition {
    entry_index: u16,
    device: Arc<dyn BlockDevice>,
    layout: Layout,
    state: Mutex<PartitionState>,
    /// Queued physical operations not yet completed. Destruction of the
    /// backing object is deferred (by Arc) until this drains.
    inflight: AtomicUsize,
}

impl VPartition {
    pub(crate) fn new(entry_index: u16, device: Arc<dyn BlockDevice>, layout: Layout) -> Self {
        VPartition {
            entry_index,
            device,
            layout,
            state: Mutex::new(PartitionState {
                extents: ExtentMap::new(),
                status: PartitionStatus::Active,
            }),
            inflight: AtomicUsize::new(0),
        }
    }

    pub fn entry_index(&self) -> u16 {
        self.entry_index
    }

    pub fn status(&self) -> PartitionStatus {
        self.state.lock().status
    }

    pub fn inflight_ops(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Mapped virtual slices.
    pub fn slice_count(&self) -> u64 {
        self.state.lock().extents.mapped_slices()
    }

    /// Extents currently covering the mapping.
    pub fn extent_count(&self) -> usize {
        self.state.lock().extents.extent_count()
    }

    /// Physical slice backing `vslice`, if mapped.
    pub fn lookup(&self, vslice: u64) -> Option<u64> {
        self.state.lock().extents.lookup(vslice)
    }

    /// Lock the state for slice-table mutation. Taking the metadata store
    /// borrow makes manager-before-partition the only expressible lock
    /// order.
    pub(crate) fn lock_for_update<'a>(
        &'a self,
        _store: &mut MetadataStore,
    ) -> MutexGuard<'a, PartitionState> {
        self.state.lock()
    }

    /// Lock the state for I/O dispatch; metadata stays untouched.
    pub(crate) fn lock_io(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock()
    }

    /// Resolve a request under the partition lock, rejecting Killed
    /// partitions, and return the physical spans to issue.
    fn admit(&self, byte_offset: u64, byte_len: u64) -> Result<Vec<PhysicalSpan>> {
        let state = self.lock_io();
        if state.status == PartitionStatus::Killed {
            return Err(VolumeError::BadState(format!(
                "partition {} is destroyed",
                self.entry_index
            )));
        }
        mapper::map_request(&state.extents, &self.layout, byte_offset, byte_len)
    }

    /// Queue an asynchronous read of `byte_len` partition-relative bytes.
    ///
    /// Admission errors come back synchronously; after `Ok` the completion
    /// fires exactly once, on whatever thread the device finishes on.
    pub fn queue_read(
        self: &Arc<Self>,
        byte_offset: u64,
        byte_len: u64,
        completion: IoCallback,
    ) -> Result<()> {
        let spans = self.admit(byte_offset, byte_len)?;
        let group = IoGroup::new(
            spans.len(),
            vec![0u8; byte_len as usize],
            self.tracked(completion),
        );
        for span in spans {
            self.device.queue(
                IoOp::Read {
                    offset: span.device_offset,
                    len: span.length,
                },
                group.sub_completion(span.buffer_offset),
            );
        }
        Ok(())
    }

    /// Queue an asynchronous write of `data` at a partition-relative offset.
    pub fn queue_write(
        self: &Arc<Self>,
        byte_offset: u64,
        data: Vec<u8>,
        completion: IoCallback,
    ) -> Result<()> {
        let spans = self.admit(byte_offset, data.len() as u64)?;
        let group = IoGroup::new(spans.len(), Vec::new(), self.tracked(completion));
        for span in spans {
            let start = span.buffer_offset;
            let chunk = data[start..start + span.length as usize].to_vec();
            self.device.queue(
                IoOp::Write {
                    offset: span.device_offset,
                    data: chunk,
                },
                group.sub_completion(span.buffer_offset),
            );
        }
        Ok(())
    }

    /// Blocking read built on the queue path.
    pub fn read(self: &Arc<Self>, byte_offset: u64, byte_len: u64) -> Result<Vec<u8>> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.queue_read(
            byte_offset,
            byte_len,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.recv()
            .map_err(|_| VolumeError::BadState("device dropped the completion".to_string()))?
    }

    /// Blocking write built on the queue path.
    pub fn write(self: &Arc<Self>, byte_offset: u64, data: &[u8]) -> Result<()> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.queue_write(
            byte_offset,
            data.to_vec(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.recv()
            .map_err(|_| VolumeError::BadState("device dropped the completion".to_string()))?
            .map(|_| ())
    }

    /// Wrap a completion so the in-flight counter covers the whole group.
    fn tracked(self: &Arc<Self>, completion: IoCallback) -> IoCallback {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let partition = Arc::clone(self);
        Box::new(move |result| {
            partition.inflight.fetch_sub(1, Ordering::AcqRel);
            completion(result);
        })
    }
}
