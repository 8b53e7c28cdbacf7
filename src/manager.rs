//! Partition and slice lifecycle orchestration.
//!
//! The manager is the single owner of the metadata store and the partition
//! registry. Every allocate/free/activate sequence runs under the metadata
//! lock, takes the affected partition's lock nested inside it, mutates both
//! views, and persists once; any failure along the way unwinds the whole
//! in-memory mutation so callers never observe a partial application and
//! the on-disk and in-memory views never diverge past one call.

use crate::device::BlockDevice;
use crate::error::{Result, VolumeError};
use crate::guid::Guid;
use crate::layout::{validate_name, PartitionEntry, MAX_PARTITIONS};
use crate::partition::{PartitionState, PartitionStatus, VPartition};
use crate::store::MetadataStore;
use crossbeam::channel::{bounded, Receiver};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::info;

/// Snapshot of volume-wide accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub slice_size: u64,
    /// Total physical slices on the device.
    pub pslice_count: u64,
    /// Physical slices currently owned by partitions.
    pub allocated_slices: u64,
    /// Virtual slices addressable per partition.
    pub max_vslice_count: u64,
}

/// One response entry from [`VolumeManager::query_slice_ranges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    /// Whether the queried vslice is mapped.
    pub allocated: bool,
    /// Consecutive vslices from the queried one sharing that state.
    pub count: u64,
}

/// Completion handle for a background load.
pub struct LoadHandle {
    rx: Receiver<Result<Arc<VolumeManager>>>,
}

impl LoadHandle {
    /// Block until the load finishes; this is the "ready" signal other
    /// callers wait on before touching the manager.
    pub fn wait(self) -> Result<Arc<VolumeManager>> {
        self.rx
            .recv()
            .map_err(|_| VolumeError::BadState("load worker died".to_string()))?
    }
}

pub struct VolumeManager {
    device: Arc<dyn BlockDevice>,
    metadata: Mutex<MetadataStore>,
    /// Slot table indexed by partition entry index. External handles are
    /// indices into this table; the Arc keeps a destroyed partition's
    /// object alive until its in-flight I/O drains.
    partitions: RwLock<Vec<Option<Arc<VPartition>>>>,
}

impl VolumeManager {
    /// Load the metadata and rebuild every live partition's extent map from
    /// the allocation table.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Arc<VolumeManager>> {
        let store = MetadataStore::load(device.clone())?;
        let layout = store.layout().clone();

        let mut slots: Vec<Option<Arc<VPartition>>> = vec![None; MAX_PARTITIONS];
        for index in store.live_partitions() {
            slots[index as usize] = Some(Arc::new(VPartition::new(
                index,
                device.clone(),
                layout.clone(),
            )));
        }

        // One pass over the allocation table rebuilds every extent map;
        // insertion order does not matter, adjacency coalescing is the
        // map's job.
        for pslice in 1..=layout.pslice_count {
            let entry = store.slice_entry(pslice);
            if entry.is_free() {
                continue;
            }
            let partition = slots[entry.owner() as usize]
                .as_ref()
                .expect("validated slice entry references live partition");
            partition.lock_io().extents.insert(entry.vslice(), pslice);
        }

        info!(
            partitions = store.live_partitions().len(),
            allocated = store.allocated_slices(),
            "volume manager ready"
        );
        Ok(Arc::new(VolumeManager {
            device,
            metadata: Mutex::new(store),
            partitions: RwLock::new(slots),
        }))
    }

    /// Run [`open`](Self::open) on a dedicated worker thread. The returned
    /// handle's `wait()` is the explicit load-complete signal.
    pub fn open_background(device: Arc<dyn BlockDevice>) -> LoadHandle {
        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("slicevol-load".to_string())
            .spawn(move || {
                let _ = tx.send(VolumeManager::open(device));
            })
            .expect("failed to spawn load worker");
        LoadHandle { rx }
    }

    /// Initialize a device with empty metadata (see
    /// [`MetadataStore::format`]).
    pub fn format(device: &Arc<dyn BlockDevice>, slice_size: u64) -> Result<()> {
        MetadataStore::format(device, slice_size, 0)
    }

    /// Live partition handle by entry index.
    pub fn partition(&self, index: u16) -> Result<Arc<VPartition>> {
        self.partitions
            .read()
            .get(index as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| VolumeError::NotFound(format!("no partition at index {}", index)))
    }

    /// Copy of a live partition's table entry.
    pub fn partition_entry(&self, index: u16) -> Result<PartitionEntry> {
        let store = self.metadata.lock();
        if index == 0 || index as usize >= MAX_PARTITIONS {
            return Err(VolumeError::NotFound(format!(
                "no partition at index {}",
                index
            )));
        }
        let entry = store.partition_entry(index);
        if entry.is_free() {
            return Err(VolumeError::NotFound(format!(
                "no partition at index {}",
                index
            )));
        }
        Ok(entry.clone())
    }

    /// Live partition handle by instance GUID.
    pub fn partition_by_instance(&self, instance_guid: Guid) -> Result<Arc<VPartition>> {
        let index = self
            .metadata
            .lock()
            .find_by_instance(instance_guid)
            .ok_or_else(|| {
                VolumeError::NotFound(format!("no partition with instance {}", instance_guid))
            })?;
        self.partition(index)
    }

    /// Create a partition and give it `slice_count` initial slices at
    /// vslice 0, persisted as a single generation step.
    pub fn allocate_partition(
        &self,
        type_guid: Guid,
        instance_guid: Guid,
        name: &str,
        slice_count: u64,
    ) -> Result<u16> {
        self.allocate_partition_inner(type_guid, instance_guid, name, slice_count, true)
    }

    /// Like [`allocate_partition`](Self::allocate_partition) but the new
    /// partition starts inactive: the staging half of an A/B pair, flipped
    /// live later by [`activate`](Self::activate).
    pub fn allocate_staged_partition(
        &self,
        type_guid: Guid,
        instance_guid: Guid,
        name: &str,
        slice_count: u64,
    ) -> Result<u16> {
        self.allocate_partition_inner(type_guid, instance_guid, name, slice_count, false)
    }

    fn allocate_partition_inner(
        &self,
        type_guid: Guid,
        instance_guid: Guid,
        name: &str,
        slice_count: u64,
        active: bool,
    ) -> Result<u16> {
        if slice_count == 0 {
            return Err(VolumeError::InvalidArgs(
                "partitions must hold at least one slice".to_string(),
            ));
        }
        validate_name(name)?;

        let mut store = self.metadata.lock();
        if store.find_by_instance(instance_guid).is_some() {
            return Err(VolumeError::InvalidArgs(format!(
                "instance {} already exists",
                instance_guid
            )));
        }
        let index = store.find_free_partition_entry()?;
        let mut entry = PartitionEntry::new(type_guid, instance_guid, name)?;
        entry.set_active(active);
        *store.partition_entry_mut(index) = entry;

        let partition = Arc::new(VPartition::new(
            index,
            self.device.clone(),
            store.layout().clone(),
        ));
        let mut state = partition.lock_for_update(&mut store);

        let mapped = match Self::map_range(&mut store, index, &mut state, 0, slice_count) {
            Ok(mapped) => mapped,
            Err(e) => {
                store.clear_partition_entry(index);
                return Err(e);
            }
        };
        if let Err(e) = store.persist() {
            Self::unmap_range(&mut store, &mut state, &mapped);
            store.clear_partition_entry(index);
            return Err(e);
        }
        drop(state);

        self.partitions.write()[index as usize] = Some(partition);
        info!(index, name, slice_count, "allocated partition");
        Ok(index)
    }

    /// Map `count` fresh vslices starting at `vslice_start`. All-or-nothing:
    /// a failure part way unwinds every slice mapped by this call.
    pub fn allocate_slices(&self, index: u16, vslice_start: u64, count: u64) -> Result<()> {
        let partition = self.partition(index)?;
        let mut store = self.metadata.lock();
        let mut state = partition.lock_for_update(&mut store);
        Self::check_alive(index, &state)?;
        Self::check_vslice_range(&store, vslice_start, count)?;

        let mapped = Self::map_range(&mut store, index, &mut state, vslice_start, count)?;
        if let Err(e) = store.persist() {
            // The rollback happens under both locks, so no caller can see
            // the mutation that just failed to persist.
            Self::unmap_range(&mut store, &mut state, &mapped);
            return Err(e);
        }
        Ok(())
    }

    /// Free mapped slices in `[vslice_start, vslice_start + count)`,
    /// skipping unmapped indices. `vslice_start == 0` frees the whole
    /// partition regardless of `count` (kept for on-the-wire
    /// compatibility); [`destroy`](Self::destroy) is the explicit form.
    pub fn free_slices(&self, index: u16, vslice_start: u64, count: u64) -> Result<()> {
        if vslice_start == 0 {
            return self.destroy(index);
        }

        let partition = self.partition(index)?;
        let mut store = self.metadata.lock();
        let mut state = partition.lock_for_update(&mut store);
        Self::check_alive(index, &state)?;
        Self::check_vslice_range(&store, vslice_start, count)?;

        // Highest index first so every removal is a tail pop or a split
        // whose tail is gone by the next iteration.
        let mut freed = Vec::new();
        for vslice in (vslice_start..vslice_start + count).rev() {
            if let Some(pslice) = state.extents.remove(vslice) {
                store.free_slice(pslice);
                freed.push((vslice, pslice));
            }
        }

        if let Err(e) = store.persist() {
            for &(vslice, pslice) in freed.iter().rev() {
                store.allocate_slice(pslice, index, vslice);
                state.extents.insert(vslice, pslice);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Free the whole partition: every slice, the table entry, and the
    /// registry slot. The partition transitions to Killed and stays there.
    pub fn destroy(&self, index: u16) -> Result<()> {
        let partition = self.partition(index)?;
        let mut store = self.metadata.lock();
        let mut state = partition.lock_for_update(&mut store);
        Self::check_alive(index, &state)?;

        let drained = state.extents.drain_all();
        for &(_, pslice) in &drained {
            store.free_slice(pslice);
        }
        let saved_entry = store.partition_entry(index).clone();
        store.clear_partition_entry(index);
        state.status = PartitionStatus::Killed;

        if let Err(e) = store.persist() {
            *store.partition_entry_mut(index) = saved_entry;
            for &(vslice, pslice) in &drained {
                store.allocate_slice(pslice, index, vslice);
                state.extents.insert(vslice, pslice);
            }
            state.status = PartitionStatus::Active;
            return Err(e);
        }
        drop(state);
        drop(store);

        // Drop the registry reference; in-flight I/O still holds the Arc,
        // so the object dies only once its operations drain.
        self.partitions.write()[index as usize] = None;
        info!(index, freed = drained.len(), "destroyed partition");
        Ok(())
    }

    /// A/B activation flip: the inactive entry matching `new_instance`
    /// becomes active, the active entry matching `old_instance` (if any)
    /// becomes inactive, persisted as one generation step.
    pub fn activate(&self, old_instance: Guid, new_instance: Guid) -> Result<()> {
        let mut store = self.metadata.lock();

        let new_index = store
            .find_by_instance(new_instance)
            .filter(|&i| !store.partition_entry(i).is_active())
            .ok_or_else(|| {
                VolumeError::NotFound(format!(
                    "no inactive partition with instance {}",
                    new_instance
                ))
            })?;
        let old_index = store
            .find_by_instance(old_instance)
            .filter(|&i| store.partition_entry(i).is_active());

        store.partition_entry_mut(new_index).set_active(true);
        if let Some(old) = old_index {
            store.partition_entry_mut(old).set_active(false);
        }

        if let Err(e) = store.persist() {
            store.partition_entry_mut(new_index).set_active(false);
            if let Some(old) = old_index {
                store.partition_entry_mut(old).set_active(true);
            }
            return Err(e);
        }
        info!(new = new_index, old = ?old_index, "activated partition");
        Ok(())
    }

    /// Volume-wide accounting; no mutation.
    pub fn query(&self) -> VolumeInfo {
        let store = self.metadata.lock();
        VolumeInfo {
            slice_size: store.layout().slice_size,
            pslice_count: store.layout().pslice_count,
            allocated_slices: store.allocated_slices(),
            max_vslice_count: store.layout().max_vslice_count(),
        }
    }

    /// For each queried vslice, whether it is mapped and how long the
    /// uniform run starting there is.
    pub fn query_slice_ranges(&self, index: u16, vslices: &[u64]) -> Result<Vec<SliceRange>> {
        // Metadata lock first (and released) to respect the lock order.
        let max = self.metadata.lock().layout().max_vslice_count();
        let partition = self.partition(index)?;
        let state = partition.lock_io();
        if state.status == PartitionStatus::Killed {
            return Err(VolumeError::BadState(format!(
                "partition {} is destroyed",
                index
            )));
        }
        let mut ranges = Vec::with_capacity(vslices.len());
        for &vslice in vslices {
            if vslice >= max {
                return Err(VolumeError::OutOfRange(format!(
                    "vslice {} beyond addressable {}",
                    vslice, max
                )));
            }
            let (allocated, run) = state.extents.run_at(vslice);
            ranges.push(SliceRange {
                allocated,
                count: run.unwrap_or(max - vslice),
            });
        }
        Ok(ranges)
    }

    fn check_alive(index: u16, state: &PartitionState) -> Result<()> {
        if state.status == PartitionStatus::Killed {
            return Err(VolumeError::BadState(format!(
                "partition {} is destroyed",
                index
            )));
        }
        Ok(())
    }

    fn check_vslice_range(store: &MetadataStore, vslice_start: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Err(VolumeError::InvalidArgs("slice count is zero".to_string()));
        }
        let max = store.layout().max_vslice_count();
        match vslice_start.checked_add(count) {
            Some(end) if end <= max => Ok(()),
            _ => Err(VolumeError::InvalidArgs(format!(
                "vslices {}+{} exceed addressable {}",
                vslice_start, count, max
            ))),
        }
    }

    /// Map `count` vslices onto free physical slices, returning the new
    /// mappings for the caller's rollback. On failure every mapping made
    /// here is already unwound.
    fn map_range(
        store: &mut MetadataStore,
        index: u16,
        state: &mut PartitionState,
        vslice_start: u64,
        count: u64,
    ) -> Result<Vec<(u64, u64)>> {
        let mut mapped = Vec::with_capacity(count as usize);
        // Rolling hint keeps a multi-slice request physically clustered.
        let mut hint = 1;
        for vslice in vslice_start..vslice_start + count {
            if state.extents.is_mapped(vslice) {
                Self::unmap_range(store, state, &mapped);
                return Err(VolumeError::InvalidArgs(format!(
                    "vslice {} is already mapped",
                    vslice
                )));
            }
            let pslice = match store.find_free_slice(hint) {
                Ok(pslice) => pslice,
                Err(e) => {
                    Self::unmap_range(store, state, &mapped);
                    return Err(e);
                }
            };
            store.allocate_slice(pslice, index, vslice);
            state.extents.insert(vslice, pslice);
            mapped.push((vslice, pslice));
            hint = pslice + 1;
        }
        Ok(mapped)
    }

    fn unmap_range(store: &mut MetadataStore, state: &mut PartitionState, mapped: &[(u64, u64)]) {
        for &(vslice, pslice) in mapped.iter().rev() {
            state.extents.remove(vslice);
            store.free_slice(pslice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::layout::{Layout, BLOCK_SIZE};

    /// Device sized so exactly `pslices` physical slices fit after the
    /// metadata copies.
    fn slice_exact_device(pslices: u64) -> Arc<dyn BlockDevice> {
        let probe = Layout::for_device(1 << 20, BLOCK_SIZE, 0).unwrap();
        let device: Arc<dyn BlockDevice> =
            Arc::new(MemDevice::new(probe.data_offset() + pslices * BLOCK_SIZE));
        VolumeManager::format(&device, BLOCK_SIZE).unwrap();
        device
    }

    fn open_manager(pslices: u64) -> Arc<VolumeManager> {
        VolumeManager::open(slice_exact_device(pslices)).unwrap()
    }

    fn new_partition(manager: &VolumeManager, slices: u64) -> u16 {
        manager
            .allocate_partition(Guid::generate(), Guid::generate(), "test-part", slices)
            .unwrap()
    }

    #[test]
    fn test_allocate_partition_initial_slices() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 3);

        let partition = manager.partition(index).unwrap();
        assert_eq!(partition.slice_count(), 3);
        assert_eq!(manager.query().allocated_slices, 3);
        assert_eq!(
            manager.query_slice_ranges(index, &[0]).unwrap(),
            vec![SliceRange {
                allocated: true,
                count: 3
            }]
        );
    }

    #[test]
    fn test_allocate_partition_duplicate_instance() {
        let manager = open_manager(100);
        let instance = Guid::generate();
        manager
            .allocate_partition(Guid::generate(), instance, "a", 1)
            .unwrap();
        assert!(matches!(
            manager.allocate_partition(Guid::generate(), instance, "b", 1),
            Err(VolumeError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_extend_and_shrink() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 2);

        manager.allocate_slices(index, 10, 4).unwrap();
        assert_eq!(manager.query().allocated_slices, 6);

        manager.free_slices(index, 10, 4).unwrap();
        assert_eq!(manager.query().allocated_slices, 2);
    }

    #[test]
    fn test_allocate_already_mapped_fails_clean() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 3);

        // Overlaps vslice 2.
        let result = manager.allocate_slices(index, 2, 2);
        assert!(matches!(result, Err(VolumeError::InvalidArgs(_))));
        assert_eq!(manager.query().allocated_slices, 3);
        assert_eq!(manager.partition(index).unwrap().slice_count(), 3);
    }

    #[test]
    fn test_nospace_rollback_is_exact() {
        let manager = open_manager(10);
        let index = new_partition(&manager, 4);
        let before = manager.query();

        // 6 free remain; ask for 7.
        let result = manager.allocate_slices(index, 100, 7);
        assert!(matches!(result, Err(VolumeError::NoSpace(_))));

        assert_eq!(manager.query(), before);
        let partition = manager.partition(index).unwrap();
        assert_eq!(partition.slice_count(), 4);
        assert_eq!(
            manager.query_slice_ranges(index, &[100]).unwrap()[0].allocated,
            false
        );
    }

    #[test]
    fn test_free_unmapped_is_idempotent() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 2);

        manager.free_slices(index, 50, 5).unwrap();
        assert_eq!(manager.query().allocated_slices, 2);
        assert_eq!(manager.partition(index).unwrap().slice_count(), 2);
    }

    #[test]
    fn test_destroy_partition() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 5);
        let partition = manager.partition(index).unwrap();

        manager.destroy(index).unwrap();
        assert_eq!(manager.query().allocated_slices, 0);
        assert_eq!(partition.status(), PartitionStatus::Killed);
        assert!(matches!(
            manager.partition(index),
            Err(VolumeError::NotFound(_))
        ));
        // Terminal: slice operations on the dead handle are rejected.
        assert!(matches!(
            manager.free_slices(index, 1, 1),
            Err(VolumeError::NotFound(_))
        ));
    }

    #[test]
    fn test_free_slices_zero_start_destroys() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 5);
        let partition = manager.partition(index).unwrap();

        manager.free_slices(index, 0, 1).unwrap();
        assert_eq!(partition.status(), PartitionStatus::Killed);
        assert_eq!(manager.query().allocated_slices, 0);
    }

    #[test]
    fn test_destroyed_slot_is_reusable() {
        let manager = open_manager(100);
        let first = new_partition(&manager, 1);
        manager.destroy(first).unwrap();

        let second = new_partition(&manager, 1);
        assert_eq!(first, second);
        assert_eq!(manager.partition(second).unwrap().slice_count(), 1);
    }

    #[test]
    fn test_activate_flips_flags() {
        let manager = open_manager(100);
        let old_instance = Guid::generate();
        let new_instance = Guid::generate();
        let old_index = manager
            .allocate_partition(Guid::generate(), old_instance, "blob-a", 1)
            .unwrap();
        let new_index = manager
            .allocate_partition(Guid::generate(), new_instance, "blob-b", 1)
            .unwrap();

        // Stage the new side inactive, as an updater would.
        {
            let mut store = manager.metadata.lock();
            store.partition_entry_mut(new_index).set_active(false);
            store.persist().unwrap();
        }

        let generation_before = manager.metadata.lock().generation();
        manager.activate(old_instance, new_instance).unwrap();

        let store = manager.metadata.lock();
        assert!(!store.partition_entry(old_index).is_active());
        assert!(store.partition_entry(new_index).is_active());
        assert_eq!(store.generation(), generation_before + 1);
    }

    #[test]
    fn test_activate_missing_target() {
        let manager = open_manager(100);
        let old_instance = Guid::generate();
        let old_index = manager
            .allocate_partition(Guid::generate(), old_instance, "blob-a", 1)
            .unwrap();

        let result = manager.activate(old_instance, Guid::generate());
        assert!(matches!(result, Err(VolumeError::NotFound(_))));
        // The existing entry's flags are untouched.
        assert!(manager
            .metadata
            .lock()
            .partition_entry(old_index)
            .is_active());
    }

    #[test]
    fn test_invalid_vslice_range() {
        let manager = open_manager(100);
        let index = new_partition(&manager, 1);
        let max = manager.query().max_vslice_count;

        assert!(matches!(
            manager.allocate_slices(index, max, 1),
            Err(VolumeError::InvalidArgs(_))
        ));
        assert!(matches!(
            manager.allocate_slices(index, 1, 0),
            Err(VolumeError::InvalidArgs(_))
        ));
        assert!(matches!(
            manager.allocate_slices(index, u64::MAX, 2),
            Err(VolumeError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_open_background_signals_completion() {
        let device = slice_exact_device(100);
        let manager = VolumeManager::open_background(device).wait().unwrap();
        assert_eq!(manager.query().pslice_count, 100);
    }

    #[test]
    fn test_reopen_rebuilds_extents() {
        let device = slice_exact_device(100);

        let index;
        {
            let manager = VolumeManager::open(device.clone()).unwrap();
            index = new_partition(&manager, 3);
            manager.free_slices(index, 1, 1).unwrap();
        }

        let manager = VolumeManager::open(device).unwrap();
        let ranges = manager.query_slice_ranges(index, &[0, 1, 2]).unwrap();
        assert_eq!(ranges[0], SliceRange { allocated: true, count: 1 });
        assert_eq!(ranges[1], SliceRange { allocated: false, count: 1 });
        assert_eq!(ranges[2], SliceRange { allocated: true, count: 1 });
        assert_eq!(manager.query().allocated_slices, 2);
    }
}
