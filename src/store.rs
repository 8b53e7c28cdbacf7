//! Crash-consistent metadata store.
//!
//! Two full metadata images live on disk. Every persist writes the complete
//! image to whichever copy is currently inactive and only then flips the
//! in-memory notion of "active": a crash before the write completes leaves
//! the old copy untouched, a crash after leaves two valid copies of which
//! the newer generation wins at the next load. The store owns the decoded
//! tables; nothing else in the crate touches raw metadata bytes.

use crate::device::BlockDevice;
use crate::error::{Result, VolumeError};
use crate::guid::Guid;
use crate::layout::{
    Header, Layout, PartitionEntry, SliceEntry, BLOCK_SIZE, FORMAT_VERSION, HEADER_HASH_OFFSET,
    MAGIC, MAX_PARTITIONS, PARTITION_ENTRY_SIZE, SLICE_ENTRY_SIZE,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which on-disk image is the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySlot {
    Primary,
    Secondary,
}

impl CopySlot {
    pub fn other(self) -> CopySlot {
        match self {
            CopySlot::Primary => CopySlot::Secondary,
            CopySlot::Secondary => CopySlot::Primary,
        }
    }

    fn offset(self, layout: &Layout) -> u64 {
        match self {
            CopySlot::Primary => layout.primary_offset(),
            CopySlot::Secondary => layout.secondary_offset(),
        }
    }
}

struct DecodedImage {
    header: Header,
    partitions: Vec<PartitionEntry>,
    slices: Vec<SliceEntry>,
}

/// Owner of the metadata tables and the A/B persistence cycle.
pub struct MetadataStore {
    device: Arc<dyn BlockDevice>,
    layout: Layout,
    header: Header,
    /// Fixed table of MAX_PARTITIONS entries; slot 0 reserved.
    partitions: Vec<PartitionEntry>,
    /// One entry per physical slice; index 0 reserved.
    slices: Vec<SliceEntry>,
    active_copy: CopySlot,
    /// Global allocated-slice counter; always equals the sum of the
    /// partition entries' slice counts.
    allocated: u64,
}

impl MetadataStore {
    /// Initialize a device with empty metadata.
    ///
    /// `table_capacity` (0 for "the current device size") reserves
    /// allocation-table room for later device growth; the metadata
    /// footprint never moves after format. Both copies are written valid,
    /// the secondary one generation ahead, so the first persist after load
    /// targets the primary.
    pub fn format(device: &Arc<dyn BlockDevice>, slice_size: u64, table_capacity: u64) -> Result<()> {
        let volume_size = device.size();
        let layout = Layout::for_device(volume_size, slice_size, table_capacity)?;

        let mut header = Header {
            magic: MAGIC,
            version: FORMAT_VERSION,
            generation: 0,
            hash: [0; 32],
            slice_size,
            pslice_count: layout.pslice_count,
            partition_table_size: layout.partition_table_size,
            allocation_table_size: layout.allocation_table_size,
            volume_size,
        };
        let partitions = vec![PartitionEntry::free(); MAX_PARTITIONS];
        let slices = vec![SliceEntry::FREE; layout.pslice_count as usize + 1];

        let image = encode_image(&layout, &header, &partitions, &slices);
        device.write_at(layout.primary_offset(), &image)?;

        header.generation = 1;
        let image = encode_image(&layout, &header, &partitions, &slices);
        device.write_at(layout.secondary_offset(), &image)?;
        device.flush()?;

        info!(
            slice_size,
            pslice_count = layout.pslice_count,
            volume_size,
            "formatted volume"
        );
        Ok(())
    }

    /// Load and validate the metadata, picking the valid copy with the
    /// higher generation. If the device has grown since the metadata was
    /// written, the addressable slice count is recomputed and persisted
    /// once before returning.
    pub fn load(device: Arc<dyn BlockDevice>) -> Result<MetadataStore> {
        // The fixed first block tells us the table sizes and therefore
        // where the secondary copy lives.
        let mut first = vec![0u8; BLOCK_SIZE as usize];
        device.read_at(0, &mut first)?;
        let boot = Header::from_bytes(&first)?;
        boot.validate()
            .map_err(|e| VolumeError::DataIntegrity(format!("superblock unusable: {}", e)))?;
        let layout = boot.layout();
        if 2 * layout.metadata_size() > device.size() {
            return Err(VolumeError::DataIntegrity(format!(
                "metadata footprint {} does not fit device of {} bytes",
                2 * layout.metadata_size(),
                device.size()
            )));
        }

        let meta_size = layout.metadata_size() as usize;
        let mut primary_bytes = vec![0u8; meta_size];
        device.read_at(layout.primary_offset(), &mut primary_bytes)?;
        let mut secondary_bytes = vec![0u8; meta_size];
        device.read_at(layout.secondary_offset(), &mut secondary_bytes)?;

        let primary = validate_image(&primary_bytes, &layout);
        if let Err(e) = &primary {
            warn!("primary metadata copy failed validation: {}", e);
        }
        let secondary = validate_image(&secondary_bytes, &layout);
        if let Err(e) = &secondary {
            warn!("secondary metadata copy failed validation: {}", e);
        }

        // Generation breaks ties between valid copies but never overrides
        // validity.
        let (active_copy, image) = match (primary, secondary) {
            (Ok(p), Ok(s)) => {
                if s.header.generation > p.header.generation {
                    (CopySlot::Secondary, s)
                } else {
                    (CopySlot::Primary, p)
                }
            }
            (Ok(p), Err(_)) => (CopySlot::Primary, p),
            (Err(_), Ok(s)) => (CopySlot::Secondary, s),
            (Err(p), Err(_)) => {
                return Err(VolumeError::DataIntegrity(format!(
                    "neither metadata copy validates (primary: {})",
                    p
                )));
            }
        };

        let allocated = image.slices.iter().filter(|s| !s.is_free()).count() as u64;
        let mut store = MetadataStore {
            device,
            layout: image.header.layout(),
            header: image.header,
            partitions: image.partitions,
            slices: image.slices,
            active_copy,
            allocated,
        };
        info!(
            generation = store.header.generation,
            copy = ?active_copy,
            allocated,
            "loaded metadata"
        );

        store.grow_to_device()?;
        Ok(store)
    }

    /// Extend the addressable slice count if the device outgrew the
    /// persisted metadata. The allocation table was sized at format time,
    /// so growth only appends free entries; offsets never move.
    fn grow_to_device(&mut self) -> Result<()> {
        let device_size = self.device.size();
        let data_space = device_size.saturating_sub(self.layout.data_offset());
        let usable = (data_space / self.layout.slice_size).min(self.layout.table_slice_capacity());

        if usable <= self.header.pslice_count {
            return Ok(());
        }

        info!(
            old = self.header.pslice_count,
            new = usable,
            "device grew; extending slice table"
        );
        self.header.pslice_count = usable;
        self.header.volume_size = device_size;
        self.layout = self.header.layout();
        self.slices.resize(usable as usize + 1, SliceEntry::FREE);
        self.persist()
    }

    /// Write the full image to the inactive copy with a bumped generation
    /// and freshly computed hash, then flip the active copy. On failure
    /// nothing in memory changes, so on-disk and in-memory state still
    /// agree.
    pub fn persist(&mut self) -> Result<()> {
        let target = self.active_copy.other();
        let mut next = self.header.clone();
        next.generation += 1;

        let image = encode_image(&self.layout, &next, &self.partitions, &self.slices);
        next.hash
            .copy_from_slice(&image[HEADER_HASH_OFFSET..HEADER_HASH_OFFSET + 32]);

        self.device.write_at(target.offset(&self.layout), &image)?;
        self.device.flush()?;

        self.header = next;
        self.active_copy = target;
        debug!(generation = self.header.generation, copy = ?target, "persisted metadata");
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    pub fn active_copy(&self) -> CopySlot {
        self.active_copy
    }

    pub fn allocated_slices(&self) -> u64 {
        self.allocated
    }

    pub fn partition_entry(&self, index: u16) -> &PartitionEntry {
        &self.partitions[index as usize]
    }

    pub fn partition_entry_mut(&mut self, index: u16) -> &mut PartitionEntry {
        &mut self.partitions[index as usize]
    }

    pub fn slice_entry(&self, pslice: u64) -> SliceEntry {
        self.slices[pslice as usize]
    }

    /// Indices of entries currently holding slices.
    pub fn live_partitions(&self) -> Vec<u16> {
        (1..MAX_PARTITIONS as u16)
            .filter(|&i| !self.partitions[i as usize].is_free())
            .collect()
    }

    /// First free slot in the partition table (slot 0 excluded).
    pub fn find_free_partition_entry(&self) -> Result<u16> {
        (1..MAX_PARTITIONS as u16)
            .find(|&i| self.partitions[i as usize].is_free())
            .ok_or(VolumeError::NoSpace("partition table exhausted"))
    }

    /// Live entry whose instance GUID matches, if any.
    pub fn find_by_instance(&self, instance_guid: Guid) -> Option<u16> {
        (1..MAX_PARTITIONS as u16).find(|&i| {
            let e = &self.partitions[i as usize];
            !e.is_free() && e.instance_guid == instance_guid
        })
    }

    /// First free physical slice at or after `hint`, wrapping around.
    /// Callers pass the previous result + 1 to keep multi-slice requests
    /// physically clustered.
    pub fn find_free_slice(&self, hint: u64) -> Result<u64> {
        let count = self.layout.pslice_count;
        let hint = if (1..=count).contains(&hint) { hint } else { 1 };
        (hint..=count)
            .chain(1..hint)
            .find(|&p| self.slices[p as usize].is_free())
            .ok_or(VolumeError::NoSpace("physical slices exhausted"))
    }

    /// Mark `pslice` owned by (`owner`, `vslice`). State violations are
    /// caller bugs, not recoverable errors.
    pub fn allocate_slice(&mut self, pslice: u64, owner: u16, vslice: u64) {
        let entry = &mut self.slices[pslice as usize];
        assert!(entry.is_free(), "pslice {} is already allocated", pslice);
        assert!(
            !self.partitions[owner as usize].type_guid.is_nil(),
            "pslice {} allocated to unclaimed partition slot {}",
            pslice,
            owner
        );
        *entry = SliceEntry::allocated(owner, vslice);
        self.partitions[owner as usize].slices += 1;
        self.allocated += 1;
    }

    /// Release `pslice`, returning the entry it held.
    pub fn free_slice(&mut self, pslice: u64) -> SliceEntry {
        let entry = self.slices[pslice as usize];
        assert!(!entry.is_free(), "pslice {} is already free", pslice);
        let owner = entry.owner() as usize;
        assert!(
            self.partitions[owner].slices > 0,
            "slice count underflow on partition {}",
            owner
        );
        self.partitions[owner].slices -= 1;
        self.slices[pslice as usize] = SliceEntry::FREE;
        self.allocated -= 1;
        entry
    }

    /// Return a fully drained partition slot to the free pool, erasing its
    /// identity.
    pub fn clear_partition_entry(&mut self, index: u16) {
        assert_eq!(
            self.partitions[index as usize].slices, 0,
            "clearing partition {} that still owns slices",
            index
        );
        self.partitions[index as usize] = PartitionEntry::free();
    }
}

/// Encode one full metadata image with the content hash patched in.
fn encode_image(
    layout: &Layout,
    header: &Header,
    partitions: &[PartitionEntry],
    slices: &[SliceEntry],
) -> Vec<u8> {
    let mut image = vec![0u8; layout.metadata_size() as usize];

    let mut unhashed = header.clone();
    unhashed.hash = [0; 32];
    image[..BLOCK_SIZE as usize].copy_from_slice(&unhashed.to_bytes());

    for (i, entry) in partitions.iter().enumerate() {
        let off = layout.partition_entry_offset(i as u16);
        entry.encode(&mut image[off..off + PARTITION_ENTRY_SIZE]);
    }
    for (p, entry) in slices.iter().enumerate() {
        let off = layout.slice_entry_offset(p as u64);
        entry.encode(&mut image[off..off + SLICE_ENTRY_SIZE]);
    }

    let digest = Sha256::digest(&image);
    image[HEADER_HASH_OFFSET..HEADER_HASH_OFFSET + 32].copy_from_slice(&digest);
    image
}

/// Validate one image: structure, hash, and table consistency.
fn validate_image(bytes: &[u8], layout: &Layout) -> Result<DecodedImage> {
    let header = Header::from_bytes(bytes)?;
    header.validate()?;

    // Both copies must agree on the table geometry or their offsets would
    // not line up; slice count and volume size may differ across a growth
    // persisted to only one copy.
    if header.slice_size != layout.slice_size
        || header.partition_table_size != layout.partition_table_size
        || header.allocation_table_size != layout.allocation_table_size
    {
        return Err(VolumeError::Corrupt(
            "metadata copies disagree on table geometry".to_string(),
        ));
    }

    let mut unhashed = bytes.to_vec();
    unhashed[HEADER_HASH_OFFSET..HEADER_HASH_OFFSET + 32].fill(0);
    let digest = Sha256::digest(&unhashed);
    if digest.as_slice() != header.hash {
        return Err(VolumeError::DataIntegrity(
            "metadata image hash mismatch".to_string(),
        ));
    }

    let mut partitions = Vec::with_capacity(MAX_PARTITIONS);
    for i in 0..MAX_PARTITIONS {
        let off = layout.partition_entry_offset(i as u16);
        partitions.push(PartitionEntry::decode(&bytes[off..off + PARTITION_ENTRY_SIZE])?);
    }
    if !partitions[0].is_free() {
        return Err(VolumeError::Corrupt(
            "reserved partition slot 0 is allocated".to_string(),
        ));
    }

    let mut slices = Vec::with_capacity(header.pslice_count as usize + 1);
    let mut per_owner = vec![0u32; MAX_PARTITIONS];
    for p in 0..=header.pslice_count {
        let off = layout.slice_entry_offset(p);
        let entry = SliceEntry::decode(&bytes[off..off + SLICE_ENTRY_SIZE]);
        if p == 0 {
            if entry != SliceEntry::FREE {
                return Err(VolumeError::Corrupt(
                    "reserved slice entry 0 is allocated".to_string(),
                ));
            }
        } else if !entry.is_free() {
            let owner = entry.owner() as usize;
            if owner >= MAX_PARTITIONS || partitions[owner].is_free() {
                return Err(VolumeError::Corrupt(format!(
                    "slice {} owned by dead partition {}",
                    p, owner
                )));
            }
            per_owner[owner] += 1;
        } else if entry != SliceEntry::FREE {
            return Err(VolumeError::Corrupt(format!(
                "free slice entry {} carries stale bits",
                p
            )));
        }
        slices.push(entry);
    }

    for (i, partition) in partitions.iter().enumerate() {
        if partition.slices != per_owner[i] {
            return Err(VolumeError::Corrupt(format!(
                "partition {} claims {} slices but owns {}",
                i, partition.slices, per_owner[i]
            )));
        }
    }

    Ok(DecodedImage {
        header,
        partitions,
        slices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    const SLICE_SIZE: u64 = BLOCK_SIZE;

    fn formatted_device(volume_size: u64) -> Arc<dyn BlockDevice> {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(volume_size));
        MetadataStore::format(&device, SLICE_SIZE, 0).unwrap();
        device
    }

    /// Sized so exactly 100 physical slices fit.
    fn small_device() -> Arc<dyn BlockDevice> {
        let layout = Layout::for_device(1 << 20, SLICE_SIZE, 0).unwrap();
        formatted_device(layout.data_offset() + 100 * SLICE_SIZE)
    }

    fn claim_slot(store: &mut MetadataStore, index: u16) {
        *store.partition_entry_mut(index) = PartitionEntry::new(
            Guid::from_bytes([1; 16]),
            Guid::from_bytes([index as u8 + 1; 16]),
            "part",
        )
        .unwrap();
    }

    #[test]
    fn test_format_then_load() {
        let device = small_device();
        let store = MetadataStore::load(device).unwrap();

        assert_eq!(store.layout().pslice_count, 100);
        assert_eq!(store.allocated_slices(), 0);
        // Format leaves the secondary copy one generation ahead.
        assert_eq!(store.active_copy(), CopySlot::Secondary);
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn test_persist_alternates_copies() {
        let device = small_device();
        let mut store = MetadataStore::load(device).unwrap();

        store.persist().unwrap();
        assert_eq!(store.active_copy(), CopySlot::Primary);
        assert_eq!(store.generation(), 2);

        store.persist().unwrap();
        assert_eq!(store.active_copy(), CopySlot::Secondary);
        assert_eq!(store.generation(), 3);
    }

    #[test]
    fn test_persist_load_round_trip() {
        let device = small_device();
        let mut store = MetadataStore::load(device.clone()).unwrap();

        claim_slot(&mut store, 1);
        store.allocate_slice(5, 1, 0);
        store.allocate_slice(6, 1, 1);
        store.persist().unwrap();
        let saved_partition = store.partition_entry(1).clone();

        let reloaded = MetadataStore::load(device).unwrap();
        assert_eq!(reloaded.partition_entry(1), &saved_partition);
        assert_eq!(reloaded.slice_entry(5), SliceEntry::allocated(1, 0));
        assert_eq!(reloaded.slice_entry(6), SliceEntry::allocated(1, 1));
        assert_eq!(reloaded.allocated_slices(), 2);
    }

    #[test]
    fn test_find_free_slice_hint_wraps() {
        let device = small_device();
        let mut store = MetadataStore::load(device).unwrap();
        claim_slot(&mut store, 1);

        for p in 90..=100 {
            store.allocate_slice(p, 1, p - 90);
        }
        // Scan from the hint runs off the end and wraps to the start.
        assert_eq!(store.find_free_slice(95).unwrap(), 1);
        // Out-of-range hints fall back to a full scan.
        assert_eq!(store.find_free_slice(0).unwrap(), 1);
        assert_eq!(store.find_free_slice(10_000).unwrap(), 1);
    }

    #[test]
    fn test_find_free_slice_exhausted() {
        let device = small_device();
        let mut store = MetadataStore::load(device).unwrap();
        claim_slot(&mut store, 1);

        for p in 1..=100 {
            store.allocate_slice(p, 1, p - 1);
        }
        assert!(matches!(
            store.find_free_slice(1),
            Err(VolumeError::NoSpace(_))
        ));
    }

    #[test]
    fn test_allocate_free_counters() {
        let device = small_device();
        let mut store = MetadataStore::load(device).unwrap();
        claim_slot(&mut store, 1);

        store.allocate_slice(7, 1, 3);
        assert_eq!(store.allocated_slices(), 1);
        assert_eq!(store.partition_entry(1).slices, 1);

        let freed = store.free_slice(7);
        assert_eq!(freed.owner(), 1);
        assert_eq!(freed.vslice(), 3);
        assert_eq!(store.allocated_slices(), 0);
        assert_eq!(store.partition_entry(1).slices, 0);
    }

    #[test]
    #[should_panic(expected = "already allocated")]
    fn test_double_allocate_panics() {
        let device = small_device();
        let mut store = MetadataStore::load(device).unwrap();
        claim_slot(&mut store, 1);
        store.allocate_slice(7, 1, 0);
        store.allocate_slice(7, 1, 1);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn test_double_free_panics() {
        let device = small_device();
        let mut store = MetadataStore::load(device).unwrap();
        store.free_slice(7);
    }

    #[test]
    fn test_load_prefers_higher_generation() {
        let device = small_device();
        {
            let mut store = MetadataStore::load(device.clone()).unwrap();
            store.persist().unwrap();
            store.persist().unwrap();
        }
        let store = MetadataStore::load(device).unwrap();
        assert_eq!(store.generation(), 3);
        assert_eq!(store.active_copy(), CopySlot::Secondary);
    }

    #[test]
    fn test_load_grows_with_device() {
        // Format with table capacity reserved for four times the device,
        // then "grow" by copying the image onto a larger device.
        let layout = Layout::for_device(1 << 20, SLICE_SIZE, 4 << 20).unwrap();
        let small: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(1 << 20));
        MetadataStore::format(&small, SLICE_SIZE, 4 << 20).unwrap();
        let before = MetadataStore::load(small.clone()).unwrap();
        let small_count = before.layout().pslice_count;

        let large: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4 << 20));
        let mut image = vec![0u8; (2 * layout.metadata_size()) as usize];
        small.read_at(0, &mut image).unwrap();
        large.write_at(0, &image).unwrap();

        let grown = MetadataStore::load(large.clone()).unwrap();
        assert!(grown.layout().pslice_count > small_count);
        // The growth was persisted before load returned.
        let reloaded = MetadataStore::load(large).unwrap();
        assert_eq!(reloaded.layout().pslice_count, grown.layout().pslice_count);
    }
}
