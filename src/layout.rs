//! On-disk metadata format.
//!
//! A formatted device carries two full metadata images (primary at offset 0,
//! secondary immediately after) followed by the data region of physical
//! slices. Each image is:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header block (BLOCK_SIZE)                    │
//! │  - magic, version, generation, content hash  │
//! │  - slice size, slice count, table sizes      │
//! ├──────────────────────────────────────────────┤
//! │ Partition table (MAX_PARTITIONS x 64 bytes)  │
//! │  - type GUID, instance GUID, slices, flags,  │
//! │    fixed-length name                         │
//! ├──────────────────────────────────────────────┤
//! │ Allocation table (one u64 per pslice)        │
//! │  - packed owner partition + owner vslice     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Offset and size arithmetic lives in
//! [`Layout`] as pure functions so the rest of the crate never repeats it.

use crate::error::{Result, VolumeError};
use crate::guid::Guid;

pub const MAGIC: [u8; 8] = *b"SVOL\x00\x01\x00\x00";
pub const FORMAT_VERSION: u32 = 1;

/// Metadata granularity; slice sizes must be a non-zero multiple of this.
pub const BLOCK_SIZE: u64 = 8192;

/// Partition table slots. Slot 0 is reserved and never allocated.
pub const MAX_PARTITIONS: usize = 1024;

pub const PARTITION_NAME_LEN: usize = 24;
pub const PARTITION_ENTRY_SIZE: usize = 64;
pub const SLICE_ENTRY_SIZE: usize = 8;

/// Size of the hash-covered header fields; the rest of the block is padding.
pub const HEADER_LEN: usize = 8 + 4 + 8 + 32 + 8 + 8 + 8 + 8 + 8;

/// Byte offset of the 32-byte hash field inside the header block.
pub const HEADER_HASH_OFFSET: usize = 8 + 4 + 8;

const PARTITION_TABLE_SIZE: u64 = (MAX_PARTITIONS * PARTITION_ENTRY_SIZE) as u64;

/// Partition is present but not the active side of an A/B pair.
pub const PARTITION_FLAG_INACTIVE: u32 = 1 << 0;

const KNOWN_FLAGS: u32 = PARTITION_FLAG_INACTIVE;

/// Virtual slice indices are stored in 32 bits of the slice entry.
const VSLICE_BITS: u32 = 32;

/// Owner partition indices are stored in the low 16 bits of the slice entry.
const OWNER_BITS: u32 = 16;

/// Metadata superblock, stored at the start of each image copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Magic number: "SVOL\x00\x01\x00\x00"
    pub magic: [u8; 8],

    /// Format version
    pub version: u32,

    /// Monotonically increasing; the valid copy with the higher generation
    /// is the current one.
    pub generation: u64,

    /// SHA-256 over the full image with this field zeroed.
    pub hash: [u8; 32],

    /// Bytes per slice (virtual and physical slices share one size).
    pub slice_size: u64,

    /// Physical slices addressable in the data region.
    pub pslice_count: u64,

    /// Partition table bytes; fixed, sized for MAX_PARTITIONS.
    pub partition_table_size: u64,

    /// Allocation table bytes; block-aligned, at least large enough for
    /// pslice_count entries. May be larger to leave room for device growth.
    pub allocation_table_size: u64,

    /// Total addressable device size in bytes.
    pub volume_size: u64,
}

impl Header {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BLOCK_SIZE as usize);
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.generation.to_le_bytes());
        bytes.extend_from_slice(&self.hash);
        bytes.extend_from_slice(&self.slice_size.to_le_bytes());
        bytes.extend_from_slice(&self.pslice_count.to_le_bytes());
        bytes.extend_from_slice(&self.partition_table_size.to_le_bytes());
        bytes.extend_from_slice(&self.allocation_table_size.to_le_bytes());
        bytes.extend_from_slice(&self.volume_size.to_le_bytes());
        bytes.resize(BLOCK_SIZE as usize, 0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(VolumeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for header",
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let generation = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[20..52]);
        let slice_size = u64::from_le_bytes(bytes[52..60].try_into().unwrap());
        let pslice_count = u64::from_le_bytes(bytes[60..68].try_into().unwrap());
        let partition_table_size = u64::from_le_bytes(bytes[68..76].try_into().unwrap());
        let allocation_table_size = u64::from_le_bytes(bytes[76..84].try_into().unwrap());
        let volume_size = u64::from_le_bytes(bytes[84..92].try_into().unwrap());

        Ok(Header {
            magic,
            version,
            generation,
            hash,
            slice_size,
            pslice_count,
            partition_table_size,
            allocation_table_size,
            volume_size,
        })
    }

    /// Structural validation: everything that can be checked without the
    /// table contents or the content hash.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(VolumeError::InvalidMagic);
        }

        if self.version != FORMAT_VERSION {
            return Err(VolumeError::UnsupportedVersion(self.version));
        }

        if self.slice_size == 0 || self.slice_size % BLOCK_SIZE != 0 {
            return Err(VolumeError::Corrupt(format!(
                "slice size {} is not a multiple of the block size",
                self.slice_size
            )));
        }

        if self.partition_table_size != PARTITION_TABLE_SIZE {
            return Err(VolumeError::Corrupt(format!(
                "partition table size {} (expected {})",
                self.partition_table_size, PARTITION_TABLE_SIZE
            )));
        }

        let needed = (self.pslice_count + 1) * SLICE_ENTRY_SIZE as u64;
        if self.allocation_table_size < needed || self.allocation_table_size % BLOCK_SIZE != 0 {
            return Err(VolumeError::Corrupt(format!(
                "allocation table size {} cannot address {} slices",
                self.allocation_table_size, self.pslice_count
            )));
        }

        // The data region must fit in the addressable device without the
        // slice arithmetic overflowing.
        let layout = self.layout();
        let data_len = self
            .pslice_count
            .checked_mul(self.slice_size)
            .ok_or_else(|| VolumeError::Corrupt("slice address space overflow".to_string()))?;
        let end = layout
            .data_offset()
            .checked_add(data_len)
            .ok_or_else(|| VolumeError::Corrupt("slice address space overflow".to_string()))?;
        if end > self.volume_size {
            return Err(VolumeError::Corrupt(format!(
                "data region ends at {} beyond volume size {}",
                end, self.volume_size
            )));
        }

        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout {
            slice_size: self.slice_size,
            pslice_count: self.pslice_count,
            partition_table_size: self.partition_table_size,
            allocation_table_size: self.allocation_table_size,
            volume_size: self.volume_size,
        }
    }
}

/// Derived offset/size arithmetic for one metadata sizing.
///
/// Computed once at load (or format) time; every table and slice offset used
/// anywhere in the crate comes from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub slice_size: u64,
    pub pslice_count: u64,
    pub partition_table_size: u64,
    pub allocation_table_size: u64,
    pub volume_size: u64,
}

impl Layout {
    /// Size one device: solve for the slice count that fits alongside two
    /// metadata copies. The allocation table is sized for `table_capacity`
    /// bytes of device (>= volume_size) so the metadata footprint stays put
    /// if the device later grows.
    pub fn for_device(volume_size: u64, slice_size: u64, table_capacity: u64) -> Result<Layout> {
        if slice_size == 0 || slice_size % BLOCK_SIZE != 0 {
            return Err(VolumeError::InvalidArgs(format!(
                "slice size {} is not a multiple of the block size {}",
                slice_size, BLOCK_SIZE
            )));
        }

        let capacity = table_capacity.max(volume_size);
        let max_slices = capacity / slice_size;
        let allocation_table_size = allocation_table_size_for(max_slices);

        // The usable slice count depends on the metadata footprint, which is
        // fixed once the table capacity is chosen.
        let metadata = BLOCK_SIZE + PARTITION_TABLE_SIZE + allocation_table_size;
        let data_space = volume_size.saturating_sub(2 * metadata);
        let pslice_count = (data_space / slice_size).min(max_slices);
        if pslice_count == 0 {
            return Err(VolumeError::NoSpace(
                "device too small for metadata and at least one slice",
            ));
        }

        Ok(Layout {
            slice_size,
            pslice_count,
            partition_table_size: PARTITION_TABLE_SIZE,
            allocation_table_size,
            volume_size,
        })
    }

    /// Bytes in one full metadata image.
    pub fn metadata_size(&self) -> u64 {
        BLOCK_SIZE + self.partition_table_size + self.allocation_table_size
    }

    pub fn primary_offset(&self) -> u64 {
        0
    }

    pub fn secondary_offset(&self) -> u64 {
        self.metadata_size()
    }

    /// Start of the data region (after both metadata copies).
    pub fn data_offset(&self) -> u64 {
        2 * self.metadata_size()
    }

    /// Device byte offset of physical slice `pslice` (1-based).
    pub fn pslice_offset(&self, pslice: u64) -> u64 {
        debug_assert!(pslice >= 1);
        self.data_offset() + (pslice - 1) * self.slice_size
    }

    /// Byte offset of a partition entry within a metadata image.
    pub fn partition_entry_offset(&self, index: u16) -> usize {
        BLOCK_SIZE as usize + index as usize * PARTITION_ENTRY_SIZE
    }

    /// Byte offset of a slice entry within a metadata image.
    pub fn slice_entry_offset(&self, pslice: u64) -> usize {
        (BLOCK_SIZE + self.partition_table_size) as usize + pslice as usize * SLICE_ENTRY_SIZE
    }

    /// Physical slices the persisted allocation table can address.
    pub fn table_slice_capacity(&self) -> u64 {
        self.allocation_table_size / SLICE_ENTRY_SIZE as u64 - 1
    }

    /// Virtual slices addressable per partition, bounded by the slice entry
    /// packing.
    pub fn max_vslice_count(&self) -> u64 {
        1u64 << VSLICE_BITS
    }
}

/// Block-aligned allocation table size for `pslice_count` slices (entry 0 is
/// reserved like partition slot 0).
fn allocation_table_size_for(pslice_count: u64) -> u64 {
    let raw = (pslice_count + 1) * SLICE_ENTRY_SIZE as u64;
    (raw + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// One fixed-size slot in the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub instance_guid: Guid,
    /// Slices owned by this partition; 0 means the slot is free.
    pub slices: u32,
    pub flags: u32,
    pub name: String,
}

impl PartitionEntry {
    /// An unused slot.
    pub fn free() -> Self {
        PartitionEntry {
            type_guid: Guid::NIL,
            instance_guid: Guid::NIL,
            slices: 0,
            flags: 0,
            name: String::new(),
        }
    }

    /// A fresh, active entry. The name must be non-empty, at most
    /// [`PARTITION_NAME_LEN`] bytes, and NUL-free.
    pub fn new(type_guid: Guid, instance_guid: Guid, name: &str) -> Result<Self> {
        if type_guid.is_nil() || instance_guid.is_nil() {
            return Err(VolumeError::InvalidArgs(
                "partition GUIDs must not be nil".to_string(),
            ));
        }
        validate_name(name)?;

        Ok(PartitionEntry {
            type_guid,
            instance_guid,
            slices: 0,
            flags: 0,
            name: name.to_string(),
        })
    }

    pub fn is_free(&self) -> bool {
        self.slices == 0
    }

    pub fn is_active(&self) -> bool {
        self.flags & PARTITION_FLAG_INACTIVE == 0
    }

    pub fn set_active(&mut self, active: bool) {
        if active {
            self.flags &= !PARTITION_FLAG_INACTIVE;
        } else {
            self.flags |= PARTITION_FLAG_INACTIVE;
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PARTITION_ENTRY_SIZE);
        buf[0..16].copy_from_slice(self.type_guid.as_bytes());
        buf[16..32].copy_from_slice(self.instance_guid.as_bytes());
        buf[32..36].copy_from_slice(&self.slices.to_le_bytes());
        let mut name = [0u8; PARTITION_NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[36..36 + PARTITION_NAME_LEN].copy_from_slice(&name);
        buf[60..64].copy_from_slice(&self.flags.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        debug_assert!(buf.len() >= PARTITION_ENTRY_SIZE);
        let type_guid = Guid::from_bytes(buf[0..16].try_into().unwrap());
        let instance_guid = Guid::from_bytes(buf[16..32].try_into().unwrap());
        let slices = u32::from_le_bytes(buf[32..36].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[60..64].try_into().unwrap());

        let name_bytes = &buf[36..36 + PARTITION_NAME_LEN];
        let len = name_bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        if name_bytes[..len].contains(&0) {
            return Err(VolumeError::Corrupt(
                "partition name contains an embedded NUL".to_string(),
            ));
        }
        let name = std::str::from_utf8(&name_bytes[..len])
            .map_err(|_| VolumeError::Corrupt("partition name is not UTF-8".to_string()))?
            .to_string();

        let entry = PartitionEntry {
            type_guid,
            instance_guid,
            slices,
            flags,
            name,
        };

        if entry.slices > 0 {
            if entry.type_guid.is_nil() || entry.instance_guid.is_nil() {
                return Err(VolumeError::Corrupt(
                    "allocated partition entry with nil GUID".to_string(),
                ));
            }
            if entry.name.is_empty() {
                return Err(VolumeError::Corrupt(
                    "allocated partition entry with empty name".to_string(),
                ));
            }
            if entry.flags & !KNOWN_FLAGS != 0 {
                return Err(VolumeError::Corrupt(format!(
                    "unknown partition flags {:#x}",
                    entry.flags
                )));
            }
        }

        Ok(entry)
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > PARTITION_NAME_LEN {
        return Err(VolumeError::InvalidArgs(format!(
            "partition name must be 1..={} bytes",
            PARTITION_NAME_LEN
        )));
    }
    if name.bytes().any(|b| b == 0) {
        return Err(VolumeError::InvalidArgs(
            "partition name must not contain NUL".to_string(),
        ));
    }
    Ok(())
}

/// One packed slot in the allocation table: low 16 bits owner partition
/// index (0 = free), next 32 bits the owning virtual slice index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceEntry(u64);

impl SliceEntry {
    pub const FREE: SliceEntry = SliceEntry(0);

    pub fn allocated(owner: u16, vslice: u64) -> Self {
        assert!(owner != 0, "slice owner 0 is the free marker");
        assert!(vslice < 1u64 << VSLICE_BITS, "vslice index out of range");
        SliceEntry(owner as u64 | (vslice << OWNER_BITS))
    }

    pub fn is_free(&self) -> bool {
        self.owner() == 0
    }

    pub fn owner(&self) -> u16 {
        (self.0 & ((1 << OWNER_BITS) - 1)) as u16
    }

    pub fn vslice(&self) -> u64 {
        (self.0 >> OWNER_BITS) & ((1u64 << VSLICE_BITS) - 1)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SLICE_ENTRY_SIZE);
        buf[..8].copy_from_slice(&self.0.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= SLICE_ENTRY_SIZE);
        SliceEntry(u64::from_le_bytes(buf[..8].try_into().unwrap()))
    }
}
