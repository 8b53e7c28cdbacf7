//! Slice-based volume manager.
//!
//! slicevol partitions a single physical block device into many
//! independently growable logical volumes by mapping fixed-size virtual
//! slices onto fixed-size physical slices, and persists that mapping
//! crash-consistently with a redundant A/B metadata image.
//!
//! ## Features
//!
//! - **A/B metadata**: every persist writes the full image to the inactive
//!   copy; a valid copy survives any crash mid-write, and the higher
//!   generation wins at load
//! - **SHA-256 content hash** over each image, computed with the hash field
//!   zeroed; generation never overrides validity
//! - **Minimal extent maps** per partition with greedy coalescing and
//!   split-on-remove
//! - **All-or-nothing mutation**: multi-slice allocate/free unwinds its own
//!   partial work on any failure, including persistence failure
//! - **Request splitting/coalescing**: partition-relative I/O becomes one
//!   physical operation when the backing slices are contiguous, one per
//!   slice otherwise, joined by an atomic countdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               VolumeManager                 │
//! │  allocate / extend / shrink / destroy /     │
//! │  activate / query                           │
//! ├──────────────────────┬──────────────────────┤
//! │ MetadataStore        │ VPartition (per      │
//! │  A/B images, tables, │  volume): extent     │
//! │  load/persist        │  map, status, I/O    │
//! ├──────────────────────┴──────────────────────┤
//! │                 BlockDevice                 │
//! │  sync read/write/flush (metadata path)      │
//! │  async queue + completions (data path)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use slicevol::{Guid, MemDevice, VolumeManager, BLOCK_SIZE};
//! use std::sync::Arc;
//!
//! # fn main() -> slicevol::Result<()> {
//! let device: Arc<dyn slicevol::BlockDevice> = Arc::new(MemDevice::new(64 << 20));
//! VolumeManager::format(&device, BLOCK_SIZE)?;
//!
//! let manager = VolumeManager::open(device)?;
//! let index = manager.allocate_partition(
//!     Guid::generate(),
//!     Guid::generate(),
//!     "user-data",
//!     4,
//! )?;
//!
//! let partition = manager.partition(index)?;
//! partition.write(0, b"hello volume")?;
//! assert_eq!(partition.read(0, 12)?, b"hello volume");
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod extent;
pub mod guid;
pub mod layout;
pub mod manager;
pub mod mapper;
pub mod partition;
pub mod store;

// Re-export commonly used types
pub use device::{BlockDevice, FileDevice, IoCallback, IoOp, MemDevice};
pub use error::{Result, VolumeError};
pub use extent::{Extent, ExtentMap};
pub use guid::Guid;
pub use layout::{Header, Layout, PartitionEntry, SliceEntry, BLOCK_SIZE, MAX_PARTITIONS};
pub use manager::{LoadHandle, SliceRange, VolumeInfo, VolumeManager};
pub use mapper::PhysicalSpan;
pub use partition::{PartitionStatus, VPartition};
pub use store::{CopySlot, MetadataStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
