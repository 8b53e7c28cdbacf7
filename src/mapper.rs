//! Translation of partition-relative byte ranges into physical operations.
//!
//! A request is admitted all-or-nothing: every virtual slice it touches must
//! be mapped before any physical I/O is issued. Runs of physically
//! contiguous slices collapse into one operation; everything else splits at
//! slice boundaries, and an atomic countdown joins the sub-completions back
//! into the caller's single callback.

use crate::device::IoCallback;
use crate::error::{Result, VolumeError};
use crate::extent::ExtentMap;
use crate::layout::Layout;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One physical operation produced from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalSpan {
    /// Absolute device byte offset.
    pub device_offset: u64,
    pub length: u64,
    /// Offset of this span's bytes within the caller's buffer.
    pub buffer_offset: usize,
}

/// Resolve a partition-relative byte range to physical spans.
///
/// Fails `InvalidArgs` on a zero-length request, `OutOfRange` if the range
/// leaves the partition's virtual address space or touches an unmapped
/// slice. No I/O happens here.
pub fn map_request(
    extents: &ExtentMap,
    layout: &Layout,
    byte_offset: u64,
    byte_len: u64,
) -> Result<Vec<PhysicalSpan>> {
    if byte_len == 0 {
        return Err(VolumeError::InvalidArgs(
            "zero-length I/O request".to_string(),
        ));
    }

    let slice_size = layout.slice_size;
    let last_byte = byte_offset
        .checked_add(byte_len - 1)
        .ok_or_else(|| VolumeError::OutOfRange("request offset overflow".to_string()))?;
    let start_vslice = byte_offset / slice_size;
    let end_vslice = last_byte / slice_size;
    if end_vslice >= layout.max_vslice_count() {
        return Err(VolumeError::OutOfRange(format!(
            "request ends at vslice {} beyond addressable {}",
            end_vslice,
            layout.max_vslice_count()
        )));
    }

    // Admission: resolve the whole span before issuing anything.
    let mut pslices = Vec::with_capacity((end_vslice - start_vslice + 1) as usize);
    for vslice in start_vslice..=end_vslice {
        match extents.lookup(vslice) {
            Some(pslice) => pslices.push(pslice),
            None => {
                return Err(VolumeError::OutOfRange(format!(
                    "vslice {} is not mapped",
                    vslice
                )));
            }
        }
    }

    // One chunk per virtual slice crossed, truncated to its slice
    // boundaries; physically adjacent chunks coalesce as they are built, so
    // the single-slice and fully-contiguous cases come out as one span.
    let mut spans: Vec<PhysicalSpan> = Vec::new();
    let mut buffer_offset = 0usize;
    for (i, &pslice) in pslices.iter().enumerate() {
        let vslice = start_vslice + i as u64;
        let chunk_start = byte_offset.max(vslice * slice_size);
        let chunk_end = last_byte.min(vslice * slice_size + slice_size - 1);
        let length = chunk_end - chunk_start + 1;
        let device_offset = layout.pslice_offset(pslice) + (chunk_start - vslice * slice_size);

        match spans.last_mut() {
            Some(prev) if prev.device_offset + prev.length == device_offset => {
                prev.length += length;
            }
            _ => spans.push(PhysicalSpan {
                device_offset,
                length,
                buffer_offset,
            }),
        }
        buffer_offset += length as usize;
    }

    Ok(spans)
}

/// Join for a set of issued sub-operations.
///
/// Completions may arrive concurrently on any thread; the caller's callback
/// fires exactly once, after all of them, with the first non-OK status
/// observed. Sub-operations are never cancelled.
pub(crate) struct IoGroup {
    remaining: AtomicUsize,
    first_error: Mutex<Option<VolumeError>>,
    /// Read assembly buffer; empty for writes and flushes.
    buffer: Mutex<Vec<u8>>,
    on_done: Mutex<Option<IoCallback>>,
}

impl IoGroup {
    pub fn new(total: usize, buffer: Vec<u8>, on_done: IoCallback) -> Arc<IoGroup> {
        assert!(total > 0);
        Arc::new(IoGroup {
            remaining: AtomicUsize::new(total),
            first_error: Mutex::new(None),
            buffer: Mutex::new(buffer),
            on_done: Mutex::new(Some(on_done)),
        })
    }

    /// Completion for the sub-operation whose bytes land at `buffer_offset`.
    pub fn sub_completion(self: &Arc<Self>, buffer_offset: usize) -> IoCallback {
        let group = Arc::clone(self);
        Box::new(move |result| {
            match result {
                Ok(data) if !data.is_empty() => {
                    let mut buffer = group.buffer.lock();
                    buffer[buffer_offset..buffer_offset + data.len()].copy_from_slice(&data);
                }
                Ok(_) => {}
                Err(e) => {
                    let mut first = group.first_error.lock();
                    if first.is_none() {
                        *first = Some(e);
                    }
                }
            }

            if group.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let on_done = group
                    .on_done
                    .lock()
                    .take()
                    .expect("completion group fired twice");
                match group.first_error.lock().take() {
                    Some(e) => on_done(Err(e)),
                    None => on_done(Ok(std::mem::take(&mut *group.buffer.lock()))),
                }
            }
        })
    }
}
