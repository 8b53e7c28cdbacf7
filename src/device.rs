//! Block device boundary.
//!
//! The metadata path uses the synchronous read/write/flush calls; the data
//! path queues operations and gets completions back on whatever thread the
//! device runs them on. [`FileDevice`] backs a volume with a regular file
//! and drains queued operations on a worker thread; [`MemDevice`] keeps the
//! whole volume in memory for tests and embedding.

use crate::error::{Result, VolumeError};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread::JoinHandle;

/// One queued data-path operation.
#[derive(Debug)]
pub enum IoOp {
    Read { offset: u64, len: u64 },
    Write { offset: u64, data: Vec<u8> },
    Flush,
}

/// Completion callback; reads deliver the data, writes and flushes an empty
/// buffer. May be invoked on any thread.
pub type IoCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

pub trait BlockDevice: Send + Sync {
    /// Device capacity in bytes.
    fn size(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Queue an asynchronous operation. The completion fires exactly once.
    fn queue(&self, op: IoOp, completion: IoCallback);
}

fn check_bounds(size: u64, offset: u64, len: u64) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| VolumeError::OutOfRange("device offset overflow".to_string()))?;
    if end > size {
        return Err(VolumeError::OutOfRange(format!(
            "I/O at {}+{} beyond device size {}",
            offset, len, size
        )));
    }
    Ok(())
}

fn run_op(device: &dyn BlockDevice, op: IoOp) -> Result<Vec<u8>> {
    match op {
        IoOp::Read { offset, len } => {
            let mut buf = vec![0u8; len as usize];
            device.read_at(offset, &mut buf)?;
            Ok(buf)
        }
        IoOp::Write { offset, data } => {
            device.write_at(offset, &data)?;
            Ok(Vec::new())
        }
        IoOp::Flush => {
            device.flush()?;
            Ok(Vec::new())
        }
    }
}

/// File-backed block device.
pub struct FileDevice {
    file: Mutex<File>,
    size: u64,
    tx: Option<Sender<(IoOp, IoCallback)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileDevice {
    /// Create a file of `size` bytes and open it as a device.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        Self::with_file(file, size)
    }

    /// Open an existing file as a device.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        Self::with_file(file, size)
    }

    fn with_file(file: File, size: u64) -> Result<Self> {
        // The worker gets its own handle so queued operations never contend
        // with the synchronous metadata path on the file lock.
        let mut worker_file = file.try_clone()?;
        let (tx, rx) = unbounded::<(IoOp, IoCallback)>();
        let worker = std::thread::Builder::new()
            .name("slicevol-io".to_string())
            .spawn(move || {
                for (op, completion) in rx {
                    let result = match op {
                        IoOp::Read { offset, len } => {
                            read_exact_at(&mut worker_file, offset, len as usize)
                        }
                        IoOp::Write { offset, data } => {
                            write_all_at(&mut worker_file, offset, &data).map(|_| Vec::new())
                        }
                        IoOp::Flush => worker_file
                            .sync_all()
                            .map(|_| Vec::new())
                            .map_err(VolumeError::from),
                    };
                    completion(result);
                }
            })?;

        Ok(FileDevice {
            file: Mutex::new(file),
            size,
            tx: Some(tx),
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn read_exact_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_all_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

impl BlockDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.size, offset, buf.len() as u64)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(self.size, offset, data.len() as u64)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn queue(&self, op: IoOp, completion: IoCallback) {
        let len = match &op {
            IoOp::Read { len, .. } => *len,
            IoOp::Write { data, .. } => data.len() as u64,
            IoOp::Flush => 0,
        };
        let offset = match &op {
            IoOp::Read { offset, .. } | IoOp::Write { offset, .. } => *offset,
            IoOp::Flush => 0,
        };
        if let Err(e) = check_bounds(self.size, offset, len) {
            completion(Err(e));
            return;
        }

        let tx = self.tx.as_ref().expect("device already shut down");
        if let Err(send) = tx.send((op, completion)) {
            let (_, completion) = send.into_inner();
            completion(Err(VolumeError::BadState(
                "device worker has shut down".to_string(),
            )));
        }
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        // Disconnect the channel so the worker drains and exits.
        self.tx.take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// In-memory block device.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new(size: u64) -> Self {
        MemDevice {
            data: Mutex::new(vec![0u8; size as usize]),
        }
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        check_bounds(data.len() as u64, offset, buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut dev = self.data.lock();
        check_bounds(dev.len() as u64, offset, data.len() as u64)?;
        let start = offset as usize;
        dev[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn queue(&self, op: IoOp, completion: IoCallback) {
        completion(run_op(self, op));
    }
}
