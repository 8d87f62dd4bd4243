//! The optional process-shared queue depth counter: a single atomic
//! integer memory-mapped from a file, so an outside observer can
//! sample the current depth without any IPC with the daemon.
//! Incremented per record entering the queue, decremented per record
//! written downstream; exactly zero after a clean shutdown.

use std::{
    fs::OpenOptions,
    io::Write,
    mem::transmute,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    sync::atomic::{AtomicI64, Ordering},
};

use memmap2::{MmapMut, MmapOptions};

// Signed on purpose: an accounting bug shows up as a negative sample
// instead of an absurdly large one.
type DepthAtomic = AtomicI64;

#[derive(Debug)]
pub struct DepthCounter {
    mmap: MmapMut,
}

#[derive(thiserror::Error, Debug)]
pub enum DepthCounterError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("invalid length {0} of file contents")]
    InvalidFileContentsLength(u64),
}

impl DepthCounter {
    pub fn open(path: &Path) -> Result<Self, DepthCounterError> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        opts.write(true);
        opts.truncate(false);
        opts.create(true);
        opts.mode(0o600); // XX how to make portable?
        let mut file = opts.open(path)?;
        let m = file.metadata()?;
        let l = m.len();
        const DALEN: u64 = size_of::<DepthAtomic>() as u64;
        match l {
            0 => {
                let a = DepthAtomic::new(0);
                let b: &[u8; size_of::<DepthAtomic>()] = unsafe { transmute(&a) };
                file.write_all(b)?;
            }
            DALEN => (),
            _ => Err(DepthCounterError::InvalidFileContentsLength(l))?,
        }
        let mmap = unsafe {
            MmapOptions::new()
                .len(size_of::<DepthAtomic>())
                .map(&file)?
                .make_mut()?
        };
        Ok(Self { mmap })
    }

    fn atomic(&self) -> &DepthAtomic {
        let value: &[u8; size_of::<DepthAtomic>()] = (&(*self.mmap)
            [0..size_of::<DepthAtomic>()])
            .try_into()
            .expect("same size of DepthAtomic bytes");
        let ptr = value.as_ptr() as *const DepthAtomic;
        unsafe { &*ptr }
    }

    pub fn increment(&self) {
        self.atomic().fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        self.atomic().fetch_sub(1, Ordering::SeqCst);
    }

    /// Back to zero, for the start of a run; leftovers from an
    /// earlier run would fake depth.
    pub fn reset(&self) {
        self.atomic().store(0, Ordering::SeqCst);
    }

    pub fn sample(&self) -> i64 {
        self.atomic().load(Ordering::SeqCst)
    }
}
