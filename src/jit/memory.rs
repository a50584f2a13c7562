//! Executable memory management using mmap.
//!
//! [`ExecutableMemory`] owns one mapping. [`JitMemoryAllocator`] carves
//! chunks of such mappings into [`JitRegion`]s handed out to compiled
//! functions and inline caches.

use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

/// Every region starts at a multiple of this.
pub const REGION_ALIGNMENT: usize = 16;

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A block of memory allocated via mmap.
///
/// Mapped readable, writable and executable when the OS allows it. Stencils
/// are patched in place and inline caches are populated while the code that
/// owns them may already be running, so there is no W^X flip.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of at least `size` bytes, rounded up to the page size.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let (ptr, executable) = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable,
        })
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    fn mmap_alloc(size: usize) -> Result<(NonNull<u8>, bool), MemoryError> {
        let map = |prot| {
            // SAFETY: anonymous private mapping, no file descriptor involved
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(ptr as *mut u8)
            }
        };

        if let Some(ptr) = map(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) {
            return Ok((ptr, true));
        }
        warn!(target: "copa::jit", "RWX mapping refused, falling back to RW memory");
        map(libc::PROT_READ | libc::PROT_WRITE)
            .map(|ptr| (ptr, false))
            .ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is plain memory; access is partitioned through JitRegion.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// An exclusively owned range inside a chunk of executable memory.
///
/// Keeps its chunk alive, so the range stays mapped as long as the region exists.
pub struct JitRegion {
    chunk: Arc<ExecutableMemory>,
    offset: usize,
    len: usize,
}

impl JitRegion {
    /// Absolute address of the first byte.
    pub fn addr(&self) -> usize {
        self.chunk.as_ptr() as usize + self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        self.chunk.is_executable()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range is inside the live mapping and owned by this region only
        unsafe { std::slice::from_raw_parts(self.chunk.as_ptr().add(self.offset), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees unique access
        unsafe { std::slice::from_raw_parts_mut(self.chunk.as_ptr().add(self.offset), self.len) }
    }

    /// Does this region share any byte with `other`?
    pub fn overlaps(&self, other: &JitRegion) -> bool {
        let (a, b) = (self.addr(), other.addr());
        a < b + other.len && b < a + self.len
    }
}

impl std::fmt::Debug for JitRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

struct AllocatorState {
    current: Option<Arc<ExecutableMemory>>,
    cursor: usize,
    total_mapped: usize,
}

/// Bump allocator over chunks of executable memory.
///
/// Safe to share between threads. Memory is never handed out twice and
/// only returned to the OS once every region of a chunk is dropped.
pub struct JitMemoryAllocator {
    chunk_size: usize,
    state: Mutex<AllocatorState>,
}

impl JitMemoryAllocator {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(REGION_ALIGNMENT),
            state: Mutex::new(AllocatorState {
                current: None,
                cursor: 0,
                total_mapped: 0,
            }),
        }
    }

    /// Allocate a zero-filled region of `size` bytes, 16-byte aligned.
    pub fn allocate_given_size(&self, size: usize) -> Result<JitRegion, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let rounded = size
            .checked_next_multiple_of(REGION_ALIGNMENT)
            .ok_or(MemoryError::InvalidSize)?;

        if rounded > self.chunk_size {
            let chunk = Arc::new(ExecutableMemory::new(rounded)?);
            self.state.lock().total_mapped += chunk.size();
            debug!(target: "copa::jit", "dedicated mapping of {} bytes", chunk.size());
            return Ok(JitRegion {
                chunk,
                offset: 0,
                len: size,
            });
        }

        let mut state = self.state.lock();
        let fits = state
            .current
            .as_ref()
            .is_some_and(|c| state.cursor + rounded <= c.size());
        if !fits {
            let chunk = Arc::new(ExecutableMemory::new(self.chunk_size)?);
            state.total_mapped += chunk.size();
            state.current = Some(chunk);
            state.cursor = 0;
        }
        let offset = state.cursor;
        state.cursor += rounded;
        let chunk = state
            .current
            .clone()
            .ok_or(MemoryError::AllocationFailed)?;
        Ok(JitRegion {
            chunk,
            offset,
            len: size,
        })
    }

    /// Allocate a region from a size class; class `s` is `(s + 1) * 16` bytes.
    pub fn allocate_given_stepping(&self, stepping: u8) -> Result<JitRegion, MemoryError> {
        self.allocate_given_size(stepping_to_size(stepping))
    }

    /// Bytes mapped from the OS so far.
    pub fn total_mapped(&self) -> usize {
        self.state.lock().total_mapped
    }
}

pub fn stepping_to_size(stepping: u8) -> usize {
    (stepping as usize + 1) * REGION_ALIGNMENT
}
