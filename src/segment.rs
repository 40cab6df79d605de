//! Shared-memory segments used as single-slot channels between one proxy
//! thread and one daemon worker.
//!
//! Layout of every segment:
//!   Offset 0:            SegmentHeader
//!     [cache_sem: sem_t] [proxy_sem: sem_t] [bytes_sent: i64] [file_size: i64]
//!   Offset HEADER_SIZE:  chunk buffer (capacity bytes)
//!
//! The semaphores give each round a strict alternation: the proxy posts
//! `cache_sem` to ask for a chunk, the daemon fills the buffer and posts
//! `proxy_sem`. Nobody touches the buffer out of turn, so no lock is needed.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::protocol::segment::NOT_FOUND;

#[repr(C)]
struct SegmentHeader {
    cache_sem: UnsafeCell<libc::sem_t>,
    proxy_sem: UnsafeCell<libc::sem_t>,
    bytes_sent: AtomicI64,
    file_size: AtomicI64,
}

/// Bytes reserved ahead of the chunk buffer (header rounded to a cache line).
pub const HEADER_SIZE: usize = (std::mem::size_of::<SegmentHeader>() + 63) & !63;

/// Name of the shared memory object backing segment `id`.
pub fn segment_name(prefix: &str, id: usize) -> String {
    format!("{}{}", prefix, id)
}

/// A named POSIX shared memory object mapped read/write into this process.
pub struct SharedRegion {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory; every access to it is ordered by the
// segment semaphores.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new object of `len` bytes. Fails if the name already exists.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        Self::map(name, len, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, true)
    }

    /// Map an existing object. Fails if it is smaller than `len`.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        Self::map(name, len, libc::O_RDWR, false)
    }

    /// Remove the name. Returns false when nothing was there.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = c_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(CacheError::SharedMemory {
                op: "shm_unlink",
                name: name.to_string(),
                source: err,
            })
        }
    }

    fn map(name: &str, len: usize, flags: libc::c_int, truncate: bool) -> Result<Self> {
        let c_name = c_name(name)?;
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o666 as libc::mode_t) };
        if raw < 0 {
            return Err(CacheError::shm("shm_open", name));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if truncate {
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                return Err(CacheError::shm("ftruncate", name));
            }
        } else {
            // Touching pages past the end of the object would SIGBUS
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
                return Err(CacheError::shm("fstat", name));
            }
            if (st.st_size as u64) < len as u64 {
                return Err(CacheError::SharedMemory {
                    op: "open",
                    name: name.to_string(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("object is {} bytes, need {}", st.st_size, len),
                    ),
                });
            }
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CacheError::shm("mmap", name));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| CacheError::shm("mmap", name))?;

        Ok(SharedRegion {
            name: name.to_string(),
            ptr,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| CacheError::SharedMemory {
        op: "name",
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"),
    })
}

#[derive(Clone, Copy, Debug)]
enum Sem {
    Cache,
    Proxy,
}

// Header plus buffer, rejecting capacities that overflow or exceed off_t
fn mapped_len(name: &str, op: &'static str, capacity: usize) -> Result<usize> {
    HEADER_SIZE
        .checked_add(capacity)
        .filter(|len| i64::try_from(*len).is_ok())
        .ok_or_else(|| CacheError::SharedMemory {
            op,
            name: name.to_string(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("region size {} too large", capacity),
            ),
        })
}

/// One mapped segment.
pub struct Segment {
    id: usize,
    capacity: usize,
    region: SharedRegion,
}

impl Segment {
    /// Create and map segment `id` with a chunk buffer of `capacity` bytes.
    pub fn create(prefix: &str, id: usize, capacity: usize) -> Result<Self> {
        let name = segment_name(prefix, id);
        let region = SharedRegion::create(&name, mapped_len(&name, "create", capacity)?)?;
        Ok(Segment {
            id,
            capacity,
            region,
        })
    }

    /// Map a segment created by another process.
    pub fn open(prefix: &str, id: usize, capacity: usize) -> Result<Self> {
        let name = segment_name(prefix, id);
        let region = SharedRegion::open(&name, mapped_len(&name, "open", capacity)?)?;
        Ok(Segment {
            id,
            capacity,
            region,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Chunk buffer capacity (the region size carried in control messages).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Re-initialize both semaphores to 0 and clear the size fields.
    ///
    /// Runs on every claim. Only safe because a segment is released after
    /// its previous daemon worker posted for the last time.
    pub fn reset(&self) -> Result<()> {
        for sem in [Sem::Cache, Sem::Proxy] {
            if unsafe { libc::sem_init(self.sem_ptr(sem), 1, 0) } != 0 {
                return Err(self.sem_error("init"));
            }
        }
        self.header().bytes_sent.store(0, Ordering::Relaxed);
        self.header().file_size.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// The requesting side of the channel.
    pub fn proxy_end(&self, timeout: Option<Duration>) -> ProxyEnd<'_> {
        ProxyEnd {
            segment: self,
            timeout,
        }
    }

    /// The serving side of the channel.
    pub fn cache_end(&self, timeout: Option<Duration>) -> CacheEnd<'_> {
        CacheEnd {
            segment: self,
            timeout,
        }
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the region is at least HEADER_SIZE bytes, page aligned, and
        // SegmentHeader is valid for any bit pattern the peer may leave.
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    fn buffer_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(HEADER_SIZE) }
    }

    fn sem_ptr(&self, sem: Sem) -> *mut libc::sem_t {
        match sem {
            Sem::Cache => self.header().cache_sem.get(),
            Sem::Proxy => self.header().proxy_sem.get(),
        }
    }

    fn sem_error(&self, op: &'static str) -> CacheError {
        CacheError::Semaphore {
            op,
            segment: self.id,
            source: io::Error::last_os_error(),
        }
    }

    fn post(&self, sem: Sem) -> Result<()> {
        if unsafe { libc::sem_post(self.sem_ptr(sem)) } != 0 {
            return Err(self.sem_error("post"));
        }
        Ok(())
    }

    fn wait(&self, sem: Sem, timeout: Option<Duration>) -> Result<()> {
        let sem_ptr = self.sem_ptr(sem);
        let deadline = timeout.map(deadline_after).transpose().map_err(|source| {
            CacheError::Semaphore {
                op: "clock_gettime",
                segment: self.id,
                source,
            }
        })?;
        loop {
            let rc = match deadline {
                None => unsafe { libc::sem_wait(sem_ptr) },
                Some(ref abs) => unsafe { libc::sem_timedwait(sem_ptr, abs) },
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Err(CacheError::PeerTimeout(self.id)),
                _ => {
                    return Err(CacheError::Semaphore {
                        op: "wait",
                        segment: self.id,
                        source: err,
                    })
                }
            }
        }
    }
}

fn deadline_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    now.tv_sec = sec;
    now.tv_nsec = nsec;
    Ok(now)
}

/// Proxy side: reads the daemon's answer and pulls chunks.
pub struct ProxyEnd<'a> {
    segment: &'a Segment,
    timeout: Option<Duration>,
}

impl ProxyEnd<'_> {
    /// Block until the daemon resolved the path. None means not found.
    pub fn wait_file_size(&self) -> Result<Option<u64>> {
        self.segment.wait(Sem::Proxy, self.timeout)?;
        let size = self.segment.header().file_size.load(Ordering::Acquire);
        Ok(if size < 0 { None } else { Some(size as u64) })
    }

    /// Ask the daemon for the next chunk.
    pub fn request_chunk(&self) -> Result<()> {
        self.segment.post(Sem::Cache)
    }

    /// Block until the requested chunk is ready and copy it into `out`.
    pub fn take_chunk(&self, out: &mut Vec<u8>) -> Result<usize> {
        self.segment.wait(Sem::Proxy, self.timeout)?;
        let len = self.segment.header().bytes_sent.load(Ordering::Acquire);
        if len <= 0 || len as usize > self.segment.capacity {
            return Err(CacheError::CorruptChunk {
                id: self.segment.id,
                len,
                capacity: self.segment.capacity,
            });
        }
        let len = len as usize;
        // SAFETY: the daemon wrote `len` bytes before posting proxy_sem and
        // will not write again until we post cache_sem.
        let chunk = unsafe { std::slice::from_raw_parts(self.segment.buffer_ptr(), len) };
        out.clear();
        out.extend_from_slice(chunk);
        Ok(len)
    }
}

/// Daemon side: publishes the file size and fills chunks on request.
pub struct CacheEnd<'a> {
    segment: &'a Segment,
    timeout: Option<Duration>,
}

impl CacheEnd<'_> {
    /// Write the file size (None = not found) and wake the proxy once.
    pub fn publish_file_size(&self, size: Option<u64>) -> Result<()> {
        let raw = match size {
            Some(n) => n as i64,
            None => NOT_FOUND,
        };
        self.segment.header().file_size.store(raw, Ordering::Release);
        self.segment.post(Sem::Proxy)
    }

    /// Block until the proxy asks for a chunk.
    pub fn wait_chunk_request(&self) -> Result<()> {
        self.segment.wait(Sem::Cache, self.timeout)
    }

    /// Read exactly `min(len, capacity)` bytes from `src` into the buffer and
    /// hand them to the proxy. `path` only labels errors.
    pub fn fill_chunk<R: Read>(&self, src: &mut R, len: usize, path: &str) -> Result<usize> {
        let len = len.min(self.segment.capacity);
        // SAFETY: the proxy posted cache_sem and waits on proxy_sem; it does
        // not read the buffer until we post below.
        let buf = unsafe { std::slice::from_raw_parts_mut(self.segment.buffer_ptr(), len) };
        src.read_exact(buf).map_err(|source| CacheError::ShortRead {
            path: path.to_string(),
            expected: len,
            source,
        })?;
        self.segment
            .header()
            .bytes_sent
            .store(len as i64, Ordering::Release);
        self.segment.post(Sem::Proxy)?;
        Ok(len)
    }
}

#[cfg(test)]
pub(crate) fn unique_prefix() -> String {
    format!("/gfc_test_{}_", uuid::Uuid::new_v4().simple())
}
