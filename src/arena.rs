//! Raw memory regions the sample buffer is carved from.
//!
//! Two backings implement [`Arena`]:
//!
//! - [`SharedMemoryArena`]: a System V shared-memory segment identified by
//!   an integer key, mapped by every process taking part in an observation.
//! - [`LocalArena`]: an anonymous shared mapping private to this process,
//!   for single-process pipelines and tests.
//!
//! Both hand out zero-filled memory on creation and unmap it on drop.

use std::io;
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// A mapped, zero-initialized byte region that stays at a fixed address for
/// the lifetime of the arena.
pub trait Arena: Send + Sync {
    /// Start of the mapping in this process.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Size of the mapping in bytes.
    fn size(&self) -> usize;
}

/// A System V shared-memory segment attached to this process.
///
/// The creator may own the segment's lifecycle: if
/// [`remove_on_drop`](Self::set_remove_on_drop) is set, dropping the arena
/// marks the segment for removal (the kernel frees it after the last process
/// detaches). Attachers never remove the segment.
#[derive(Debug)]
pub struct SharedMemoryArena {
    ptr: NonNull<u8>,
    size: usize,
    key: i32,
    shmid: i32,
    creator: bool,
    remove_on_drop: bool,
}

unsafe impl Send for SharedMemoryArena {}
unsafe impl Sync for SharedMemoryArena {}

impl SharedMemoryArena {
    /// Creates a fresh segment of `size` bytes under `key` and attaches it.
    ///
    /// A segment left behind under the same key by an earlier run is removed
    /// first: a new observation always starts from zeroed memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharedMemory`] if the segment cannot be created or
    /// attached.
    pub fn create(key: i32, size: usize) -> Result<Self> {
        let shmid = match shm_create(key, size) {
            Ok(shmid) => shmid,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(key, "removing stale shared memory segment");
                remove_key(key)?;
                shm_create(key, size).map_err(|source| Error::SharedMemory {
                    op: "create",
                    key,
                    source,
                })?
            }
            Err(source) => {
                return Err(Error::SharedMemory {
                    op: "create",
                    key,
                    source,
                });
            }
        };

        let ptr = match shm_attach(shmid) {
            Ok(ptr) => ptr,
            Err(source) => {
                unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
                return Err(Error::SharedMemory {
                    op: "attach",
                    key,
                    source,
                });
            }
        };

        tracing::debug!(key, shmid, size, "created shared memory segment");
        Ok(Self {
            ptr,
            size,
            key,
            shmid,
            creator: true,
            remove_on_drop: true,
        })
    }

    /// Attaches an existing segment under `key`, whatever its size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharedMemory`] if no segment exists under `key`, if
    /// this process lacks permission, or if it cannot be mapped.
    pub fn attach(key: i32) -> Result<Self> {
        let shmid = unsafe { libc::shmget(key, 0, 0o600) };
        if shmid == -1 {
            return Err(Error::shm("lookup", key));
        }

        let size = segment_size(shmid).map_err(|source| Error::SharedMemory {
            op: "stat",
            key,
            source,
        })?;

        let ptr = shm_attach(shmid).map_err(|source| Error::SharedMemory {
            op: "attach",
            key,
            source,
        })?;

        tracing::debug!(key, shmid, size, "attached shared memory segment");
        Ok(Self {
            ptr,
            size,
            key,
            shmid,
            creator: false,
            remove_on_drop: false,
        })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    /// Whether this process created the segment.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Controls whether dropping this arena removes the segment. Only has an
    /// effect for the creator.
    pub fn set_remove_on_drop(&mut self, remove: bool) {
        self.remove_on_drop = remove && self.creator;
    }
}

impl Arena for SharedMemoryArena {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMemoryArena {
    fn drop(&mut self) {
        unsafe {
            if libc::shmdt(self.ptr.as_ptr().cast()) == -1 {
                tracing::error!(
                    key = self.key,
                    "shmdt failed: {}",
                    io::Error::last_os_error()
                );
            }
            if self.remove_on_drop
                && libc::shmctl(self.shmid, libc::IPC_RMID, ptr::null_mut()) == -1
            {
                tracing::error!(
                    key = self.key,
                    "removing segment failed: {}",
                    io::Error::last_os_error()
                );
            }
        }
        tracing::debug!(
            key = self.key,
            removed = self.remove_on_drop,
            "detached shared memory segment"
        );
    }
}

/// An anonymous `MAP_SHARED` mapping visible only to this process (and to
/// children forked after its creation).
#[derive(Debug)]
pub struct LocalArena {
    ptr: NonNull<u8>,
    size: usize,
}

unsafe impl Send for LocalArena {}
unsafe impl Sync for LocalArena {}

impl LocalArena {
    /// Maps `size` zeroed bytes.
    pub fn new(size: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::shm("mmap", 0));
        }
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or(Error::SharedMemory {
            op: "mmap",
            key: 0,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })?;
        Ok(Self { ptr, size })
    }
}

impl Arena for LocalArena {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for LocalArena {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr.as_ptr().cast(), self.size) == -1 {
                tracing::error!("munmap failed: {}", io::Error::last_os_error());
            }
        }
    }
}

fn shm_create(key: i32, size: usize) -> io::Result<i32> {
    let shmid = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
    if shmid == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(shmid)
}

fn shm_attach(shmid: i32) -> io::Result<NonNull<u8>> {
    let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
}

fn segment_size(shmid: i32) -> io::Result<usize> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ds.shm_segsz as usize)
}

/// Marks the segment under `key` for removal, if there is one.
pub(crate) fn remove_key(key: i32) -> Result<()> {
    let shmid = unsafe { libc::shmget(key, 0, 0o600) };
    if shmid == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            return Ok(());
        }
        return Err(Error::SharedMemory {
            op: "lookup",
            key,
            source: err,
        });
    }
    if unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        return Err(Error::shm("remove", key));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    static NEXT_KEY: AtomicI32 = AtomicI32::new(0);

    /// A key unlikely to collide with other test processes.
    pub(crate) fn unique_key() -> i32 {
        let pid = std::process::id() as i32 & 0x7fff;
        0x5300_0000 | (pid << 8) | (NEXT_KEY.fetch_add(1, Ordering::Relaxed) & 0xff)
    }

    #[test]
    fn local_arena_is_zeroed_and_writable() {
        let arena = LocalArena::new(4096).unwrap();
        assert_eq!(arena.size(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts_mut(arena.as_ptr().as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[4095] = 0xab;
        assert_eq!(bytes[4095], 0xab);
    }

    #[test]
    fn create_then_attach_sees_same_bytes() {
        let key = unique_key();
        let creator = SharedMemoryArena::create(key, 8192).unwrap();
        assert!(creator.is_creator());
        unsafe { *creator.as_ptr().as_ptr().add(100) = 42 };

        let attached = SharedMemoryArena::attach(key).unwrap();
        assert!(!attached.is_creator());
        assert!(attached.size() >= 8192);
        assert_eq!(unsafe { *attached.as_ptr().as_ptr().add(100) }, 42);
    }

    #[test]
    fn attach_missing_key_fails() {
        let key = unique_key();
        match SharedMemoryArena::attach(key) {
            Err(Error::SharedMemory { op, .. }) => assert_eq!(op, "lookup"),
            other => panic!("expected SharedMemory error, got {other:?}"),
        }
    }

    #[test]
    fn create_replaces_stale_segment() {
        let key = unique_key();
        let mut stale = SharedMemoryArena::create(key, 4096).unwrap();
        stale.set_remove_on_drop(false);
        unsafe { *stale.as_ptr().as_ptr() = 7 };
        drop(stale);

        let fresh = SharedMemoryArena::create(key, 4096).unwrap();
        assert_eq!(unsafe { *fresh.as_ptr().as_ptr() }, 0);
    }

    #[test]
    fn creator_drop_removes_segment() {
        let key = unique_key();
        drop(SharedMemoryArena::create(key, 4096).unwrap());
        assert!(SharedMemoryArena::attach(key).is_err());
    }

    #[test]
    fn attacher_never_removes() {
        let key = unique_key();
        let creator = SharedMemoryArena::create(key, 4096).unwrap();
        let mut attached = SharedMemoryArena::attach(key).unwrap();
        attached.set_remove_on_drop(true);
        drop(attached);
        assert!(SharedMemoryArena::attach(key).is_ok());
        drop(creator);
    }
}
