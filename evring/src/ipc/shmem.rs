//! POSIX shared memory mappings for pages and event tables.
//!
//! Two processes share a [`SharedPage`] (and each other's [`EventTable`])
//! by mapping the same POSIX shared memory object. [`Shm<T, Mode>`] is the
//! smart pointer to such a mapping; it derefs to `T`, so every ring and
//! event API that takes "a handle to the page" accepts it directly.
//!
//! # Overview
//!
//! - [`Shm<T, Mode>`] - Smart pointer to shared memory with typestate-based cleanup
//! - [`ShmPath`] - Validated POSIX shared memory object name
//! - [`SharedMemorySafe`] - Trait marking types safe for cross-process sharing
//! - [`Creator`] - Typestate marker: creates the object, unlinks on drop
//! - [`Opener`] - Typestate marker: opens an existing object, no unlink on drop
//!
//! # Basic Usage
//!
//! ```no_run
//! use evring::ipc::shmem::{Creator, Opener, Shm, ShmPath};
//! use evring::page::{Direction, SharedPage};
//! use evring::ring::{Reader, Writer};
//!
//! let path = ShmPath::new("/my-console")?;
//!
//! // Front process: create the page and write into the out ring.
//! let page = Shm::<SharedPage, Creator>::create(&path)?;
//! let writer = Writer::new(page, Direction::Out);
//!
//! // Back process: open the same page and read it.
//! let page = Shm::<SharedPage, Opener>::open(&path)?;
//! let reader = Reader::new(page, Direction::Out);
//! # Ok::<(), evring::ipc::shmem::ShmError>(())
//! ```
//!
//! # Initial contents
//!
//! `ftruncate` zero-fills a new object and [`Shm::create`] writes nothing
//! after that: all-zero bytes are a valid value of every
//! [`SharedMemorySafe`] type, and the empty state of pages and event
//! tables. An opener may map the object the moment it has its final size,
//! and whatever it does from then on (binding a port, producing into a
//! ring) is never overwritten by the creator. A
//! [`SlotRing`](crate::ring::SlotRing) is set up by its front end instead.
//!
//! # Implementing SharedMemorySafe
//!
//! The trait is implemented for fixed-width primitives, their atomics, and
//! arrays of those. For custom types, use `#[derive(SharedMemorySafe)]`:
//!
//! ```
//! use evring::SharedMemorySafe;
//! use std::sync::atomic::AtomicU32;
//!
//! #[derive(SharedMemorySafe)]
//! #[repr(C)]
//! struct Doorbell {
//!     rung: AtomicU32,
//!     count: AtomicU32,
//! }
//! ```
//!
//! The derive macro checks at compile time:
//! - `#[repr(C)]` or `#[repr(transparent)]` is present
//! - No pointer types (Vec, Box, String, &, *, etc.)
//! - No pointer-width integers, whose size can differ between the parties
//! - All fields implement `SharedMemorySafe`
//!
//! # Cleanup and Crash Handling
//!
//! - **[`Creator`]**: Unmaps memory AND unlinks the name on drop
//! - **[`Opener`]**: Only unmaps (name persists for other processes)
//!
//! A crashed creator leaves its name behind; remove it before re-creating:
//!
//! ```no_run
//! # use rustix::shm;
//! let _ = shm::unlink("/my-console");
//! ```
//!
//! [`SharedPage`]: crate::page::SharedPage
//! [`EventTable`]: crate::event::EventTable

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use crate::trace::debug;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`] and [`ShmPath`].
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing shared memory object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// The errno behind a failed POSIX call, if any.
    pub const fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::PosixError { source, .. } => Some(*source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// For portable use, POSIX requires:
/// - Must start with '/'
/// - Must not contain additional slashes after the first
/// - Must not exceed NAME_MAX (255 characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if `path` breaks one of the rules above.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            "path must start with '/'"
        } else if path[1..].contains('/') {
            "path must not contain additional '/' characters"
        } else if path.len() > POSIX_NAME_MAX {
            "path length must be <= 255 bytes"
        } else if path.len() == 1 {
            "path must name an object after the '/'"
        } else {
            return Ok(Self(path));
        };
        Err(ShmError::InvalidPath { path, reason })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trait defining cleanup behavior for shared memory modes.
///
/// `Shm<T, Creator>` and `Shm<T, Opener>` are different types with
/// different `Drop` behavior, enforced at compile-time:
///
/// ```text
/// Creator          Opener
///    ↓                ↓
/// munmap()        munmap()
/// unlink()        (no unlink)
/// ```
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the party that creates the shared memory object.
///
/// On drop the mapping is removed and the name is unlinked.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for the party that opens an existing object.
///
/// On drop only the mapping is removed; the name is left for the
/// [`Creator`] to clean up.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to use in POSIX shared memory across processes.
///
/// # Provided Implementations
///
/// - **Primitives**: `i8`-`i128`, `u8`-`u128`, `f32`, `f64`, `bool`
/// - **Atomics**: `AtomicBool`, `AtomicI8`-`AtomicI64`, `AtomicU8`-`AtomicU64`
/// - **Arrays**: `[T; N]` where `T: SharedMemorySafe`
///
/// `usize`, `isize` and their atomics are deliberately missing: the two
/// parties of a page need not agree on pointer width.
///
/// # Safety
///
/// Implementers must guarantee **all** of the following properties:
///
/// | Property | Requirement | Rationale |
/// |----------|-------------|-----------|
/// | **Initialization** | All-zero bytes are a valid, empty value | `create()` only zero-fills |
/// | **Layout** | `#[repr(C)]` or `#[repr(transparent)]` | The parties may be compiled separately |
/// | **Pointers** | No heap/stack pointers or references | Virtual addresses don't transfer across process boundaries |
/// | **Fields** | All fields are `SharedMemorySafe` | Safety constraints apply recursively to nested types |
/// | **Drop** | Safe if `Drop` never runs | Process crashes (SIGKILL) bypass destructors |
/// | **Concurrency** | `Send + Sync` | Both parties access the memory simultaneously |
///
/// # Compile-Time Safety
///
/// Types that aren't `Send + Sync` cannot implement the trait:
///
/// ```compile_fail
/// # use evring::ipc::shmem::SharedMemorySafe;
/// use std::rc::Rc;
/// struct NotSync { data: Rc<u32> }
/// unsafe impl SharedMemorySafe for NotSync {}
/// ```
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128,
    u8, u16, u32, u64, u128,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Smart pointer to a POSIX shared memory mapping holding one `T`.
///
/// Derefs to `T`; unmaps (and, for [`Creator`], unlinks) on drop.
///
/// # Safety Invariants
///
/// - **Allocated**: `ptr` points to `size_of::<T>()` bytes allocated via `mmap()`
/// - **Mapped**: Memory remains mapped for the lifetime of `Shm<T>`
/// - **Aligned**: `ptr` is page aligned, which satisfies any `T`
/// - **Valid**: `T` is [`SharedMemorySafe`], ensuring correct layout and access patterns
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync, and the pointer targets a
// shared mapping rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: T: SharedMemorySafe requires Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

/// Map `size_of::<T>()` bytes of `fd` read-write and shared.
fn map<T>(fd: &rustix::fd::OwnedFd, path: &ShmPath) -> Result<NonNull<T>> {
    // SAFETY: a fresh mapping of a valid shared memory fd, sized for T by the
    // caller, that does not alias any existing Rust object. mmap returns
    // page-aligned addresses, satisfying T's alignment.
    let ptr = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<T>()).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::NOMEM))
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Create a new, zero-filled shared memory object and map it.
    ///
    /// # Errors
    ///
    /// - Object already exists at `path` (`EEXIST`)
    /// - Insufficient permissions (`EACCES`)
    /// - Out of memory or system limits (`ENOMEM`, `EMFILE`, `ENFILE`)
    pub fn create(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let mapped = ftruncate(&fd, size_of::<T>() as u64)
            .map_err(|err| ShmError::posix("ftruncate", path, err))
            .and_then(|()| map::<T>(&fd, path));
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(err);
            }
        };

        debug!(%path, size = size_of::<T>(), "shared memory created");
        Ok(Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Open an existing shared memory object and map it.
    ///
    /// # Errors
    ///
    /// - Object doesn't exist (`ENOENT`)
    /// - Insufficient permissions (`EACCES`)
    /// - Object size differs from `size_of::<T>()` ([`ShmError::SizeMismatch`])
    pub fn open(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map::<T>(&fd, path)?;
        debug!(%path, "shared memory opened");
        Ok(Self {
            ptr,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    #[inline]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> fmt::Debug for Shm<T, Mode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shm")
            .field("path", &self.path)
            .field("size", &size_of::<T>())
            .field("unlink_on_drop", &Mode::SHOULD_UNLINK)
            .finish()
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr came from mmap of exactly size_of::<T>() bytes and no
        // reference into the mapping outlives `self`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping is valid and initialized for the lifetime of
        // Shm, and T: SharedMemorySafe makes shared access sound.
        unsafe { self.ptr.as_ref() }
    }
}
