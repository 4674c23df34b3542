// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Backing store for one page segment.
// Delegates to platform::PlatformShm.

use std::io;

use crate::config::Backing;
use crate::platform::PlatformShm;

pub use crate::platform::posix::ShmMode as ShmOpenMode;

/// A mapped shared-memory region holding the bytes of one segment.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Map a named region of `size` usable bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, size, mode)?;
        Ok(Self { inner })
    }

    /// Map an anonymous shared region of `size` bytes.
    pub fn anonymous(size: usize) -> io::Result<Self> {
        let inner = PlatformShm::anonymous(size)?;
        Ok(Self { inner })
    }

    /// Map the backing store for segment `index` of broker `broker_name`.
    ///
    /// Named backings are created exclusively: a stale object left behind
    /// by a crashed broker is unlinked and recreated rather than reused.
    pub fn for_segment(
        backing: &Backing,
        broker_name: &str,
        index: usize,
        size: usize,
    ) -> io::Result<Self> {
        match backing {
            Backing::Anonymous => Self::anonymous(size),
            Backing::Named { prefix } => {
                let name = crate::shm_name::segment_name(prefix, broker_name, index);
                match Self::acquire(&name, size, ShmOpenMode::Create) {
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        PlatformShm::unlink_by_name(&name);
                        Self::acquire(&name, size, ShmOpenMode::Create)
                    }
                    other => other,
                }
            }
        }
    }

    /// Base of the usable region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.inner.user_size()
    }

    /// Platform name, if the region is named.
    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    /// Number of processes/handles attached to a named region.
    pub fn attach_count(&self) -> i32 {
        self.inner.attach_count()
    }

    /// Remove a named region's backing object without an open handle.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}

impl std::fmt::Debug for ShmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmHandle")
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}
