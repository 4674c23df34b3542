// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX backing store for page segments and process liveness probes.
// Named segments live in /dev/shm (shm_open + mmap) so producer processes can
// attach them; anonymous segments are MAP_SHARED|MAP_ANONYMOUS and are only
// visible to this process and its forked children.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

/// Named segments carry a trailing `AtomicI32` attach counter so the last
/// process to unmap also unlinks the backing object.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn attach_counter(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// Open mode for named segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    user_size: usize,
    /// POSIX name (with leading '/'); `None` for anonymous mappings.
    name: Option<String>,
}

// Safety: the mapping is shared memory; callers coordinate access to its bytes.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Map a named segment of `user_size` usable bytes.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let perms: libc::mode_t = 0o600;
        let total_size = calc_size(user_size);

        let open = |flags: libc::c_int| -> io::Result<libc::c_int> {
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, perms as libc::c_uint) };
            if fd == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        };

        // Only the creator sizes the object; truncating an existing one can
        // clobber pages another process is still reading.
        let (fd, created) = match mode {
            ShmMode::Create => (open(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL)?, true),
            ShmMode::Open => (open(libc::O_RDWR)?, false),
            ShmMode::CreateOrOpen => match open(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (open(libc::O_RDWR)?, false),
                Err(e) => return Err(e),
            },
        };

        if created {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mem = map_shared(fd, total_size);
        unsafe { libc::close(fd) };
        let mem = mem?;

        unsafe { attach_counter(mem, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem,
            size: total_size,
            user_size,
            name: Some(posix_name),
        })
    }

    /// Map an anonymous shared region of `user_size` bytes.
    pub fn anonymous(user_size: usize) -> io::Result<Self> {
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }
        let mem = map_shared(-1, user_size)?;
        Ok(Self {
            mem,
            size: user_size,
            user_size,
            name: None,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of live attachments; anonymous mappings always report 1.
    pub fn attach_count(&self) -> i32 {
        match self.name {
            Some(_) => unsafe { attach_counter(self.mem, self.size).load(Ordering::Acquire) },
            None => 1,
        }
    }

    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

fn map_shared(fd: libc::c_int, len: usize) -> io::Result<*mut u8> {
    let flags = if fd == -1 {
        libc::MAP_SHARED | libc::MAP_ANONYMOUS
    } else {
        libc::MAP_SHARED
    };
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let last = match self.name {
            Some(_) => unsafe { attach_counter(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) <= 1 },
            None => false,
        };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if last {
            if let Some(name) = &self.name {
                if let Ok(c_name) = CString::new(name.as_bytes()) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process probes
// ---------------------------------------------------------------------------

/// Send the null signal to `pid`. Only `ESRCH` counts as dead; `EPERM` means
/// the process exists but belongs to someone else.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

pub fn current_pid() -> i32 {
    unsafe { libc::getpid() }
}
