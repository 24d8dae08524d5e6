//! Cross-process binary lock.
//!
//! A process-shared POSIX semaphore placed in an anonymous `MAP_SHARED`
//! mapping. It must be created before forking; every child then sees the
//! same semaphore. Only the creating process tears it down.

use std::io;
use std::mem;
use std::ptr::{self, NonNull};

pub struct SharedLock {
    sem: NonNull<libc::sem_t>,
    owner: libc::pid_t,
}

// SAFETY: the semaphore is process-shared and its operations are thread-safe.
unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

impl SharedLock {
    pub fn new() -> io::Result<Self> {
        let len = mem::size_of::<libc::sem_t>();

        // SAFETY: anonymous mapping with no address hint; result is checked.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let sem = addr.cast::<libc::sem_t>();
        // SAFETY: `sem` points at `len` writable bytes we just mapped.
        if unsafe { libc::sem_init(sem, 1, 1) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping the region mapped above.
            unsafe { libc::munmap(addr, len) };
            return Err(err);
        }

        let sem = NonNull::new(sem)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Self {
            sem,
            // SAFETY: getpid has no preconditions.
            owner: unsafe { libc::getpid() },
        })
    }

    /// Block until the lock is held by this process.
    pub fn lock(&self) -> io::Result<SharedLockGuard<'_>> {
        loop {
            // SAFETY: `sem` was initialized in `new` and stays mapped for `self`'s lifetime.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(SharedLockGuard { lock: self });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        // Forked children hold a copy of this handle; only the creator may
        // destroy the semaphore the others are still using.
        // SAFETY: getpid has no preconditions.
        if unsafe { libc::getpid() } != self.owner {
            return;
        }
        // SAFETY: initialized in `new`, no guard can outlive `self`.
        unsafe {
            libc::sem_destroy(self.sem.as_ptr());
            libc::munmap(self.sem.as_ptr().cast(), mem::size_of::<libc::sem_t>());
        }
    }
}

/// Holds the shared lock until dropped.
pub struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard was produced by a successful sem_wait on the same semaphore.
        unsafe { libc::sem_post(self.lock.sem.as_ptr()) };
    }
}
