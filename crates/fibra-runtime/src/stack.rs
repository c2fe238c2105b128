//! Fiber stacks
//!
//! Each stack is its own anonymous mapping with a `PROT_NONE` guard page at
//! the low end, so an overflow faults instead of scribbling over a
//! neighbour. Pages are reserved lazily by the kernel (`MAP_NORESERVE`), so a
//! large configured stack only costs what the fiber actually touches.

use fibra_core::constants::GUARD_SIZE;
use fibra_core::MemoryError;
use nix::errno::Errno;

pub struct Stack {
    /// Lowest mapped address (start of the guard page)
    base: *mut u8,
    /// Total mapping length including the guard
    len: usize,
    guard: usize,
}

// Safety: a Stack is plain memory owned by exactly one entity
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const MAP_FLAGS: libc::c_int =
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK;
    } else {
        const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        GUARD_SIZE
    } else {
        sz as usize
    }
}

impl Stack {
    /// Map a stack with at least `usable` bytes above the guard page.
    pub fn new(usable: usize) -> Result<Self, MemoryError> {
        let page = page_size();
        let guard = GUARD_SIZE.max(page);
        let usable = usable
            .checked_add(page - 1)
            .map(|n| n & !(page - 1))
            .ok_or(MemoryError::BadSize)?;
        if usable == 0 {
            return Err(MemoryError::BadSize);
        }
        let len = usable.checked_add(guard).ok_or(MemoryError::BadSize)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed(Errno::last() as i32));
        }

        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let errno = Errno::last() as i32;
            unsafe {
                libc::munmap(base, len);
            }
            return Err(MemoryError::GuardFailed(errno));
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            guard,
        })
    }

    /// One past the highest usable byte. Stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Lowest usable byte, just above the guard page.
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        if ret != 0 {
            fibra_core::kwarn!("munmap of fiber stack failed (errno {})", Errno::last() as i32);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let stack = Stack::new(20_000).unwrap();
        let page = page_size();
        assert_eq!(stack.usable_size() % page, 0);
        assert!(stack.usable_size() >= 20_000);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.usable_size());
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        unsafe {
            stack.bottom().write(0xAB);
            stack.top().sub(1).write(0xCD);
            assert_eq!(stack.bottom().read(), 0xAB);
            assert_eq!(stack.top().sub(1).read(), 0xCD);
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert_eq!(Stack::new(0).unwrap_err(), MemoryError::BadSize);
        assert_eq!(Stack::new(usize::MAX).unwrap_err(), MemoryError::BadSize);
    }
}
