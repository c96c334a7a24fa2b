//! Page-locked byte buffers for key material
//!
//! A [`SecureBytes`] is allocated in whole pages, locked against swap for
//! its lifetime and wiped before the pages are returned to the allocator.
//! The lock is best effort: `mlock` can fail under RLIMIT_MEMLOCK, and an
//! unlocked buffer is still usable. Higher layers keep private keys and
//! similar secrets in these; the keychain itself holds no secret state.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::slice;

use libc;
use zeroize::Zeroize;

pub struct SecureBytes {
    ptr:    *mut u8,
    len:    usize,
    layout: Layout,
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl SecureBytes {
    /// Allocate `len` zeroed bytes, rounded up to whole locked pages.
    pub fn new(len: usize) -> SecureBytes {
        let page = page_size();
        let capacity = ((len / page) + 1) * page;

        let layout = Layout::from_size_align(capacity, page)
            .expect("secure buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "secure buffer allocation failed");

        unsafe {
            let _ = libc::mlock(ptr as *const libc::c_void, capacity);
        }

        SecureBytes {
            ptr:    ptr,
            len:    len,
            layout: layout,
        }
    }

    /// Allocate and fill from `data`.
    pub fn from_slice(data: &[u8]) -> SecureBytes {
        let mut buffer = SecureBytes::new(data.len());
        buffer.as_mut_slice().copy_from_slice(data);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        unsafe {
            // wipe the whole allocation, not just the visible prefix
            slice::from_raw_parts_mut(self.ptr, self.layout.size()).zeroize();

            let _ = libc::munlock(self.ptr as *const libc::c_void, self.layout.size());
            dealloc(self.ptr, self.layout);
        }
    }
}

unsafe impl Send for SecureBytes {}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for SecureBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let buffer = SecureBytes::new(64);
        assert_eq!(buffer.len(), 64);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_slice_round_trip() {
        let secret = [0xA5u8; 48];
        let buffer = SecureBytes::from_slice(&secret);
        assert_eq!(&buffer[..], &secret[..]);
    }

    #[test]
    fn test_writable() {
        let mut buffer = SecureBytes::new(16);
        buffer[0] = 0xFF;
        buffer.as_mut_slice()[15] = 0x01;
        assert_eq!(buffer[0], 0xFF);
        assert_eq!(buffer[15], 0x01);
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = SecureBytes::new(0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_slice().len(), 0);
    }
}
