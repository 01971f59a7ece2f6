use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MappingInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappingInner {
    /// Maps `len` bytes of anonymous memory whose base is a multiple of `align`.
    ///
    /// `mmap` only guarantees page alignment, so the request is padded by
    /// `align` bytes and the unaligned head and the surplus tail are unmapped
    /// again.
    ///
    /// # Safety
    ///
    /// `len` and `align` must be non-zero multiples of the page size and
    /// `align` must be a power of two.
    pub unsafe fn reserve_aligned(len: usize, align: usize) -> io::Result<Self> {
        let padded = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                padded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let start = raw as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = padded - head - len;

        // SAFETY: both trimmed ranges lie inside the mapping created above and
        // are page aligned because `start`, `aligned` and `len` are.
        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappingInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MappingInner {}
unsafe impl Sync for MappingInner {}
