use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Attempts at re-reserving an aligned range before giving up.
#[cfg(not(miri))]
const ALIGN_RETRIES: usize = 8;

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MappingInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    #[cfg(miri)]
    align: usize,
}

impl MappingInner {
    /// Reserves and commits `len` bytes whose base is a multiple of `align`.
    ///
    /// Windows cannot partially release a reservation, so an oversized range
    /// is reserved to find an aligned address, released, and the aligned
    /// address is then requested directly. Another thread may grab the range
    /// in between, hence the retry loop.
    pub unsafe fn reserve_aligned(len: usize, align: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc, Layout};
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
                align,
            })
        }
        #[cfg(not(miri))]
        {
            let padded = len
                .checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

            for _ in 0..ALIGN_RETRIES {
                let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
                if probe.is_null() {
                    return Err(Error::last_os_error());
                }
                let aligned = (probe as usize + align - 1) & !(align - 1);
                unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

                let ptr = unsafe {
                    VirtualAlloc(
                        aligned as *const std::ffi::c_void,
                        len,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(Self { ptr, len });
                }
            }

            Err(Error::from(io::ErrorKind::AddrInUse))
        }
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
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let layout = Layout::from_size_align_unchecked(self.len, self.align);
                    dealloc(self.ptr.cast::<u8>(), layout);
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MappingInner {}
unsafe impl Sync for MappingInner {}
