use std::fmt;
use std::io;

use crate::util::address::Address;

/// Failure to reserve the heap's address range.
#[derive(Debug)]
pub struct MmapError(io::Error);

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mmap failed: {}", self.0)
    }
}

impl std::error::Error for MmapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Reserves `size` bytes of zeroed, read-write memory aligned to `align`
/// (a power of two). The slack the alignment requires is returned to the OS.
pub fn reserve_aligned(size: usize, align: usize) -> Result<Address, MmapError> {
    debug_assert!(align.is_power_of_two());
    let request = size + align;
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            request,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(MmapError(io::Error::last_os_error()));
    }
    let base = Address::from_ptr(raw as *const u8);
    let aligned = base.align_up(align);
    let head = aligned - base;
    let tail = request - head - size;
    unsafe {
        if head > 0 {
            libc::munmap(base.to_mut_ptr(), head);
        }
        if tail > 0 {
            libc::munmap((aligned + size).to_mut_ptr(), tail);
        }
    }
    Ok(aligned)
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_aligned_and_zeroed() {
        let align = 1 << 20;
        let start = reserve_aligned(2 << 20, align).unwrap();
        assert!(start.is_aligned_to(align));
        assert_eq!(unsafe { start.load::<usize>() }, 0);
        assert_eq!(unsafe { (start + ((2 << 20) - 8usize)).load::<usize>() }, 0);
    }
}
