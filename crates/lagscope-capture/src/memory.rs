use crate::platform;

/// Copies `dst.len()` bytes starting at address `src` into `dst`.
///
/// The read goes through the kernel, so an unmapped or protected source
/// address makes the copy come up short instead of faulting the caller.
/// Returns the number of bytes copied; anything less than `dst.len()` should
/// be treated as a failed read.
pub fn copy_safely(src: usize, dst: &mut [u8]) -> usize {
    if src == 0 {
        return 0;
    }
    platform::copy_memory(src, dst)
}

/// Reads one `usize` from `address`, or `None` if it is not readable.
pub fn read_word(address: usize) -> Option<usize> {
    let mut bytes = [0u8; size_of::<usize>()];
    (copy_safely(address, &mut bytes) == bytes.len()).then(|| usize::from_ne_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn copies_readable_memory() {
        let source: Vec<u8> = (0..64).collect();
        let mut dst = [0u8; 64];
        assert_eq!(copy_safely(source.as_ptr() as usize, &mut dst), 64);
        assert_eq!(&dst[..], &source[..]);

        let word = 0x0123_4567_usize;
        assert_eq!(read_word(&word as *const usize as usize), Some(word));
    }

    #[test]
    fn null_and_unmapped_addresses_copy_nothing() {
        let mut dst = [0u8; 16];
        assert_eq!(copy_safely(0, &mut dst), 0);
        assert_eq!(copy_safely(16, &mut dst), 0);
        assert_eq!(read_word(0), None);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn freed_allocation_after_unmap_is_not_a_fault() {
        // A page we map and then unmap is guaranteed to be gone.
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        assert_eq!(unsafe { libc::munmap(page, 4096) }, 0);

        let mut dst = [0u8; 16];
        assert!(copy_safely(page as usize, &mut dst) < dst.len());
    }
}
