use std::ptr::NonNull;

use super::{CompileError, CompileResult, PageAllocator};
use super::trampoline::NativeCodeUnit;

// allocate blocks of 32k.
pub(crate) const MIN_ALLOC_SIZE: usize = 32 * 1024;
// alignment - instruction caching works better on aligned boundaries.
pub(crate) const ALLOC_ALIGNMENT_MASK: usize = 2048 - 1;

struct MmapPage {
    base: NonNull<u8>,
    size: usize,
    consumed: usize,
    remaining: usize,
}

/// Copies emitted instructions into executable memory. Pages are
/// sub-allocated strictly linearly; no reuse, no compaction.
pub struct MmapAllocator {
    pages: Vec<MmapPage>,
}

impl MmapAllocator {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }
}

impl Default for MmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn round_up(len: usize) -> usize {
    (len + ALLOC_ALIGNMENT_MASK) & !ALLOC_ALIGNMENT_MASK
}

fn map_exec_page(size: usize) -> CompileResult<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CompileError::Alloc(std::io::Error::last_os_error()));
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| {
        CompileError::Alloc(std::io::Error::other("mmap returned a null mapping"))
    })
}

impl PageAllocator for MmapAllocator {
    fn allocate_exec(&mut self, asm: &[u8]) -> CompileResult<NativeCodeUnit> {
        let rounded = round_up(asm.len());

        if let Some(page) = self.pages.last_mut() {
            if page.remaining > asm.len() {
                let dst = unsafe { page.base.as_ptr().add(page.consumed) };
                unsafe {
                    std::ptr::copy_nonoverlapping(asm.as_ptr(), dst, asm.len());
                }
                page.consumed += rounded;
                page.remaining = page.remaining.saturating_sub(rounded);
                // dst is derived from a successful mmap and therefore non-null.
                let entry = NonNull::new(dst).ok_or_else(|| {
                    CompileError::Alloc(std::io::Error::other("page cursor wrapped to null"))
                })?;
                return Ok(NativeCodeUnit::new(entry));
            }
        }

        let size = MIN_ALLOC_SIZE.max(rounded);
        let base = map_exec_page(size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(asm.as_ptr(), base.as_ptr(), asm.len());
        }
        self.pages.push(MmapPage {
            base,
            size,
            consumed: rounded,
            remaining: size - rounded,
        });
        Ok(NativeCodeUnit::new(base))
    }

    fn close(&mut self) -> CompileResult<()> {
        let mut first_error = None;
        for page in self.pages.drain(..) {
            let rc = unsafe { libc::munmap(page.base.as_ptr() as *mut libc::c_void, page.size) };
            if rc != 0 && first_error.is_none() {
                first_error = Some(CompileError::Alloc(std::io::Error::last_os_error()));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for MmapAllocator {
    fn drop(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to unmap executable pages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(unit: &NativeCodeUnit, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(unit.as_ptr(), len) }.to_vec()
    }

    #[test]
    fn sub_allocates_on_aligned_strides() {
        let mut a = MmapAllocator::new();

        let first = a.allocate_exec(&[1, 2, 3, 4]).unwrap();
        assert_eq!(read_back(&first, 4), vec![1, 2, 3, 4]);
        assert_eq!(a.pages.len(), 1);
        assert_eq!(a.pages[0].consumed, 2048);
        assert_eq!(a.pages[0].remaining, MIN_ALLOC_SIZE - 2048);

        let second = a.allocate_exec(&[5, 6, 7, 8, 9]).unwrap();
        assert_eq!(read_back(&second, 5), vec![5, 6, 7, 8, 9]);
        assert_eq!(a.pages.len(), 1);
        assert_eq!(a.pages[0].consumed, 2 * 2048);
        assert_eq!(a.pages[0].remaining, MIN_ALLOC_SIZE - 2 * 2048);

        // Both copies stay valid after further allocation.
        assert_eq!(read_back(&first, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn consumes_remainder_of_page_exactly() {
        let mut a = MmapAllocator::new();
        a.allocate_exec(&[0xC3]).unwrap();

        let mut rest = vec![0u8; MIN_ALLOC_SIZE - 2048 - 2];
        rest[0] = 31;
        let unit = a.allocate_exec(&rest).unwrap();
        assert_eq!(read_back(&unit, 2), vec![31, 0]);
        assert_eq!(a.pages.len(), 1);
        assert_eq!(a.pages[0].consumed, MIN_ALLOC_SIZE);
        assert_eq!(a.pages[0].remaining, 0);
    }

    #[test]
    fn rolls_over_to_a_fresh_page_when_exhausted() {
        let mut a = MmapAllocator::new();
        let mut big = vec![0u8; MIN_ALLOC_SIZE - 2];
        big[0] = 7;
        let first = a.allocate_exec(&big).unwrap();
        assert_eq!(a.pages.len(), 1);
        assert_eq!(a.pages[0].remaining, 0);

        let second = a.allocate_exec(&[8, 9]).unwrap();
        assert_eq!(a.pages.len(), 2);
        assert_eq!(a.pages[1].consumed, 2048);
        assert_eq!(a.pages[1].remaining, MIN_ALLOC_SIZE - 2048);

        // Rollover must not invalidate earlier units.
        assert_eq!(read_back(&first, 1), vec![7]);
        assert_eq!(read_back(&second, 2), vec![8, 9]);
    }

    #[test]
    fn oversized_allocations_get_their_own_page() {
        let mut a = MmapAllocator::new();
        let mut huge = vec![0u8; 36 * 1024];
        huge[1] = 5;
        let unit = a.allocate_exec(&huge).unwrap();
        assert_eq!(read_back(&unit, 2), vec![0, 5]);
        assert_eq!(a.pages.len(), 1);
        // 36 KiB is already stride-aligned, so the page is exactly that big.
        assert_eq!(a.pages[0].size, 36 * 1024);
        assert_eq!(a.pages[0].consumed, 36 * 1024);
        assert_eq!(a.pages[0].remaining, 0);
    }

    #[test]
    fn close_releases_every_page() {
        let mut a = MmapAllocator::new();
        a.allocate_exec(&[1]).unwrap();
        a.allocate_exec(&vec![2u8; MIN_ALLOC_SIZE]).unwrap();
        assert_eq!(a.pages.len(), 2);
        a.close().unwrap();
        assert!(a.pages.is_empty());
    }
}
