use std::{
    alloc::{self, Layout},
    fmt, ops,
    ptr::NonNull,
};

use crate::buf::{IoBuf, IoBufMut};

/// A heap buffer whose start address is aligned to a caller-chosen power of two.
///
/// Direct I/O (`O_DIRECT`) requires the buffer address, the file offset and the
/// transfer length to be multiples of the device's sector size. A `Vec<u8>` only
/// guarantees the alignment of `u8`, so readers and writers of unbuffered files
/// should use this type instead.
///
/// Like `Vec`, the buffer tracks how many bytes are initialized (`len`) separately
/// from its allocation size (`capacity`). Reads fill up to `capacity`; writes
/// transfer `len` bytes.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: `AlignedBuf` uniquely owns its allocation, like `Vec<u8>`.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared references only hand out `&[u8]`.
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate an empty buffer that can hold `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or if `capacity` rounded up to
    /// `align` overflows `isize`.
    pub fn with_capacity(capacity: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(capacity, align)
            .expect("alignment must be a power of two and capacity must fit isize");
        let ptr = if capacity == 0 {
            // A dangling but well-aligned pointer, like `Vec` uses for zero-sized allocations.
            NonNull::new(align as *mut u8).expect("alignment is non-zero")
        } else {
            // SAFETY: the layout has non-zero size.
            let raw = unsafe { alloc::alloc(layout) };
            NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout))
        };
        AlignedBuf {
            ptr,
            len: 0,
            layout,
        }
    }

    /// Allocate a buffer of `len` zero bytes, all of them initialized.
    pub fn zeroed(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align)
            .expect("alignment must be a power of two and length must fit isize");
        if len == 0 {
            return Self::with_capacity(0, align);
        }
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        AlignedBuf { ptr, len, layout }
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8], align: usize) -> Self {
        let mut buf = Self::with_capacity(data.len(), align);
        buf.extend_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Forget the contents without releasing the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append `data` after the initialized bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not fit into the remaining capacity.
    /// The buffer never reallocates, since that would break its alignment contract
    /// for any caller that cached the pointer.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let new_len = self
            .len
            .checked_add(data.len())
            .filter(|n| *n <= self.capacity())
            .expect("AlignedBuf never grows: data exceeds remaining capacity");
        // SAFETY: `new_len <= capacity`, so the destination range lies within our allocation,
        // and `data` cannot overlap memory we uniquely own.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                data.len(),
            );
        }
        self.len = new_len;
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: allocated in the constructor with exactly this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl ops::Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        super::deref(self)
    }
}

impl ops::DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        super::deref_mut(self)
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("alignment", &self.alignment())
            .finish()
    }
}

unsafe impl IoBuf for AlignedBuf {
    fn stable_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn bytes_init(&self) -> usize {
        self.len
    }

    fn bytes_total(&self) -> usize {
        self.capacity()
    }
}

unsafe impl IoBufMut for AlignedBuf {
    fn stable_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    unsafe fn set_init(&mut self, pos: usize) {
        if self.len < pos {
            self.len = pos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AlignedBuf;
    use crate::buf::{IoBuf, IoBufMut};

    #[test]
    fn start_address_honours_alignment() {
        for align in [512, 4096] {
            let buf = AlignedBuf::with_capacity(8192, align);
            assert_eq!(buf.stable_ptr() as usize % align, 0);
            assert_eq!(buf.bytes_total(), 8192);
            assert_eq!(buf.bytes_init(), 0);
        }
    }

    #[test]
    fn zeroed_is_fully_initialized() {
        let buf = AlignedBuf::zeroed(4096, 512);
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn set_init_only_moves_forward() {
        let mut buf = AlignedBuf::from_slice(&[7u8; 100], 512);
        unsafe { buf.set_init(50) };
        assert_eq!(buf.len(), 100);
        buf.clear();
        unsafe { buf.set_init(50) };
        assert_eq!(buf.len(), 50);
    }

    #[test]
    fn zero_capacity_does_not_allocate() {
        let buf = AlignedBuf::with_capacity(0, 512);
        assert!(buf.is_empty());
        assert_eq!(buf.stable_ptr() as usize % 512, 0);
        assert_eq!(&buf[..], &[] as &[u8]);
    }

    #[test]
    #[should_panic(expected = "never grows")]
    fn extend_beyond_capacity_panics() {
        let mut buf = AlignedBuf::with_capacity(512, 512);
        buf.extend_from_slice(&[0u8; 513]);
    }
}
