#![allow(clippy::cast_possible_truncation)]

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

#[must_use]
pub const fn ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (type_ << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    ioc(IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Rounds `val` up to a multiple of `align`.  Returns `None` on overflow or a zero alignment.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return None;
    }
    val.checked_next_multiple_of(align)
}

#[must_use]
pub const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Least common multiple, used to satisfy a tiling alignment and a caller alignment at once.
#[must_use]
pub const fn lcm(a: u64, b: u64) -> Option<u64> {
    if a == 0 || b == 0 {
        return None;
    }
    (a / gcd(a, b)).checked_mul(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(1, 64), Some(64));
        assert_eq!(align_up(64, 64), Some(64));
        assert_eq!(align_up(100, 48), Some(144));
        assert_eq!(align_up(5, 0), None);
        assert_eq!(align_up(u64::MAX, 2), None);
    }

    #[test]
    fn lcm_of_mixed_alignments() {
        assert_eq!(lcm(128, 64), Some(128));
        assert_eq!(lcm(512, 48), Some(1536));
        assert_eq!(lcm(1, 7), Some(7));
        assert_eq!(lcm(0, 7), None);
    }

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        // DMA_BUF_IOCTL_SYNC = _IOW('b', 0, struct dma_buf_sync)
        assert_eq!(iow::<u64>(b'b' as u32, 0), 0x4008_6200);
        // DMA_HEAP_IOCTL_ALLOC = _IOWR('H', 0, struct dma_heap_allocation_data)
        assert_eq!(iowr::<[u64; 3]>(b'H' as u32, 0), 0xc018_4800);
    }
}
