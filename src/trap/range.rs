//! Register range table and the protected reservations backing it.
//!
//! The fault handler resolves every faulting address here, so the table is a
//! fixed-capacity array that is searched without allocating. Ranges are few
//! (at most [`MAX_RANGES`]) and linear search is fine.

use core::ptr;

use arrayvec::ArrayVec;
use axerrno::{AxError, AxResult, ax_err};
use memory_addr::{PAGE_SIZE_4K, VirtAddr, VirtAddrRange, align_down_4k, align_up_4k};
use spin::RwLock;

use crate::protocol::{ModuleName, module_name};
use crate::signal::IrqGuard;

/// Maximum number of register ranges.
pub const MAX_RANGES: usize = 32;

/// An inaccessible anonymous mapping covering whole pages.
///
/// Unmapped on drop.
#[derive(Debug)]
pub struct Reservation {
    base: usize,
    len: usize,
}

impl Reservation {
    /// Maps `[start, end)` rounded out to 4K pages as `PROT_NONE` at exactly
    /// that address. Fails with `AddrInUse` if anything is mapped there.
    pub fn map(start: usize, end: usize) -> AxResult<Self> {
        let base = align_down_4k(start);
        let len = align_up_4k(end) - base;
        // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping, so
        // this cannot clobber memory owned by anyone else.
        let addr = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error();
            return if errno == Some(libc::EEXIST) {
                ax_err!(AddrInUse, "register range overlaps an existing mapping")
            } else {
                ax_err!(BadAddress, "cannot reserve register range")
            };
        }
        if addr as usize != base {
            // Kernels without MAP_FIXED_NOREPLACE treat it as a hint.
            // SAFETY: `addr` is the mapping just created.
            unsafe { libc::munmap(addr, len) };
            return ax_err!(AddrInUse, "kernel placed the reservation elsewhere");
        }
        Ok(Self { base, len })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE_4K
    }

    fn covers(&self, page: usize) -> bool {
        (self.base..self.base + self.len).contains(&page)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by this value and unmapped only here.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

/// A resolved register range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHit {
    pub module: ModuleName,
    pub range: VirtAddrRange,
}

impl RangeHit {
    pub fn start(&self) -> usize {
        self.range.start.as_usize()
    }

    pub fn end(&self) -> usize {
        self.range.end.as_usize()
    }
}

struct RegisterRange {
    hit: RangeHit,
    reserved: bool,
    /// Pages mapped for this range. Pages already mapped for a neighbour
    /// sharing them are not mapped again.
    reservation: Option<Reservation>,
}

/// Half-open, non-overlapping address ranges owned by modules.
pub struct RangeTable {
    ranges: RwLock<ArrayVec<RegisterRange, MAX_RANGES>>,
}

impl RangeTable {
    pub const fn new() -> Self {
        Self {
            ranges: RwLock::new(ArrayVec::new_const()),
        }
    }

    fn insert(&self, start: usize, end: usize, module: &str, reserve: bool) -> AxResult<RangeHit> {
        if start >= end {
            return ax_err!(InvalidInput, "register range is empty");
        }
        let hit = RangeHit {
            module: module_name(module)?,
            range: VirtAddrRange::new(VirtAddr::from_usize(start), VirtAddr::from_usize(end)),
        };

        let _irq = IrqGuard::new();
        let mut ranges = self.ranges.write();
        if ranges.iter().any(|r| r.hit.range.overlaps(hit.range)) {
            return ax_err!(AlreadyExists, "register range overlaps an existing one");
        }
        if ranges.is_full() {
            return ax_err!(NoMemory, "register range table is full");
        }
        let reservation = if reserve {
            Self::map_uncovered(&ranges, start, end)?
        } else {
            None
        };
        ranges.push(RegisterRange {
            hit,
            reserved: reserve,
            reservation,
        });
        Ok(hit)
    }

    /// Maps the pages of `[start, end)` not yet mapped for another range.
    ///
    /// Ranges never overlap, so only the first and the last page can be
    /// shared with a neighbour.
    fn map_uncovered(
        ranges: &[RegisterRange],
        start: usize,
        end: usize,
    ) -> AxResult<Option<Reservation>> {
        let covered = |page: usize| {
            ranges
                .iter()
                .filter_map(|r| r.reservation.as_ref())
                .any(|m| m.covers(page))
        };
        let mut base = align_down_4k(start);
        let mut top = align_up_4k(end);
        if covered(base) {
            base += PAGE_SIZE_4K;
        }
        if top > base && covered(top - PAGE_SIZE_4K) {
            top -= PAGE_SIZE_4K;
        }
        if base >= top {
            return Ok(None);
        }
        Reservation::map(base, top).map(Some)
    }

    /// Reserves `[start, end)` as an inaccessible mapping and records it.
    ///
    /// The mapping is rounded out to 4K pages. A page already reserved for
    /// another range of this table is shared, so sub-page ranges may sit next
    /// to each other; pages mapped by anything else fail with `AddrInUse`.
    pub fn reserve(&self, start: usize, end: usize, module: &str) -> AxResult<RangeHit> {
        self.insert(start, end, module, true)
    }

    /// Records `[start, end)` without creating a mapping.
    pub fn record(&self, start: usize, end: usize, module: &str) -> AxResult<RangeHit> {
        self.insert(start, end, module, false)
    }

    /// Finds the range containing `addr`. Async-signal-safe.
    pub fn resolve(&self, addr: usize) -> Option<RangeHit> {
        let addr = VirtAddr::from_usize(addr);
        self.ranges
            .read()
            .iter()
            .find(|r| r.hit.range.contains(addr))
            .map(|r| r.hit)
    }

    pub fn ranges(&self) -> ArrayVec<RangeHit, MAX_RANGES> {
        self.ranges.read().iter().map(|r| r.hit).collect()
    }

    /// Whether the range containing `addr` has a live reservation.
    pub fn is_reserved(&self, addr: usize) -> bool {
        let addr = VirtAddr::from_usize(addr);
        self.ranges
            .read()
            .iter()
            .any(|r| r.hit.range.contains(addr) && r.reserved)
    }

    /// Drops every range and unmaps the reservations. Returns how many
    /// mappings were removed.
    pub fn release(&self) -> usize {
        let released: ArrayVec<RegisterRange, MAX_RANGES> = {
            let _irq = IrqGuard::new();
            self.ranges.write().drain(..).collect()
        };
        let unmapped = released.iter().filter(|r| r.reservation.is_some()).count();
        drop(released);
        unmapped
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }
}

impl Default for RangeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads `len` bytes at `addr`.
///
/// # Safety
///
/// `[addr, addr + len)` must be readable.
pub(crate) unsafe fn code_at<'a>(addr: usize, len: usize) -> &'a [u8] {
    unsafe { core::slice::from_raw_parts(ptr::with_exposed_provenance(addr), len) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_half_open_bounds() {
        let table = RangeTable::new();
        table.record(0x1000, 0x1050, "uart").unwrap();
        assert_eq!(table.resolve(0x1000).unwrap().module.as_str(), "uart");
        assert!(table.resolve(0x104f).is_some());
        assert!(table.resolve(0x1050).is_none());
        assert!(table.resolve(0xfff).is_none());
    }

    #[test]
    fn test_adjacent_ranges_resolve_separately() {
        let table = RangeTable::new();
        table.record(0x1000, 0x2000, "uart0").unwrap();
        table.record(0x2000, 0x3000, "dma0").unwrap();
        assert_eq!(table.resolve(0x1fff).unwrap().module.as_str(), "uart0");
        assert_eq!(table.resolve(0x2000).unwrap().module.as_str(), "dma0");
    }

    #[test]
    fn test_overlap_and_empty_rejected() {
        let table = RangeTable::new();
        table.record(0x1000, 0x2000, "uart").unwrap();
        assert_eq!(
            table.record(0x1800, 0x2800, "dma").unwrap_err(),
            AxError::AlreadyExists
        );
        assert_eq!(
            table.record(0x3000, 0x3000, "dma").unwrap_err(),
            AxError::InvalidInput
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let table = RangeTable::new();
        for i in 0..MAX_RANGES {
            table.record(i * 0x100, i * 0x100 + 0x80, "m").unwrap();
        }
        assert_eq!(
            table.record(0x10_0000, 0x10_0100, "m").unwrap_err(),
            AxError::NoMemory
        );
    }

    #[test]
    fn test_reserve_faults_and_releases() {
        let table = RangeTable::new();
        let start = 0x2fff_7000_0000usize;
        let hit = table.reserve(start, start + 0x50, "uart").unwrap();
        assert_eq!(hit.end(), start + 0x50);
        assert!(table.is_reserved(start + 0x10));
        // The same pages cannot be reserved twice.
        assert!(Reservation::map(start, start + 0x10).is_err());
        assert_eq!(table.release(), 1);
        assert!(table.is_empty());
        let again = Reservation::map(start, start + 0x10).unwrap();
        assert_eq!(again.pages(), 1);
    }

    #[test]
    fn test_sub_page_neighbours_share_a_page() {
        let table = RangeTable::new();
        let start = 0x2fff_7100_0000usize;
        table.reserve(start, start + 0x40, "uart0").unwrap();
        table.reserve(start + 0x80, start + 0x1080, "uart1").unwrap();
        table.reserve(start + 0x1100, start + 0x1140, "uart2").unwrap();
        assert!(table.is_reserved(start + 0x90));
        assert!(table.is_reserved(start + 0x1010));
        assert!(table.is_reserved(start + 0x1100));
        assert_eq!(table.resolve(start + 0x1090), None);
        // Overlap is still rejected.
        assert_eq!(
            table.reserve(start + 0x20, start + 0x60, "dma0").unwrap_err(),
            AxError::AlreadyExists
        );
        // One mapping per page: uart0 and uart1 mapped one each, uart2 none.
        assert_eq!(table.release(), 2);
        let whole = Reservation::map(start, start + 0x2000).unwrap();
        assert_eq!(whole.pages(), 2);
    }

    proptest! {
        #[test]
        fn prop_resolve_never_picks_wrong_module(
            sizes in proptest::collection::vec(1usize..0x400, 1..8),
            gaps in proptest::collection::vec(0usize..0x200, 8),
            offset in 0usize..0x4000,
        ) {
            let table = RangeTable::new();
            let mut bounds = Vec::new();
            let mut cursor = 0x1000;
            for (i, size) in sizes.iter().enumerate() {
                let start = cursor + gaps[i];
                let end = start + size;
                table.record(start, end, &format!("m{i}")).unwrap();
                bounds.push((start, end));
                cursor = end;
            }

            let addr = 0x1000 + offset;
            let expected = bounds.iter().position(|&(s, e)| s <= addr && addr < e);
            let got = table.resolve(addr).map(|hit| hit.module);
            prop_assert_eq!(got.map(|m| String::from(m.as_str())), expected.map(|i| format!("m{i}")));
        }
    }
}
