//! Memory the DMA model transfers through.

use axerrno::{AxResult, ax_err};
use memory_addr::{VirtAddr, VirtAddrRange};
use spin::Mutex;

/// Source and destination memory for bus-master models.
pub trait DmaBus: Send + Sync {
    /// Fills `buf` from `addr`.
    fn read(&self, addr: usize, buf: &mut [u8]) -> AxResult;

    /// Copies `data` to `addr`.
    fn write(&self, addr: usize, data: &[u8]) -> AxResult;
}

struct MemRegion {
    range: VirtAddrRange,
    data: Vec<u8>,
}

/// Software memory made of disjoint regions. Accesses outside every region,
/// or spanning two, fail with `BadAddress`.
pub struct SparseMemory {
    regions: Mutex<Vec<MemRegion>>,
}

fn span(addr: usize, len: usize) -> AxResult<VirtAddrRange> {
    match addr.checked_add(len) {
        Some(end) => Ok(VirtAddrRange::new(
            VirtAddr::from_usize(addr),
            VirtAddr::from_usize(end),
        )),
        None => ax_err!(BadAddress, "access wraps the address space"),
    }
}

impl SparseMemory {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Adds `len` zeroed bytes at `start`.
    pub fn add_region(&self, start: usize, len: usize) -> AxResult {
        if len == 0 {
            return ax_err!(InvalidInput, "memory region is empty");
        }
        let range = span(start, len)?;
        let mut regions = self.regions.lock();
        if regions.iter().any(|r| r.range.overlaps(range)) {
            return ax_err!(AlreadyExists, "memory region overlaps an existing one");
        }
        regions.push(MemRegion {
            range,
            data: vec![0; len],
        });
        Ok(())
    }

    fn with_region<R>(
        &self,
        addr: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> AxResult<R> {
        let range = span(addr, len)?;
        let mut regions = self.regions.lock();
        let Some(region) = regions.iter_mut().find(|r| r.range.contains_range(range)) else {
            return ax_err!(BadAddress, "access outside simulated memory");
        };
        let offset = addr - region.range.start.as_usize();
        Ok(f(&mut region.data[offset..offset + len]))
    }

    /// Copies `data` into memory at `addr`.
    pub fn load(&self, addr: usize, data: &[u8]) -> AxResult {
        self.with_region(addr, data.len(), |dst| dst.copy_from_slice(data))
    }

    /// Returns `len` bytes starting at `addr`.
    pub fn dump(&self, addr: usize, len: usize) -> AxResult<Vec<u8>> {
        self.with_region(addr, len, |src| src.to_vec())
    }
}

impl Default for SparseMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBus for SparseMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> AxResult {
        self.with_region(addr, buf.len(), |src| buf.copy_from_slice(src))
    }

    fn write(&self, addr: usize, data: &[u8]) -> AxResult {
        self.load(addr, data)
    }
}

/// The host address space itself.
///
/// Used when drivers hand real buffers to the DMA model.
pub struct HostMemory(());

impl HostMemory {
    /// # Safety
    ///
    /// Every address a model is programmed with must be valid for the
    /// programmed length for as long as the transfer runs, and must not be
    /// accessed concurrently by anything else.
    pub unsafe fn new() -> Self {
        Self(())
    }
}

impl DmaBus for HostMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> AxResult {
        if addr == 0 {
            return ax_err!(BadAddress, "DMA source is null");
        }
        // SAFETY: validity is promised by the caller of `HostMemory::new`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                core::ptr::with_exposed_provenance::<u8>(addr),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        Ok(())
    }

    fn write(&self, addr: usize, data: &[u8]) -> AxResult {
        if addr == 0 {
            return ax_err!(BadAddress, "DMA destination is null");
        }
        // SAFETY: as above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                core::ptr::with_exposed_provenance_mut::<u8>(addr),
                data.len(),
            )
        };
        Ok(())
    }
}
