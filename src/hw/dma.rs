//! Bus-addressable memory shared between the host and the controller.
//!
//! Allocations hand out 32 bit bus addresses on [`COMMAND_ALIGN`]
//! boundaries, so command lists can be addressed by the request port and
//! their low tag bits stay clear. Buffers are released when dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{bail, ensure},
};
use parking_lot::Mutex;
use tracing::warn;

use crate::ciss::command_list::{COMMAND_ALIGN, XferDirection};

/// Bus address of the first allocation.
pub const DEFAULT_BASE: u64 = 0x1000_0000;
/// Default window size: 256 MiB below the 4 GiB line.
pub const DEFAULT_SIZE: u64 = 0x1000_0000;

pub struct DmaMemory {
    base: u64,
    size: u64,
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl DmaMemory {
    pub fn new(base: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            base,
            size,
            regions: Mutex::new(BTreeMap::new()),
        })
    }

    /// Allocates `len` zeroed bytes, or returns `None` when the window has
    /// no gap large enough.
    pub fn alloc_coherent(self: &Arc<Self>, len: usize) -> Option<DmaBuffer> {
        // zero-length buffers still get an address of their own
        let footprint = len.max(1);
        let mut regions = self.regions.lock();
        let mut candidate = self.base;
        for (&start, region) in regions.iter() {
            if candidate + footprint as u64 <= start {
                break;
            }
            candidate = align_up(start + region.len() as u64);
        }
        if candidate + footprint as u64 > self.base + self.size {
            return None;
        }
        regions.insert(candidate, vec![0; footprint]);
        Some(DmaBuffer {
            dma: Arc::clone(self),
            bus: candidate,
            len,
        })
    }

    /// Maps a host buffer for a transfer in `direction`.
    ///
    /// Data headed for the device is copied in now; data coming from the
    /// device is copied out by [`DmaMapping::unmap`].
    pub fn map(self: &Arc<Self>, host: &[u8], direction: XferDirection) -> Option<DmaMapping> {
        let buffer = self.alloc_coherent(host.len())?;
        if direction == XferDirection::Write {
            buffer.write_at(0, host).ok()?;
        }
        Some(DmaMapping { buffer, direction })
    }

    pub fn read(&self, bus: u64, buf: &mut [u8]) -> Result<()> {
        let regions = self.regions.lock();
        let Some((&start, region)) = regions.range(..=bus).next_back() else {
            bail!("bus address {bus:#x} is not mapped");
        };
        let offset = offset_in(start, region.len(), bus, buf.len())?;
        buf.copy_from_slice(&region[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write(&self, bus: u64, data: &[u8]) -> Result<()> {
        let mut regions = self.regions.lock();
        let Some((&start, region)) = regions.range_mut(..=bus).next_back() else {
            bail!("bus address {bus:#x} is not mapped");
        };
        let offset = offset_in(start, region.len(), bus, data.len())?;
        region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn zero(&self, bus: u64, len: usize) -> Result<()> {
        self.write(bus, &vec![0; len])
    }

    /// Bytes currently allocated, for leak checks.
    pub fn bytes_allocated(&self) -> usize {
        self.regions.lock().values().map(Vec::len).sum()
    }

    fn free(&self, bus: u64) {
        if self.regions.lock().remove(&bus).is_none() {
            warn!("freeing unknown DMA region {bus:#x}");
        }
    }
}

fn align_up(addr: u64) -> u64 {
    addr.div_ceil(COMMAND_ALIGN as u64) * COMMAND_ALIGN as u64
}

/// Offset of `[bus, bus + len)` inside the region at `start`.
fn offset_in(start: u64, region_len: usize, bus: u64, len: usize) -> Result<usize> {
    let offset = (bus - start) as usize;
    ensure!(
        offset + len <= region_len,
        "access of {len} bytes at {bus:#x} overruns region {start:#x}+{region_len}"
    );
    Ok(offset)
}

/// An owned allocation in [`DmaMemory`].
pub struct DmaBuffer {
    dma: Arc<DmaMemory>,
    bus: u64,
    len: usize,
}

impl DmaBuffer {
    pub fn bus(&self) -> u64 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.len];
        self.dma.read(self.bus, &mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        ensure!(
            offset + data.len() <= self.len,
            "write of {} bytes at offset {offset} overruns a {} byte buffer",
            data.len(),
            self.len
        );
        self.dma.write(self.bus + offset as u64, data)
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.dma.free(self.bus);
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus", &format_args!("{:#x}", self.bus))
            .field("len", &self.len)
            .finish()
    }
}

/// A host buffer mapped for one transfer.
#[derive(Debug)]
pub struct DmaMapping {
    buffer: DmaBuffer,
    direction: XferDirection,
}

impl DmaMapping {
    pub fn bus(&self) -> u64 {
        self.buffer.bus()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn direction(&self) -> XferDirection {
        self.direction
    }

    /// Current contents of the device side of the mapping.
    pub fn contents(&self) -> Result<Vec<u8>> {
        self.buffer.to_vec()
    }

    /// Tears the mapping down, copying device-written data back into `host`
    /// for reads.
    pub fn unmap(self, host: &mut [u8]) -> Result<()> {
        if self.direction == XferDirection::Read {
            ensure!(
                host.len() == self.buffer.len(),
                "unmapping into a {} byte buffer, mapping is {} bytes",
                host.len(),
                self.buffer.len()
            );
            self.buffer.dma.read(self.buffer.bus, host)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_reused() {
        let dma = DmaMemory::new(DEFAULT_BASE, 4096);
        let a = dma.alloc_coherent(40).unwrap();
        let b = dma.alloc_coherent(8).unwrap();
        assert_eq!(a.bus(), DEFAULT_BASE);
        assert_eq!(b.bus() % COMMAND_ALIGN as u64, 0);
        assert!(b.bus() >= a.bus() + 40);

        let freed = a.bus();
        drop(a);
        let c = dma.alloc_coherent(32).unwrap();
        assert_eq!(c.bus(), freed);
    }

    #[test]
    fn window_exhaustion_returns_none() {
        let dma = DmaMemory::new(DEFAULT_BASE, 64);
        let _a = dma.alloc_coherent(64).unwrap();
        assert!(dma.alloc_coherent(1).is_none());
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let dma = DmaMemory::new(DEFAULT_BASE, 4096);
        let a = dma.alloc_coherent(16).unwrap();
        let e = dma.write(a.bus() + 8, &[0; 16]).expect_err("overrun");
        assert!(e.root_cause().to_string().contains("overruns"));
        let e = dma.read(DEFAULT_BASE - 1, &mut [0; 1]).expect_err("unmapped");
        assert!(e.root_cause().to_string().contains("not mapped"));
    }

    #[test]
    fn read_mapping_copies_back_on_unmap() {
        let dma = DmaMemory::new(DEFAULT_BASE, 4096);
        let mut host = vec![0u8; 4];
        let mapping = dma.map(&host, XferDirection::Read).unwrap();
        dma.write(mapping.bus(), &[1, 2, 3, 4]).unwrap();
        mapping.unmap(&mut host).unwrap();
        assert_eq!(host, [1, 2, 3, 4]);
        assert_eq!(dma.bytes_allocated(), 0);
    }
}
