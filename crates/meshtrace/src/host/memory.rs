use std::collections::BTreeMap;

use crate::backend::DevicePtr;

const BASE_ADDRESS: u64 = 0x7000_0000;
/// Allocation granularity, like `cuMemAlloc`.
pub(crate) const ALIGNMENT: u64 = 256;

/// Simulated device address space. Allocations are spaced so that running
/// past the end of one never lands inside the next.
#[derive(Debug)]
pub(crate) struct AddressSpace {
    allocations: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl AddressSpace {
    pub(crate) fn new() -> Self {
        Self { allocations: BTreeMap::new(), next: BASE_ADDRESS }
    }

    pub(crate) fn alloc(&mut self, len: usize) -> Result<DevicePtr, String> {
        if len == 0 {
            return Err("invalid value: zero-byte allocation".to_string());
        }

        let addr = self.next;
        self.next = (addr + len as u64 + 1).next_multiple_of(ALIGNMENT);
        self.allocations.insert(addr, vec![0; len]);
        Ok(DevicePtr(addr))
    }

    pub(crate) fn free(&mut self, ptr: DevicePtr) -> Result<(), String> {
        match self.allocations.remove(&ptr.0) {
            Some(_) => Ok(()),
            None => Err(format!("invalid value: {:#x} is not the start of a live allocation", ptr.0)),
        }
    }

    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize), String> {
        let illegal = || format!("illegal address: {len} bytes at {:#x}", ptr.0);
        let (&start, buffer) = self.allocations.range(..=ptr.0).next_back().ok_or_else(illegal)?;
        let offset = (ptr.0 - start) as usize;
        if offset.checked_add(len).is_none_or(|end| end > buffer.len()) {
            return Err(illegal());
        }
        Ok((start, offset))
    }

    pub(crate) fn read(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], String> {
        let (start, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&start][offset..offset + len])
    }

    pub(crate) fn write(&mut self, ptr: DevicePtr, data: &[u8]) -> Result<(), String> {
        let (start, offset) = self.locate(ptr, data.len())?;
        let buffer = self.allocations.get_mut(&start).ok_or("allocation vanished")?;
        buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
