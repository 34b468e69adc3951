//! Shader binding table packing.
//!
//! One header-only record per program group, packed `[raygen | miss |
//! closest_hit]` at a common stride. There is no per-geometry payload.

use crate::backend::{Backend, DevicePtr};
use crate::error::{Error, Result};
use crate::pipeline::ProgramGroups;

/// Smallest multiple of `alignment` that can hold a `header_size` header.
pub const fn record_stride(header_size: usize, alignment: usize) -> usize {
    header_size.div_ceil(alignment) * alignment
}

/// Device-side view of the packed records, as handed to a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTable {
    pub raygen_record: DevicePtr,
    pub miss_record_base: DevicePtr,
    pub miss_record_stride: u32,
    pub miss_record_count: u32,
    pub hitgroup_record_base: DevicePtr,
    pub hitgroup_record_stride: u32,
    pub hitgroup_record_count: u32,
}

/// Host copy of the packed records, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtRecords {
    stride: usize,
    bytes: Vec<u8>,
}

impl SbtRecords {
    pub fn pack<B: Backend>(backend: &B, programs: &ProgramGroups<&B::ProgramGroup>) -> Result<Self> {
        let stride = record_stride(B::SBT_RECORD_HEADER_SIZE, B::SBT_RECORD_ALIGNMENT);
        let mut bytes = vec![0u8; stride * 3];

        for (record, group) in bytes.chunks_exact_mut(stride).zip(programs.ordered()) {
            backend.pack_sbt_header(group, &mut record[..B::SBT_RECORD_HEADER_SIZE])?;
        }

        Ok(Self { stride, bytes })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Record addresses once the bytes live at `base` on the device.
    pub fn table(&self, base: DevicePtr) -> Result<ShaderBindingTable> {
        let stride = u32::try_from(self.stride)
            .map_err(|_| Error::invalid(format!("SBT record stride {} does not fit u32", self.stride)))?;

        Ok(ShaderBindingTable {
            raygen_record: base,
            miss_record_base: base.offset(stride as u64),
            miss_record_stride: stride,
            miss_record_count: 1,
            hitgroup_record_base: base.offset(2 * stride as u64),
            hitgroup_record_stride: stride,
            hitgroup_record_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProgramKind;
    use crate::host::{HostBackend, HostProgramGroup};

    #[test]
    fn stride_rounds_up_to_alignment() {
        assert_eq!(record_stride(32, 16), 32);
        assert_eq!(record_stride(33, 16), 48);
        assert_eq!(record_stride(1, 16), 16);
        assert_eq!(record_stride(16, 16), 16);
    }

    #[test]
    fn records_follow_role_order() {
        let backend = HostBackend::new();
        let raygen = HostProgramGroup::new(11, ProgramKind::Raygen);
        let miss = HostProgramGroup::new(12, ProgramKind::Miss);
        let closest_hit = HostProgramGroup::new(13, ProgramKind::ClosestHit);
        let programs = ProgramGroups { raygen: &raygen, miss: &miss, closest_hit: &closest_hit };

        let records = SbtRecords::pack(&backend, &programs).unwrap();
        assert_eq!(records.stride(), 32);
        assert_eq!(records.as_bytes().len(), 96);

        let kinds: Vec<_> = records
            .as_bytes()
            .chunks_exact(records.stride())
            .map(|record| HostProgramGroup::decode_header(record).map(|g| g.kind()))
            .collect();
        assert_eq!(kinds, [Some(ProgramKind::Raygen), Some(ProgramKind::Miss), Some(ProgramKind::ClosestHit)]);
    }

    #[test]
    fn table_offsets() {
        let backend = HostBackend::new();
        let group = |id, kind| HostProgramGroup::new(id, kind);
        let (rg, ms, ch) = (group(1, ProgramKind::Raygen), group(2, ProgramKind::Miss), group(3, ProgramKind::ClosestHit));
        let records = SbtRecords::pack(&backend, &ProgramGroups { raygen: &rg, miss: &ms, closest_hit: &ch }).unwrap();

        let table = records.table(DevicePtr(0x1000)).unwrap();
        assert_eq!(table.raygen_record, DevicePtr(0x1000));
        assert_eq!(table.miss_record_base, DevicePtr(0x1020));
        assert_eq!(table.hitgroup_record_base, DevicePtr(0x1040));
        assert_eq!(table.miss_record_stride, 32);
        assert_eq!(table.hitgroup_record_count, 1);
    }
}
