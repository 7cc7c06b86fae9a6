//! 光追的 hit group 表
//!
//! 每个 instance 一行，行号与 TLAS 中 instance 的顺序完全一致，
//! 同时作为 instance 的 custom index 和 SBT record offset。

use ash::vk;
use itertools::Itertools;

use lumen_gfx::backend::GfxCapabilities;
use lumen_gfx::commands::command_buffer::GfxHitTableRegion;
use lumen_gfx::handles::GfxBufferHandle;

/// 跟在 hit group identifier 之后的 shader record 数据
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShaderRecordData {
    pub material: u32,
    pub vertex_slot: u32,
    pub index_slot: u32,
    pub _padding: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderTableRow {
    /// 由光追 kernel 查询得到
    pub hit_group: Vec<u8>,
    pub material: u32,
    pub vertex_slot: u32,
    pub index_slot: u32,
}

/// 每一行的大小和对齐
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub handle_size: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub base_alignment: vk::DeviceSize,
}

impl ShaderTableLayout {
    pub fn new(capabilities: &GfxCapabilities) -> Self {
        let handle_size = capabilities.shader_group_handle_size as vk::DeviceSize;
        let handle_alignment = capabilities.shader_group_handle_alignment.max(1) as vk::DeviceSize;
        let record_size = handle_size + size_of::<ShaderRecordData>() as vk::DeviceSize;
        Self {
            handle_size,
            stride: record_size.next_multiple_of(handle_alignment),
            base_alignment: capabilities.shader_group_base_alignment.max(1) as vk::DeviceSize,
        }
    }
}

/// CPU 侧的 hit group 表
#[derive(Clone, Debug)]
pub struct ShaderTable {
    layout: ShaderTableLayout,
    rows: Vec<ShaderTableRow>,
}

impl ShaderTable {
    pub fn new(layout: ShaderTableLayout) -> Self {
        Self {
            layout,
            rows: Vec::new(),
        }
    }

    /// 追加一行，返回行号
    pub fn push(&mut self, row: ShaderTableRow) -> u32 {
        debug_assert_eq!(row.hit_group.len() as vk::DeviceSize, self.layout.handle_size);
        self.rows.push(row);
        (self.rows.len() - 1) as u32
    }

    /// 按 stride 打包所有行
    pub fn to_bytes(&self) -> Vec<u8> {
        let stride = self.layout.stride as usize;
        let handle_size = self.layout.handle_size as usize;
        let mut bytes = vec![0u8; stride * self.rows.len()];
        for (row, dst) in self.rows.iter().zip_eq(bytes.chunks_exact_mut(stride)) {
            let identifier_len = row.hit_group.len().min(handle_size);
            dst[..identifier_len].copy_from_slice(&row.hit_group[..identifier_len]);
            let data = ShaderRecordData {
                material: row.material,
                vertex_slot: row.vertex_slot,
                index_slot: row.index_slot,
                _padding: 0,
            };
            dst[handle_size..handle_size + size_of::<ShaderRecordData>()].copy_from_slice(bytemuck::bytes_of(&data));
        }
        bytes
    }

    #[inline]
    pub fn rows(&self) -> &[ShaderTableRow] {
        &self.rows
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    #[inline]
    pub fn byte_size(&self) -> vk::DeviceSize {
        self.layout.stride * self.rows.len() as vk::DeviceSize
    }

    /// `trace_rays` 使用的 hit 区域
    pub fn hit_region(&self, buffer: GfxBufferHandle) -> GfxHitTableRegion {
        GfxHitTableRegion {
            buffer,
            stride: self.layout.stride,
            count: self.rows.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::backend::GfxBackend;
    use lumen_gfx::headless::HeadlessBackend;

    #[test]
    fn test_rows_are_packed_by_stride() {
        let backend = HeadlessBackend::default();
        let layout = ShaderTableLayout::new(backend.capabilities());
        // 32 字节 identifier + 16 字节数据，按 32 对齐
        assert_eq!(layout.stride, 64);

        let mut table = ShaderTable::new(layout);
        for i in 0..3 {
            let row = table.push(ShaderTableRow {
                hit_group: vec![0xAB; 32],
                material: 10 + i,
                vertex_slot: 2 * i,
                index_slot: 2 * i + 1,
            });
            assert_eq!(row, i);
        }

        let bytes = table.to_bytes();
        assert_eq!(bytes.len() as vk::DeviceSize, table.byte_size());
        let second = &bytes[64..128];
        assert!(second[..32].iter().all(|b| *b == 0xAB));
        let data: ShaderRecordData = bytemuck::pod_read_unaligned(&second[32..48]);
        assert_eq!(data.material, 11);
        assert_eq!(data.vertex_slot, 2);
        assert_eq!(data.index_slot, 3);
    }
}
