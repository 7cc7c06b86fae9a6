//! 加速结构相关的数据定义
//!
//! 构建参数与具体后端无关：BLAS 的输入是三角形几何，TLAS 的输入是 instance buffer。

use ash::vk;

use crate::handles::{GfxAccelHandle, GfxBufferHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxAccelLevel {
    Bottom,
    Top,
}

impl GfxAccelLevel {
    #[inline]
    pub fn to_vk(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// BLAS 的一个三角形几何
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxTriangleGeometry {
    pub vertex_buffer: GfxBufferHandle,
    /// 顶点位置是 vertex 的第一个成员，格式为 `R32G32B32_SFLOAT`
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    pub index_buffer: GfxBufferHandle,
    pub primitive_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GfxAccelInput {
    Triangles(Vec<GfxTriangleGeometry>),
    Instances { buffer: GfxBufferHandle, count: u32 },
}

impl GfxAccelInput {
    #[inline]
    pub fn level(&self) -> GfxAccelLevel {
        match self {
            Self::Triangles(_) => GfxAccelLevel::Bottom,
            Self::Instances { .. } => GfxAccelLevel::Top,
        }
    }

    /// 输入中所有 primitive 的数量（TLAS 为 instance 数量）
    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(geometries) => geometries.iter().map(|g| g.primitive_count).sum(),
            Self::Instances { count, .. } => *count,
        }
    }
}

/// prebuild 查询的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GfxAccelBuildSizes {
    pub accel_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
}

/// scratch 内存中的一段区域
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxScratchRegion {
    pub buffer: GfxBufferHandle,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// 一次加速结构构建
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxAccelBuild {
    pub dst: GfxAccelHandle,
    pub input: GfxAccelInput,
    pub scratch: GfxScratchRegion,
}

/// TLAS 的 instance 数据，内存布局与 `VkAccelerationStructureInstanceKHR` 一致
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GfxAccelInstance {
    /// 3x4 row-major matrix
    pub transform: [f32; 12],
    /// 低 24 位：custom index，高 8 位：mask
    pub instance_custom_index_and_mask: u32,
    /// 低 24 位：shader binding table record offset，高 8 位：flags
    pub sbt_record_offset_and_flags: u32,
    pub blas_device_address: u64,
}

impl GfxAccelInstance {
    pub fn new(transform: &glam::Mat4, custom_index: u32, sbt_record_offset: u32, blas_device_address: u64) -> Self {
        Self {
            transform: get_rt_matrix(transform),
            instance_custom_index_and_mask: pack_24_8(custom_index, 0xFF),
            sbt_record_offset_and_flags: pack_24_8(
                sbt_record_offset,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            blas_device_address,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0x00FF_FFFF
    }

    #[inline]
    pub fn sbt_record_offset(&self) -> u32 {
        self.sbt_record_offset_and_flags & 0x00FF_FFFF
    }
}

#[inline]
fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & 0x00FF_FFFF) | ((high_8 as u32) << 24)
}

/// glam 的列主序矩阵转换为 3x4 row-major 矩阵
pub fn get_rt_matrix(trans: &glam::Mat4) -> [f32; 12] {
    let c1 = &trans.x_axis;
    let c2 = &trans.y_axis;
    let c3 = &trans.z_axis;
    let c4 = &trans.w_axis;

    [
        c1.x, c2.x, c3.x, c4.x, // row 1
        c1.y, c2.y, c3.y, c4.y, // row 2
        c1.z, c2.z, c3.z, c4.z, // row 3
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout_matches_vulkan() {
        assert_eq!(size_of::<GfxAccelInstance>(), size_of::<vk::AccelerationStructureInstanceKHR>());
    }

    #[test]
    fn test_instance_packing() {
        let instance = GfxAccelInstance::new(&glam::Mat4::IDENTITY, 7, 7, 0x1000);
        assert_eq!(instance.custom_index(), 7);
        assert_eq!(instance.sbt_record_offset(), 7);
        assert_eq!(instance.instance_custom_index_and_mask >> 24, 0xFF);
    }

    #[test]
    fn test_rt_matrix_translation_in_last_column() {
        let m = glam::Mat4::from_translation(glam::vec3(1.0, 2.0, 3.0));
        let rt = get_rt_matrix(&m);
        assert_eq!([rt[3], rt[7], rt[11]], [1.0, 2.0, 3.0]);
        assert_eq!(rt[0], 1.0);
    }
}
