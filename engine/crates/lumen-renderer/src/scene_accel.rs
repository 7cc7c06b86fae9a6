//! 上传完成的场景：几何记录、实例记录、两级加速结构
//!
//! BLAS 在加载之后不再改变。TLAS 最多有两份，每一份在创建时注册一个 resource table slot，之后不再改变：
//! pass 读取 front，instance 的 transform 改变时在 back 上构建（back 在第一次重建时创建），
//! 只有当这次构建的 fence 通过之后才交换 front 和 back，pass 永远不会看到构建了一半的结构。

use ash::vk;
use itertools::Itertools;

use lumen_gfx::accel::{GfxAccelBuild, GfxAccelInput, GfxAccelInstance, GfxAccelLevel};
use lumen_gfx::commands::barrier::GfxBarrierMask;
use lumen_gfx::commands::command_buffer::{GfxCommandBuffer, GfxHitTableRegion};
use lumen_gfx::error::{GfxError, GfxResult};
use lumen_gfx::handles::{GfxAccelHandle, GfxBufferHandle};
use lumen_gfx::resources::{GfxBufferDesc, GfxMemoryLocation};
use lumen_render_interface::resource_table::ResourceSlot;
use lumen_scene::material::Material;
use lumen_scene::scene_graph::MeshId;

use crate::context::RendererContext;
use crate::error::RendererError;
use crate::shader_table::ShaderTable;

/// geometry arena 中的索引
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u32);

/// 几何的来源，曲线与 mesh 的 id 空间互相独立
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKey {
    Mesh(MeshId),
    Curve(MeshId),
}

/// 一个唯一 mesh 的 GPU 数据，加载后不可变
#[derive(Clone, Debug)]
pub struct GeometryRecord {
    pub key: GeometryKey,
    pub name: String,
    pub vertex_buffer: GfxBufferHandle,
    pub index_buffer: GfxBufferHandle,
    pub vertex_count: u32,
    pub primitive_count: u32,
    pub blas: GfxAccelHandle,
    pub blas_address: vk::DeviceAddress,
    pub vertex_slot: ResourceSlot,
    pub index_slot: ResourceSlot,
}

/// 场景中的一次放置
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRecord {
    pub geometry: GeometryId,
    pub transform: glam::Mat4,
    pub material: u32,
    /// 同时是 TLAS instance 的 custom index 和 SBT record offset
    pub shader_table_row: u32,
    pub emission: Option<glam::Vec3>,
}

/// pass 可以看到的 TLAS
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlasBinding {
    pub accel: GfxAccelHandle,
    pub instance_buffer: GfxBufferHandle,
    pub slot: ResourceSlot,
}

pub struct SceneAccel {
    pub(crate) geometries: Vec<GeometryRecord>,
    pub(crate) instances: Vec<InstanceRecord>,
    front: TlasBinding,
    back: Option<TlasBinding>,
    /// back 上已经提交、尚未交换的构建的 fence
    pending: Option<u64>,
    /// 这个 fence 通过之后，back 不再被任何提交读取
    back_released_at: u64,
    transforms_dirty: bool,

    pub(crate) shader_table: ShaderTable,
    pub(crate) shader_table_buffer: GfxBufferHandle,
    pub(crate) materials: Vec<Material>,
    pub(crate) material_buffer: GfxBufferHandle,
    pub(crate) material_slot: ResourceSlot,

    /// 上传和构建所在提交的 fence
    pub(crate) ready_fence: u64,
    /// 每次 TLAS 替换之后加一
    generation: u64,
}

// new & init
impl SceneAccel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        geometries: Vec<GeometryRecord>,
        instances: Vec<InstanceRecord>,
        tlas: TlasBinding,
        shader_table: ShaderTable,
        shader_table_buffer: GfxBufferHandle,
        materials: Vec<Material>,
        material_buffer: GfxBufferHandle,
        material_slot: ResourceSlot,
        ready_fence: u64,
    ) -> Self {
        Self {
            geometries,
            instances,
            front: tlas,
            back: None,
            pending: None,
            back_released_at: ready_fence,
            transforms_dirty: false,
            shader_table,
            shader_table_buffer,
            materials,
            material_buffer,
            material_slot,
            ready_fence,
            generation: 0,
        }
    }
}

// getters
impl SceneAccel {
    #[inline]
    pub fn geometries(&self) -> &[GeometryRecord] {
        &self.geometries
    }

    #[inline]
    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    /// 当前可以被 pass 读取的 TLAS
    #[inline]
    pub fn tlas(&self) -> &TlasBinding {
        &self.front
    }

    /// 下一次重建的目标，第一次重建之前为 `None`
    #[inline]
    pub fn back_tlas(&self) -> Option<&TlasBinding> {
        self.back.as_ref()
    }

    #[inline]
    pub fn shader_table(&self) -> &ShaderTable {
        &self.shader_table
    }

    #[inline]
    pub fn shader_table_buffer(&self) -> GfxBufferHandle {
        self.shader_table_buffer
    }

    #[inline]
    pub fn hit_region(&self) -> GfxHitTableRegion {
        self.shader_table.hit_region(self.shader_table_buffer)
    }

    #[inline]
    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    #[inline]
    pub fn material_buffer(&self) -> GfxBufferHandle {
        self.material_buffer
    }

    #[inline]
    pub fn material_slot(&self) -> ResourceSlot {
        self.material_slot
    }

    #[inline]
    pub fn ready_fence(&self) -> u64 {
        self.ready_fence
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn has_pending_rebuild(&self) -> bool {
        self.pending.is_some()
    }
}

// tlas rebuild
impl SceneAccel {
    /// 修改一个 instance 的 transform，TLAS 在下一次 `rebuild_if_dirty` 时重建
    pub fn set_instance_transform(&mut self, index: usize, transform: glam::Mat4) -> Result<(), RendererError> {
        let count = self.instances.len();
        let instance = self
            .instances
            .get_mut(index)
            .ok_or(RendererError::InstanceOutOfRange { index, count })?;
        if instance.transform != transform {
            instance.transform = transform;
            self.transforms_dirty = true;
        }
        Ok(())
    }

    /// 把 back TLAS 的构建提交到一个独立的 stream 中
    ///
    /// back 还在被读取，或者上一次构建还没有交换时，保持 dirty，下一帧再尝试
    pub fn rebuild_if_dirty(&mut self, ctx: &RendererContext) -> Result<(), RendererError> {
        if !self.transforms_dirty {
            return Ok(());
        }
        if self.pending.is_some() || ctx.backend().completed_fence_value() < self.back_released_at {
            log::trace!("tlas rebuild deferred, back released at fence {}", self.back_released_at);
            return Ok(());
        }
        let _span = tracy_client::span!("SceneAccel::rebuild_tlas");

        let name = format!("scene-tlas-{}", self.generation + 1);
        let mut scratch_use = ctx.begin_scratch_use();
        let mut stream = ctx.stream_pool().acquire()?;
        stream.begin("tlas-rebuild");
        let recorded = match self.back {
            Some(back) => {
                record_tlas_update(ctx, stream.cmd(), &back, &self.instances, &self.geometries, &name).map(|()| back)
            }
            None => record_tlas_build(ctx, stream.cmd(), &self.instances, &self.geometries, "scene-tlas-back")
                .and_then(|(accel, instance_buffer)| Self::bind_back(ctx, accel, instance_buffer)),
        };
        let back = match recorded {
            Ok(back) => back,
            Err(e) => {
                stream.end();
                ctx.stream_pool().release(stream);
                return Err(e.into());
            }
        };
        stream.cmd().memory_barrier(&[GfxBarrierMask::ACCEL_BUILD_TO_READ]);
        stream.end();
        // 第一次创建的 back 即使提交失败也保留，下一次在它上面重新构建
        self.back = Some(back);

        let fence_value = ctx.stream_pool().submit(stream).map_err(RendererError::SubmitFailed)?;
        scratch_use.submitted(fence_value);

        log::debug!("{} into slot {} submitted with fence {}", name, back.slot.index(), fence_value);
        self.pending = Some(fence_value);
        self.transforms_dirty = false;
        Ok(())
    }

    /// 为第一次创建的 back 注册 slot，失败时销毁还没有提交过的对象
    fn bind_back(
        ctx: &RendererContext,
        accel: GfxAccelHandle,
        instance_buffer: GfxBufferHandle,
    ) -> GfxResult<TlasBinding> {
        match ctx.resource_table().register_accel(accel) {
            Ok(slot) => Ok(TlasBinding {
                accel,
                instance_buffer,
                slot,
            }),
            Err(e) => {
                ctx.backend().destroy_accel(accel);
                ctx.backend().destroy_buffer(instance_buffer);
                Err(e)
            }
        }
    }

    /// 构建完成之后交换 front 和 back，返回是否发生了交换
    ///
    /// 旧的 front 在最后一个可能读取它的提交完成之前不会被重新构建
    pub fn poll_pending(&mut self, ctx: &RendererContext) -> GfxResult<bool> {
        let Some(fence_value) = self.pending else {
            return Ok(false);
        };
        if ctx.backend().completed_fence_value() < fence_value {
            return Ok(false);
        }
        let Some(back) = self.back else {
            self.pending = None;
            return Ok(false);
        };

        self.back = Some(std::mem::replace(&mut self.front, back));
        self.back_released_at = ctx.stream_pool().last_submitted_value();
        self.pending = None;
        self.generation += 1;
        log::info!("tlas swapped, generation {}, slot {}", self.generation, self.front.slot.index());
        Ok(true)
    }
}

// destroy
impl SceneAccel {
    /// 所有 GPU 对象交给 deferred destroy 队列
    pub fn retire(self, ctx: &RendererContext) {
        let last_reader = ctx.stream_pool().last_submitted_value();
        let mut queue = ctx.deferred_destroy();
        for geometry in &self.geometries {
            queue.push(geometry.vertex_buffer, last_reader);
            queue.push(geometry.index_buffer, last_reader);
            queue.push(geometry.blas, last_reader);
        }
        for tlas in std::iter::once(self.front).chain(self.back) {
            queue.push(tlas.accel, last_reader);
            queue.push(tlas.instance_buffer, last_reader);
        }
        queue.push(self.shader_table_buffer, last_reader);
        queue.push(self.material_buffer, last_reader);
    }
}

fn tlas_instances(instances: &[InstanceRecord], geometries: &[GeometryRecord]) -> Vec<GfxAccelInstance> {
    instances
        .iter()
        .map(|instance| {
            let geometry = &geometries[instance.geometry.0 as usize];
            GfxAccelInstance::new(
                &instance.transform,
                instance.shader_table_row,
                instance.shader_table_row,
                geometry.blas_address,
            )
        })
        .collect_vec()
}

/// 录制一次 TLAS 构建，返回新的结构和它的 instance buffer
///
/// instance buffer 由 CPU 直接写入，不需要拷贝
pub(crate) fn record_tlas_build(
    ctx: &RendererContext,
    cmd: &mut GfxCommandBuffer,
    instances: &[InstanceRecord],
    geometries: &[GeometryRecord],
    name: &str,
) -> GfxResult<(GfxAccelHandle, GfxBufferHandle)> {
    let backend = ctx.backend();
    let instance_data = tlas_instances(instances, geometries);
    let instance_bytes: &[u8] = bytemuck::cast_slice(&instance_data);
    if instance_bytes.is_empty() {
        return Err(GfxError::PrebuildQuery(format!("{name} has no instances")));
    }

    let instance_buffer = backend.create_buffer(
        &GfxBufferDesc::new(
            instance_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            format!("{name}-instances"),
        )
        .with_location(GfxMemoryLocation::CpuToGpu),
    )?;

    let built = backend.write_buffer(instance_buffer, 0, instance_bytes).and_then(|()| {
        let input = GfxAccelInput::Instances {
            buffer: instance_buffer,
            count: instance_data.len() as u32,
        };
        let sizes = backend.accel_build_sizes(&input)?;
        let accel = backend.create_accel(GfxAccelLevel::Top, sizes.accel_size, name)?;
        match record_instance_build(ctx, cmd, accel, input, sizes.build_scratch_size) {
            Ok(()) => Ok(accel),
            Err(e) => {
                backend.destroy_accel(accel);
                Err(e)
            }
        }
    });
    match built {
        Ok(accel) => Ok((accel, instance_buffer)),
        Err(e) => {
            backend.destroy_buffer(instance_buffer);
            Err(e)
        }
    }
}

/// 在已有的 TLAS 上重新录制构建
///
/// instance 数量在加载之后不变，已有的结构和 instance buffer 的大小总是够用；
/// 调用者保证 GPU 已经不再读取 `target`
pub(crate) fn record_tlas_update(
    ctx: &RendererContext,
    cmd: &mut GfxCommandBuffer,
    target: &TlasBinding,
    instances: &[InstanceRecord],
    geometries: &[GeometryRecord],
    name: &str,
) -> GfxResult<()> {
    let backend = ctx.backend();
    let instance_data = tlas_instances(instances, geometries);
    if instance_data.is_empty() {
        return Err(GfxError::PrebuildQuery(format!("{name} has no instances")));
    }
    backend.write_buffer(target.instance_buffer, 0, bytemuck::cast_slice(&instance_data))?;

    let input = GfxAccelInput::Instances {
        buffer: target.instance_buffer,
        count: instance_data.len() as u32,
    };
    let sizes = backend.accel_build_sizes(&input)?;
    record_instance_build(ctx, cmd, target.accel, input, sizes.build_scratch_size)
}

fn record_instance_build(
    ctx: &RendererContext,
    cmd: &mut GfxCommandBuffer,
    dst: GfxAccelHandle,
    input: GfxAccelInput,
    scratch_size: vk::DeviceSize,
) -> GfxResult<()> {
    let scratch = ctx.scratch().allocate(scratch_size)?;
    cmd.cmd_build_acceleration_structure(GfxAccelBuild { dst, input, scratch });
    Ok(())
}
