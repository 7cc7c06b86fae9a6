//! 从 scene graph 构建两级加速结构
//!
//! 1. 按 mesh 去重，曲线细分为三角形环带，顶点准备在 rayon 上并行
//! 2. 顶点、索引、材质、shader table 通过一个 staging buffer 拷贝到 GPU
//! 3. 每个唯一几何一个 BLAS，所有 instance 一个 TLAS，scratch 来自 bump 分配器，
//!    开始之前等待上一次使用 scratch 的提交完成，使 scratch 整体回绕
//!
//! 所有命令录制在同一个 stream 中，通过共享的 pool 提交，因此可以在加载线程上执行。

use ash::vk;
use indexmap::IndexMap;
use itertools::Itertools;
use rayon::prelude::*;

use lumen_gfx::accel::{GfxAccelBuild, GfxAccelInput, GfxAccelLevel, GfxTriangleGeometry};
use lumen_gfx::commands::barrier::GfxBarrierMask;
use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::{GfxAccelHandle, GfxBufferHandle, GfxResource};
use lumen_gfx::resources::GfxBufferDesc;
use lumen_render_interface::resource_table::ResourceTable;
use lumen_scene::error::SceneLoadError;
use lumen_scene::geometry::{GpuVertex, PreparedMesh, prepare_mesh, tessellate_curve};
use lumen_scene::material::Material;
use lumen_scene::scene_graph::{CurveDesc, MeshDesc, SceneGraph};

use crate::context::RendererContext;
use crate::scene_accel::{
    GeometryId, GeometryKey, GeometryRecord, InstanceRecord, SceneAccel, TlasBinding, record_tlas_build,
};
use crate::shader_table::{ShaderTable, ShaderTableLayout, ShaderTableRow};

/// 去重之后的几何来源
enum MeshSource<'s> {
    Mesh(&'s MeshDesc),
    Curve(&'s CurveDesc),
}

impl MeshSource<'_> {
    fn prepare(&self) -> Result<PreparedMesh, SceneLoadError> {
        match self {
            Self::Mesh(mesh) => Ok(prepare_mesh(mesh)),
            Self::Curve(curve) => tessellate_curve(curve).map(|mesh| prepare_mesh(&mesh)),
        }
    }
}

/// 一次放置，几何以去重表中的索引表示
struct Placement {
    geometry: usize,
    transform: glam::Mat4,
    material: u32,
    emission: Option<glam::Vec3>,
}

/// 构建失败时销毁已经创建的对象
///
/// 已经注册的 resource table slot 不会回收
struct CreatedResources<'a> {
    ctx: &'a RendererContext,
    items: Vec<GfxResource>,
}

impl<'a> CreatedResources<'a> {
    fn new(ctx: &'a RendererContext) -> Self {
        Self { ctx, items: Vec::new() }
    }

    fn track<T: Into<GfxResource> + Copy>(&mut self, resource: T) -> T {
        self.items.push(resource.into());
        resource
    }

    /// 构建成功，所有对象的所有权转移给 `SceneAccel`
    fn disarm(mut self) {
        self.items.clear();
    }
}

impl Drop for CreatedResources<'_> {
    fn drop(&mut self) {
        if self.items.is_empty() {
            return;
        }
        log::warn!("scene build aborted, destroying {} gpu objects", self.items.len());
        let backend = self.ctx.backend();
        for resource in self.items.drain(..).rev() {
            match resource {
                GfxResource::Buffer(buffer) => backend.destroy_buffer(buffer),
                GfxResource::Image(image) => backend.destroy_image(image),
                GfxResource::Accel(accel) => backend.destroy_accel(accel),
            }
        }
    }
}

/// staging buffer 中的一段拷贝
struct StagingCopy {
    dst: GfxBufferHandle,
    src_offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

#[derive(Default)]
struct StagingData {
    bytes: Vec<u8>,
    copies: Vec<StagingCopy>,
}

impl StagingData {
    fn push(&mut self, dst: GfxBufferHandle, data: &[u8]) {
        let src_offset = self.bytes.len() as vk::DeviceSize;
        self.bytes.extend_from_slice(data);
        // copy region 的偏移保持 4 字节对齐
        self.bytes.resize(self.bytes.len().next_multiple_of(4), 0);
        self.copies.push(StagingCopy {
            dst,
            src_offset,
            size: data.len() as vk::DeviceSize,
        });
    }
}

pub struct AccelBuilder<'a> {
    ctx: &'a RendererContext,
    /// 光追 kernel 的 hit group identifier，每一行 shader table 都以它开头
    hit_group: Vec<u8>,
}

impl<'a> AccelBuilder<'a> {
    pub fn new(ctx: &'a RendererContext, hit_group: Vec<u8>) -> Self {
        Self { ctx, hit_group }
    }

    /// 上传场景并构建加速结构
    ///
    /// 任何 GPU 错误（prebuild 查询被拒绝、分配失败）都会终止整个加载
    pub fn build(&self, scene: &SceneGraph) -> Result<SceneAccel, SceneLoadError> {
        let _span = tracy_client::span!("AccelBuilder::build");
        self.ctx.wait_scratch_idle()?;

        let materials = Material::convert_all(&scene.materials)?;
        if scene.instance_count() == 0 {
            return Err(SceneLoadError::Malformed("scene has no instances".to_string()));
        }

        let (sources, placements) = Self::dedup(scene)?;
        let prepared = {
            let _span = tracy_client::span!("AccelBuilder::prepare_meshes");
            sources
                .par_iter()
                .map(|(key, source)| source.prepare().map(|mesh| (*key, mesh)))
                .collect::<Result<Vec<_>, _>>()?
        };
        log::info!(
            "scene dedup: {} unique geometries for {} instances",
            prepared.len(),
            placements.len()
        );

        let mut created = CreatedResources::new(self.ctx);
        let accel = self.upload(&mut created, &prepared, &placements, &materials)?;
        created.disarm();
        Ok(accel)
    }

    /// 按 mesh 去重，保持第一次出现的顺序
    fn dedup(scene: &SceneGraph) -> Result<(Vec<(GeometryKey, MeshSource<'_>)>, Vec<Placement>), SceneLoadError> {
        let mut unique: IndexMap<GeometryKey, MeshSource<'_>> = IndexMap::new();
        let mut placements = Vec::with_capacity(scene.instance_count());

        for instance in &scene.instances {
            let mesh = scene
                .mesh(instance.mesh)
                .ok_or_else(|| SceneLoadError::Malformed(format!("instance references unknown mesh {:?}", instance.mesh)))?;
            let (geometry, _) = unique.insert_full(GeometryKey::Mesh(instance.mesh), MeshSource::Mesh(mesh));
            placements.push(Placement {
                geometry,
                transform: instance.transform,
                material: instance.material,
                emission: instance.emission,
            });
        }
        for curve in &scene.curves {
            let (geometry, _) = unique.insert_full(GeometryKey::Curve(curve.id), MeshSource::Curve(curve));
            placements.push(Placement {
                geometry,
                transform: curve.transform,
                material: curve.material,
                emission: None,
            });
        }

        Ok((unique.into_iter().collect(), placements))
    }

    fn upload(
        &self,
        created: &mut CreatedResources<'_>,
        prepared: &[(GeometryKey, PreparedMesh)],
        placements: &[Placement],
        materials: &[Material],
    ) -> Result<SceneAccel, SceneLoadError> {
        let backend = self.ctx.backend();
        let mut staging = StagingData::default();

        // geometry buffers
        let mut geometries = {
            let mut table = self.ctx.resource_table();
            prepared
                .iter()
                .map(|(key, mesh)| Self::create_geometry_buffers(self.ctx, &mut table, created, &mut staging, *key, mesh))
                .collect::<GfxResult<Vec<_>>>()?
        };

        // instance records 和 shader table 的行一一对应
        let mut shader_table = ShaderTable::new(ShaderTableLayout::new(backend.capabilities()));
        let instances = placements
            .iter()
            .map(|placement| {
                let geometry = &geometries[placement.geometry];
                let row = shader_table.push(ShaderTableRow {
                    hit_group: self.hit_group.clone(),
                    material: placement.material,
                    vertex_slot: geometry.vertex_slot.index(),
                    index_slot: geometry.index_slot.index(),
                });
                InstanceRecord {
                    geometry: GeometryId(placement.geometry as u32),
                    transform: placement.transform,
                    material: placement.material,
                    shader_table_row: row,
                    emission: placement.emission,
                }
            })
            .collect_vec();

        let gpu_materials = materials.iter().map(Material::to_gpu).collect_vec();
        let material_bytes: &[u8] = bytemuck::cast_slice(&gpu_materials);
        let material_buffer = created.track(backend.create_buffer(&GfxBufferDesc::new(
            material_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            "scene-materials",
        ))?);
        let material_slot = self.ctx.resource_table().register_buffer(material_buffer)?;
        staging.push(material_buffer, material_bytes);

        let shader_table_bytes = shader_table.to_bytes();
        let shader_table_buffer = created.track(
            backend.create_buffer(
                &GfxBufferDesc::new(
                    shader_table_bytes.len() as vk::DeviceSize,
                    vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                        | vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::TRANSFER_DST,
                    "scene-shader-table",
                )
                .with_alignment(shader_table.layout().base_alignment),
            )?,
        );
        staging.push(shader_table_buffer, &shader_table_bytes);

        let staging_buffer = created.track(backend.create_buffer(&GfxBufferDesc::new_stage_buffer(
            staging.bytes.len() as vk::DeviceSize,
            "scene-staging",
        ))?);
        backend.write_buffer(staging_buffer, 0, &staging.bytes)?;

        // 录制并提交
        let mut scratch_use = self.ctx.begin_scratch_use();
        let mut stream = self.ctx.stream_pool().acquire()?;
        stream.begin("scene-upload");
        let recorded = self.record_builds(stream.cmd(), created, staging_buffer, &staging, &mut geometries, &instances);
        stream.end();
        let tlas = match recorded {
            Ok(tlas) => tlas,
            Err(e) => {
                self.ctx.stream_pool().release(stream);
                return Err(e.into());
            }
        };
        let fence_value = self.ctx.stream_pool().submit(stream)?;
        scratch_use.submitted(fence_value);

        self.ctx.deferred_destroy().push(staging_buffer, fence_value);
        let (tlas_accel, instance_buffer) = tlas;
        let tlas_slot = self.ctx.resource_table().register_accel(tlas_accel)?;

        log::info!(
            "scene upload submitted with fence {}: {} blas, {} instances, {} triangles",
            fence_value,
            geometries.len(),
            instances.len(),
            geometries.iter().map(|g| g.primitive_count as u64).sum::<u64>()
        );

        Ok(SceneAccel::new(
            geometries,
            instances,
            TlasBinding {
                accel: tlas_accel,
                instance_buffer,
                slot: tlas_slot,
            },
            shader_table,
            shader_table_buffer,
            materials.to_vec(),
            material_buffer,
            material_slot,
            fence_value,
        ))
    }

    fn create_geometry_buffers(
        ctx: &RendererContext,
        table: &mut ResourceTable,
        created: &mut CreatedResources<'_>,
        staging: &mut StagingData,
        key: GeometryKey,
        mesh: &PreparedMesh,
    ) -> GfxResult<GeometryRecord> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::TRANSFER_DST;
        let backend = ctx.backend();

        let vertex_bytes = mesh.vertex_bytes();
        let index_bytes = mesh.index_bytes();
        let vertex_buffer = created.track(backend.create_buffer(&GfxBufferDesc::new(
            vertex_bytes.len() as vk::DeviceSize,
            usage,
            format!("{}-vertices", mesh.name),
        ))?);
        let index_buffer = created.track(backend.create_buffer(&GfxBufferDesc::new(
            index_bytes.len() as vk::DeviceSize,
            usage,
            format!("{}-indices", mesh.name),
        ))?);
        staging.push(vertex_buffer, vertex_bytes);
        staging.push(index_buffer, index_bytes);

        Ok(GeometryRecord {
            key,
            name: mesh.name.clone(),
            vertex_buffer,
            index_buffer,
            vertex_count: mesh.vertices.len() as u32,
            primitive_count: mesh.primitive_count(),
            // BLAS 在录制阶段创建
            blas: Default::default(),
            blas_address: 0,
            vertex_slot: table.register_buffer(vertex_buffer)?,
            index_slot: table.register_buffer(index_buffer)?,
        })
    }

    /// 拷贝、BLAS、TLAS，每一步之间都有 barrier
    fn record_builds(
        &self,
        cmd: &mut GfxCommandBuffer,
        created: &mut CreatedResources<'_>,
        staging_buffer: GfxBufferHandle,
        staging: &StagingData,
        geometries: &mut [GeometryRecord],
        instances: &[InstanceRecord],
    ) -> GfxResult<(GfxAccelHandle, GfxBufferHandle)> {
        let backend = self.ctx.backend();

        for copy in &staging.copies {
            cmd.cmd_copy_buffer(
                staging_buffer,
                copy.dst,
                &[vk::BufferCopy {
                    src_offset: copy.src_offset,
                    dst_offset: 0,
                    size: copy.size,
                }],
            );
        }
        cmd.memory_barrier(&[GfxBarrierMask::TRANSFER_TO_ACCEL_BUILD, GfxBarrierMask::TRANSFER_TO_SHADER_READ]);

        for geometry in geometries.iter_mut() {
            let input = GfxAccelInput::Triangles(vec![GfxTriangleGeometry {
                vertex_buffer: geometry.vertex_buffer,
                vertex_stride: GpuVertex::STRIDE,
                vertex_count: geometry.vertex_count,
                index_buffer: geometry.index_buffer,
                primitive_count: geometry.primitive_count,
            }]);
            let sizes = backend.accel_build_sizes(&input)?;
            let blas =
                created.track(backend.create_accel(GfxAccelLevel::Bottom, sizes.accel_size, &format!("{}-blas", geometry.name))?);
            let scratch = self.ctx.scratch().allocate(sizes.build_scratch_size)?;
            cmd.cmd_build_acceleration_structure(GfxAccelBuild {
                dst: blas,
                input,
                scratch,
            });
            geometry.blas = blas;
            geometry.blas_address = backend.accel_device_address(blas)?;
        }
        cmd.memory_barrier(&[GfxBarrierMask::ACCEL_BUILD_TO_READ]);

        let (tlas, instance_buffer) = record_tlas_build(self.ctx, cmd, instances, geometries, "scene-tlas-0")?;
        created.track(tlas);
        created.track(instance_buffer);
        cmd.memory_barrier(&[GfxBarrierMask::ACCEL_BUILD_TO_READ]);
        Ok((tlas, instance_buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lumen_gfx::accel::GfxAccelInstance;
    use lumen_gfx::backend::GfxBackend;
    use lumen_gfx::error::GfxError;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};
    use lumen_scene::geometry::CURVE_TRIANGLE_COUNT;
    use lumen_scene::scene_graph::{InstanceDesc, MaterialDesc, MaterialParam, MeshId};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    use crate::context::RendererConfig;

    fn triangle_mesh(id: u32, with_normals: bool) -> MeshDesc {
        MeshDesc {
            id: MeshId(id),
            name: format!("mesh-{id}"),
            positions: vec![glam::Vec3::ZERO, glam::Vec3::X, glam::Vec3::Y, glam::vec3(1.0, 1.0, 0.0)],
            normals: with_normals.then(|| vec![glam::Vec3::Z; 4]),
            uvs: None,
            tangents: None,
            indices: vec![0, 1, 2, 2, 1, 3],
        }
    }

    fn scene_with(meshes: Vec<MeshDesc>, instances: Vec<InstanceDesc>) -> SceneGraph {
        SceneGraph {
            meshes,
            materials: vec![
                MaterialDesc::new("matte").with("albedo", MaterialParam::Color(glam::Vec3::ONE)),
                MaterialDesc::new("metal").with("roughness", MaterialParam::Float(0.2)),
                MaterialDesc::new("glass").with("ior", MaterialParam::Float(1.5)),
            ],
            instances,
            ..Default::default()
        }
    }

    fn instance(mesh: u32, material: u32, x: f32) -> InstanceDesc {
        InstanceDesc {
            mesh: MeshId(mesh),
            material,
            transform: glam::Mat4::from_translation(glam::vec3(x, 0.0, 0.0)),
            emission: None,
        }
    }

    fn context(backend: Arc<HeadlessBackend>) -> RendererContext {
        RendererContext::new(backend, &RendererConfig::default())
    }

    fn hit_group(ctx: &RendererContext) -> Vec<u8> {
        vec![0x5A; ctx.backend().capabilities().shader_group_handle_size as usize]
    }

    #[test]
    fn test_shared_mesh_builds_one_geometry() {
        let backend = Arc::new(HeadlessBackend::default());
        let ctx = context(backend.clone());
        const K: u32 = 6;
        let scene = scene_with(
            vec![triangle_mesh(7, true)],
            (0..K).map(|i| instance(7, i % 3, i as f32)).collect(),
        );

        let accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();
        assert_eq!(accel.geometries().len(), 1);
        assert_eq!(accel.instances().len(), K as usize);
        assert_eq!(accel.shader_table().len(), accel.instances().len());

        for (i, (row, instance)) in accel.shader_table().rows().iter().zip(accel.instances()).enumerate() {
            assert_eq!(instance.shader_table_row, i as u32);
            assert_eq!(row.material, instance.material);
            assert_eq!(row.material, scene.instances[i].material);
            assert_eq!(row.vertex_slot, accel.geometries()[0].vertex_slot.index());
        }
        assert!(backend.is_accel_built(accel.tlas().accel));
        assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());
        accel.retire(&ctx);
    }

    #[test]
    fn test_instance_order_does_not_change_dedup() {
        let backend = Arc::new(HeadlessBackend::default());
        let ctx = context(backend.clone());
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..4 {
            let mut instances = (0..5).map(|i| instance(1, 0, i as f32)).collect_vec();
            instances.extend((0..3).map(|i| instance(2, 1, -(i as f32))));
            instances.shuffle(&mut rng);
            let scene = scene_with(vec![triangle_mesh(1, true), triangle_mesh(2, false)], instances.clone());

            let accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();
            assert_eq!(accel.geometries().len(), 2);
            for (record, desc) in accel.instances().iter().zip(&instances) {
                let geometry = &accel.geometries()[record.geometry.0 as usize];
                assert_eq!(geometry.key, GeometryKey::Mesh(desc.mesh));
            }
            accel.retire(&ctx);
        }
    }

    #[test]
    fn test_tlas_instances_carry_row_index() {
        let backend = Arc::new(HeadlessBackend::default());
        let ctx = context(backend.clone());
        let scene = scene_with(
            vec![triangle_mesh(1, true), triangle_mesh(2, true)],
            vec![instance(2, 0, 0.0), instance(1, 1, 1.0), instance(2, 2, 2.0)],
        );
        let accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();

        let stride = size_of::<GfxAccelInstance>();
        let mut bytes = vec![0u8; stride * 3];
        backend.read_buffer(accel.tlas().instance_buffer, 0, &mut bytes).unwrap();
        for i in 0..3 {
            let instance: GfxAccelInstance = bytemuck::pod_read_unaligned(&bytes[i * stride..(i + 1) * stride]);
            assert_eq!(instance.custom_index(), i as u32);
            assert_eq!(instance.sbt_record_offset(), i as u32);
            let geometry = &accel.geometries()[accel.instances()[i].geometry.0 as usize];
            assert_eq!(instance.blas_device_address, geometry.blas_address);
        }
        accel.retire(&ctx);
    }

    #[test]
    fn test_missing_normals_are_unindexed() {
        let backend = Arc::new(HeadlessBackend::default());
        let ctx = context(backend.clone());
        let scene = scene_with(vec![triangle_mesh(3, false)], vec![instance(3, 0, 0.0)]);
        let accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();

        let geometry = &accel.geometries()[0];
        assert_eq!(geometry.primitive_count, 2);
        assert_eq!(geometry.vertex_count, 6);
        accel.retire(&ctx);
    }

    #[test]
    fn test_curves_become_triangle_geometry() {
        let backend = Arc::new(HeadlessBackend::default());
        let ctx = context(backend.clone());
        let mut scene = scene_with(vec![triangle_mesh(1, true)], vec![instance(1, 0, 0.0)]);
        scene.curves.push(CurveDesc {
            id: MeshId(1),
            control_points: [glam::Vec3::ZERO, glam::vec3(0.0, 1.0, 0.0), glam::vec3(1.0, 2.0, 0.0), glam::vec3(2.0, 2.0, 0.0)],
            radius: 0.05,
            material: 2,
            transform: glam::Mat4::IDENTITY,
        });

        let accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();
        // 曲线与 mesh 1 的 id 相同，但不会被合并
        assert_eq!(accel.geometries().len(), 2);
        assert_eq!(accel.geometries()[1].key, GeometryKey::Curve(MeshId(1)));
        assert_eq!(accel.geometries()[1].primitive_count as usize, CURVE_TRIANGLE_COUNT);
        assert_eq!(accel.instances()[1].material, 2);
        accel.retire(&ctx);
    }

    #[test]
    fn test_rejected_prebuild_query_aborts_load() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            fail_prebuild_query: true,
            ..Default::default()
        }));
        let ctx = context(backend.clone());
        let scene = scene_with(vec![triangle_mesh(1, true)], vec![instance(1, 0, 0.0)]);

        let result = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene);
        assert!(matches!(result, Err(SceneLoadError::Gfx(GfxError::PrebuildQuery(_)))));
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_accel_count(), 0);
        assert_eq!(backend.submission_count(), 0);
    }

    #[test]
    fn test_empty_scene_is_malformed() {
        let backend = Arc::new(HeadlessBackend::default());
        let ctx = context(backend);
        let scene = scene_with(vec![], vec![]);
        assert!(matches!(
            AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene),
            Err(SceneLoadError::Malformed(_))
        ));
    }

    #[test]
    fn test_tlas_swap_waits_for_fence() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        }));
        let ctx = context(backend.clone());
        let scene = scene_with(vec![triangle_mesh(1, true)], vec![instance(1, 0, 0.0), instance(1, 1, 2.0)]);
        let mut accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();
        backend.complete_up_to(accel.ready_fence());

        // 加载只构建一个 TLAS
        let original = *accel.tlas();
        assert!(accel.back_tlas().is_none());
        assert_eq!(backend.live_accel_count(), 2);

        accel.set_instance_transform(1, glam::Mat4::from_translation(glam::Vec3::Y)).unwrap();
        accel.rebuild_if_dirty(&ctx).unwrap();
        assert!(accel.has_pending_rebuild());
        let rebuild_fence = backend.submitted_fence_value();
        let back = *accel.back_tlas().unwrap();
        assert_ne!(back.accel, original.accel);
        assert_ne!(back.slot, original.slot);

        // 一帧读取当前的 front
        let mut frame = ctx.stream_pool().acquire().unwrap();
        frame.begin("frame");
        frame.end();
        let frame_fence = ctx.stream_pool().submit(frame).unwrap();

        // 构建没有完成，继续使用旧的 TLAS
        assert!(!accel.poll_pending(&ctx).unwrap());
        assert_eq!(*accel.tlas(), original);

        // 上一次构建交换之前，新的修改只会保持 dirty
        accel.set_instance_transform(1, glam::Mat4::from_translation(glam::Vec3::Z)).unwrap();
        let submissions = backend.submission_count();
        accel.rebuild_if_dirty(&ctx).unwrap();
        assert_eq!(backend.submission_count(), submissions);

        backend.complete_up_to(rebuild_fence);
        assert!(accel.poll_pending(&ctx).unwrap());
        assert_eq!(*accel.tlas(), back);
        assert_eq!(accel.back_tlas(), Some(&original));
        assert_eq!(accel.generation(), 1);

        // 旧的 front 还在被那一帧读取
        accel.rebuild_if_dirty(&ctx).unwrap();
        assert_eq!(backend.submission_count(), submissions);
        assert!(!accel.has_pending_rebuild());

        backend.complete_up_to(frame_fence);
        accel.rebuild_if_dirty(&ctx).unwrap();
        assert_eq!(backend.submission_count(), submissions + 1);
        backend.complete_up_to(backend.submitted_fence_value());
        assert!(accel.poll_pending(&ctx).unwrap());
        assert_eq!(*accel.tlas(), original);
        assert_eq!(accel.generation(), 2);

        ctx.collect_garbage();
        // 一个 BLAS 加两个 TLAS，交换不会创建新的结构
        assert_eq!(backend.live_accel_count(), 3);
        assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());

        assert!(matches!(
            accel.set_instance_transform(9, glam::Mat4::IDENTITY),
            Err(crate::error::RendererError::InstanceOutOfRange { index: 9, count: 2 })
        ));
        accel.retire(&ctx);
    }

    #[test]
    fn test_rebuilds_reuse_slots_and_scratch() {
        let backend = Arc::new(HeadlessBackend::default());
        let config = RendererConfig {
            resource_table_capacity: 16,
            ..Default::default()
        };
        let ctx = RendererContext::new(backend.clone(), &config);
        let scene = scene_with(vec![triangle_mesh(1, true)], vec![instance(1, 0, 0.0), instance(1, 1, 2.0)]);
        let mut accel = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();
        let scratch_after_load = ctx.scratch().used_bytes();
        let blocks = ctx.scratch().block_count();

        let mut move_instance = |frame: u64| {
            let x = (frame % 7) as f32;
            accel
                .set_instance_transform(1, glam::Mat4::from_translation(glam::vec3(x, 1.0, 0.0)))
                .unwrap();
            accel.rebuild_if_dirty(&ctx).unwrap();
            assert!(accel.poll_pending(&ctx).unwrap());
            ctx.collect_garbage();
            assert!(ctx.scratch().used_bytes() <= scratch_after_load);
            [accel.tlas().slot, accel.back_tlas().unwrap().slot]
        };

        // 第一次重建创建 back
        let mut pair = move_instance(0);
        pair.sort();
        let slots = ctx.resource_table().len();
        let buffers = backend.live_buffer_count();

        // 重建次数远多于 resource table 的容量
        const FRAMES: u64 = 200;
        for frame in 1..FRAMES {
            let mut current = move_instance(frame);
            current.sort();
            assert_eq!(current, pair);
        }
        assert_eq!(accel.generation(), FRAMES);
        assert_eq!(ctx.resource_table().len(), slots);
        assert_eq!(ctx.scratch().block_count(), blocks);
        assert_eq!(backend.live_buffer_count(), buffers);

        // 完整的重新加载同样从 scratch 的起点开始
        let reloaded = AccelBuilder::new(&ctx, hit_group(&ctx)).build(&scene).unwrap();
        assert_eq!(ctx.scratch().used_bytes(), scratch_after_load);
        assert_eq!(ctx.scratch().block_count(), blocks);
        assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());

        accel.retire(&ctx);
        reloaded.retire(&ctx);
        ctx.wait_idle().unwrap();
        assert_eq!(backend.live_accel_count(), 0);
    }
}
