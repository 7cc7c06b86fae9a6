//! 上传前的顶点准备：曲线细分、面法线展开、顶点打包

use itertools::Itertools;

use crate::error::SceneLoadError;
use crate::scene_graph::{CurveDesc, MeshDesc, MeshId};

/// 曲线每一圈的顶点数
pub const SEGMENTS_PER_LOOP: usize = 8;
/// 每条曲线沿长度方向的圈数
pub const LOOPS_PER_CURVE: usize = 16;

/// 一条曲线细分后的三角形数量
pub const CURVE_TRIANGLE_COUNT: usize = (LOOPS_PER_CURVE - 1) * SEGMENTS_PER_LOOP * 2;

/// 上传到 GPU 的顶点
///
/// position 位于最前面，BLAS 构建直接以 `R32G32B32_SFLOAT` 读取
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl GpuVertex {
    pub const STRIDE: u64 = size_of::<Self>() as u64;
}

/// 可以直接写入 staging buffer 的 mesh
#[derive(Clone, Debug)]
pub struct PreparedMesh {
    pub id: MeshId,
    pub name: String,
    pub vertices: Vec<GpuVertex>,
    pub indices: Vec<u32>,
}

impl PreparedMesh {
    #[inline]
    pub fn primitive_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    #[inline]
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    #[inline]
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

/// 把 mesh 转换为 GPU 顶点
///
/// 没有法线时按三角形展开顶点，每个面独占三个顶点并使用面法线
pub fn prepare_mesh(mesh: &MeshDesc) -> PreparedMesh {
    let uv_of = |i: usize| mesh.uvs.as_ref().map_or([0.0; 2], |uvs| uvs[i].to_array());

    let (vertices, indices) = match &mesh.normals {
        Some(normals) => {
            let vertices = (0..mesh.positions.len())
                .map(|i| GpuVertex {
                    position: mesh.positions[i].to_array(),
                    normal: normals[i].to_array(),
                    uv: uv_of(i),
                })
                .collect_vec();
            (vertices, mesh.indices.clone())
        }
        None => {
            let vertices = mesh
                .indices
                .iter()
                .tuples()
                .flat_map(|(&a, &b, &c)| {
                    let [pa, pb, pc] = [a, b, c].map(|i| mesh.positions[i as usize]);
                    let normal = face_normal(pa, pb, pc).to_array();
                    [a, b, c].map(|i| GpuVertex {
                        position: mesh.positions[i as usize].to_array(),
                        normal,
                        uv: uv_of(i as usize),
                    })
                })
                .collect_vec();
            let indices = (0..vertices.len() as u32).collect_vec();
            (vertices, indices)
        }
    };

    PreparedMesh {
        id: mesh.id,
        name: mesh.name.clone(),
        vertices,
        indices,
    }
}

/// 退化三角形的法线为 0
fn face_normal(a: glam::Vec3, b: glam::Vec3, c: glam::Vec3) -> glam::Vec3 {
    (b - a).cross(c - a).normalize_or_zero()
}

fn bezier(p: &[glam::Vec3; 4], t: f32) -> glam::Vec3 {
    let s = 1.0 - t;
    p[0] * (s * s * s) + p[1] * (3.0 * s * s * t) + p[2] * (3.0 * s * t * t) + p[3] * (t * t * t)
}

fn bezier_tangent(p: &[glam::Vec3; 4], t: f32) -> glam::Vec3 {
    let s = 1.0 - t;
    (p[1] - p[0]) * (3.0 * s * s) + (p[2] - p[1]) * (6.0 * s * t) + (p[3] - p[2]) * (3.0 * t * t)
}

/// 把曲线细分为管状的三角形环带
///
/// 沿曲线取 `LOOPS_PER_CURVE` 圈，每圈 `SEGMENTS_PER_LOOP` 个顶点，相邻两圈之间连成三角形。
/// 结果只依赖控制点和半径。
pub fn tessellate_curve(curve: &CurveDesc) -> Result<MeshDesc, SceneLoadError> {
    let points = &curve.control_points;
    let chord = points[3] - points[0];
    if curve.radius.is_nan() || curve.radius <= 0.0 {
        return Err(SceneLoadError::UnsupportedGeometry(format!(
            "curve {:?} has non-positive radius {}",
            curve.id, curve.radius
        )));
    }
    if points.iter().all(|p| p.distance_squared(points[0]) < 1e-12) {
        return Err(SceneLoadError::UnsupportedGeometry(format!("curve {:?} is degenerate", curve.id)));
    }

    let mut positions = Vec::with_capacity(LOOPS_PER_CURVE * SEGMENTS_PER_LOOP);
    let mut normals = Vec::with_capacity(LOOPS_PER_CURVE * SEGMENTS_PER_LOOP);
    let mut uvs = Vec::with_capacity(LOOPS_PER_CURVE * SEGMENTS_PER_LOOP);

    for ring in 0..LOOPS_PER_CURVE {
        let t = ring as f32 / (LOOPS_PER_CURVE - 1) as f32;
        let center = bezier(points, t);
        let tangent = bezier_tangent(points, t).try_normalize().or_else(|| chord.try_normalize()).unwrap_or(glam::Vec3::Z);

        let reference = if tangent.dot(glam::Vec3::Y).abs() > 0.99 { glam::Vec3::X } else { glam::Vec3::Y };
        let normal = tangent.cross(reference).normalize();
        let binormal = tangent.cross(normal);

        for segment in 0..SEGMENTS_PER_LOOP {
            let theta = segment as f32 / SEGMENTS_PER_LOOP as f32 * std::f32::consts::TAU;
            let direction = normal * theta.cos() + binormal * theta.sin();
            positions.push(center + direction * curve.radius);
            normals.push(direction);
            uvs.push(glam::vec2(segment as f32 / SEGMENTS_PER_LOOP as f32, t));
        }
    }

    let mut indices = Vec::with_capacity(CURVE_TRIANGLE_COUNT * 3);
    for ring in 0..LOOPS_PER_CURVE - 1 {
        for segment in 0..SEGMENTS_PER_LOOP {
            let a = (ring * SEGMENTS_PER_LOOP + segment) as u32;
            let b = (ring * SEGMENTS_PER_LOOP + (segment + 1) % SEGMENTS_PER_LOOP) as u32;
            let c = a + SEGMENTS_PER_LOOP as u32;
            let d = b + SEGMENTS_PER_LOOP as u32;
            indices.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }

    Ok(MeshDesc {
        id: curve.id,
        name: format!("curve-{}", curve.id.0),
        positions,
        normals: Some(normals),
        uvs: Some(uvs),
        tangents: None,
        indices,
    })
}
