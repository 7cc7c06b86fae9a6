use std::collections::{BTreeMap, HashSet};

use crate::camera::Camera;
use crate::error::SceneLoadError;

/// mesh 的来源标识，用于 geometry 去重
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

/// 场景中的三角形网格
///
/// 顶点属性按索引对齐；normals 缺失时会在上传时生成面法线
#[derive(Clone, Debug, Default)]
pub struct MeshDesc {
    pub id: MeshId,
    pub name: String,
    pub positions: Vec<glam::Vec3>,
    pub normals: Option<Vec<glam::Vec3>>,
    pub uvs: Option<Vec<glam::Vec2>>,
    pub tangents: Option<Vec<glam::Vec4>>,
    pub indices: Vec<u32>,
}

impl MeshDesc {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn validate(&self) -> Result<(), SceneLoadError> {
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(SceneLoadError::Malformed(format!(
                "mesh {} has {} indices, expected a non-empty multiple of 3",
                self.name,
                self.indices.len()
            )));
        }
        let vertex_count = self.positions.len();
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(SceneLoadError::Malformed(format!(
                "mesh {} index {} out of range ({} vertices)",
                self.name, bad, vertex_count
            )));
        }

        let attribute_len_ok = |len: Option<usize>| len.is_none_or(|len| len == vertex_count);
        if !attribute_len_ok(self.normals.as_ref().map(Vec::len))
            || !attribute_len_ok(self.uvs.as_ref().map(Vec::len))
            || !attribute_len_ok(self.tangents.as_ref().map(Vec::len))
        {
            return Err(SceneLoadError::Malformed(format!(
                "mesh {} has vertex attributes that do not match {} positions",
                self.name, vertex_count
            )));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MaterialParam {
    Float(f32),
    Color(glam::Vec3),
    /// 引用材质列表中的另一个材质，用于 mix
    Material(u32),
}

/// 加载器给出的原始材质描述：类型名 + 具名参数
#[derive(Clone, Debug, Default)]
pub struct MaterialDesc {
    pub kind: String,
    pub params: BTreeMap<String, MaterialParam>,
}

impl MaterialDesc {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, param: MaterialParam) -> Self {
        self.params.insert(name.into(), param);
        self
    }
}

/// 场景中的一次放置
#[derive(Clone, Debug)]
pub struct InstanceDesc {
    pub mesh: MeshId,
    pub material: u32,
    pub transform: glam::Mat4,
    /// 非空时该实例是面光源
    pub emission: Option<glam::Vec3>,
}

/// 三次 bezier 曲线，会被细分为管状的三角形网格
#[derive(Clone, Debug)]
pub struct CurveDesc {
    pub id: MeshId,
    pub control_points: [glam::Vec3; 4],
    pub radius: f32,
    pub material: u32,
    pub transform: glam::Mat4,
}

#[derive(Clone, Debug)]
pub struct EnvironmentLight {
    pub image: String,
    pub transform: glam::Mat4,
    pub color_scale: glam::Vec3,
}

impl Default for EnvironmentLight {
    fn default() -> Self {
        Self {
            image: String::new(),
            transform: glam::Mat4::IDENTITY,
            color_scale: glam::Vec3::ONE,
        }
    }
}

/// 加载器产生的完整场景
///
/// 渲染核心只在上传期间持有它的引用
#[derive(Clone, Debug, Default)]
pub struct SceneGraph {
    pub meshes: Vec<MeshDesc>,
    pub materials: Vec<MaterialDesc>,
    pub instances: Vec<InstanceDesc>,
    pub curves: Vec<CurveDesc>,
    pub camera: Camera,
    pub environment: EnvironmentLight,
}

impl SceneGraph {
    pub fn mesh(&self, id: MeshId) -> Option<&MeshDesc> {
        self.meshes.iter().find(|mesh| mesh.id == id)
    }

    /// 实例总数，曲线也算作实例
    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instances.len() + self.curves.len()
    }

    /// 检查所有引用和索引是否有效
    pub fn validate(&self) -> Result<(), SceneLoadError> {
        let _span = tracy_client::span!("SceneGraph::validate");

        let mut ids = HashSet::new();
        for mesh in &self.meshes {
            if !ids.insert(mesh.id) {
                return Err(SceneLoadError::Malformed(format!("duplicate mesh id {:?}", mesh.id)));
            }
            mesh.validate()?;
        }
        for curve in &self.curves {
            if !ids.insert(curve.id) {
                return Err(SceneLoadError::Malformed(format!("duplicate mesh id {:?} on curve", curve.id)));
            }
        }

        let material_count = self.materials.len() as u32;
        for (index, instance) in self.instances.iter().enumerate() {
            if self.mesh(instance.mesh).is_none() {
                return Err(SceneLoadError::Malformed(format!(
                    "instance {} references missing mesh {:?}",
                    index, instance.mesh
                )));
            }
            if instance.material >= material_count {
                return Err(SceneLoadError::Malformed(format!(
                    "instance {} references material {} of {}",
                    index, instance.material, material_count
                )));
            }
        }
        if let Some(curve) = self.curves.iter().find(|curve| curve.material >= material_count) {
            return Err(SceneLoadError::Malformed(format!(
                "curve {:?} references material {} of {}",
                curve.id, curve.material, material_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(id: u32) -> MeshDesc {
        MeshDesc {
            id: MeshId(id),
            name: format!("tri-{id}"),
            positions: vec![glam::Vec3::ZERO, glam::Vec3::X, glam::Vec3::Y],
            indices: vec![0, 1, 2],
            ..Default::default()
        }
    }

    fn scene() -> SceneGraph {
        SceneGraph {
            meshes: vec![triangle(0)],
            materials: vec![MaterialDesc::new("matte")],
            instances: vec![InstanceDesc {
                mesh: MeshId(0),
                material: 0,
                transform: glam::Mat4::IDENTITY,
                emission: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_scene() {
        assert!(scene().validate().is_ok());
    }

    #[test]
    fn test_index_out_of_range() {
        let mut scene = scene();
        scene.meshes[0].indices = vec![0, 1, 5];
        assert!(matches!(scene.validate(), Err(SceneLoadError::Malformed(_))));
    }

    #[test]
    fn test_missing_mesh_and_material() {
        let mut scene = scene();
        scene.instances[0].mesh = MeshId(7);
        assert!(matches!(scene.validate(), Err(SceneLoadError::Malformed(_))));

        let mut scene = self::scene();
        scene.instances[0].material = 3;
        assert!(matches!(scene.validate(), Err(SceneLoadError::Malformed(_))));
    }

    #[test]
    fn test_duplicate_mesh_id() {
        let mut scene = scene();
        scene.meshes.push(triangle(0));
        assert!(matches!(scene.validate(), Err(SceneLoadError::Malformed(_))));
    }

    #[test]
    fn test_attribute_length_mismatch() {
        let mut scene = scene();
        scene.meshes[0].normals = Some(vec![glam::Vec3::Z]);
        assert!(scene.validate().is_err());
    }
}
