use std::time::Duration;

use crate::camera::Camera;
use crate::error::SceneLoadError;
use crate::scene_graph::{CurveDesc, EnvironmentLight, InstanceDesc, MaterialDesc, MaterialParam, MeshDesc, MeshId, SceneGraph};

/// 场景的来源
///
/// 会被移动到加载线程中执行
pub trait SceneLoader: Send {
    fn name(&self) -> &str;

    fn load(&self) -> Result<SceneGraph, SceneLoadError>;
}

/// 程序化场景的参数
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProceduralSceneParams {
    /// 共享同一个 cube mesh 的实例数量
    pub instance_count: u32,
    pub include_curves: bool,
    /// 为 true 时 load 返回错误，用于演示加载失败
    pub fail: bool,
    /// 模拟耗时的加载
    pub load_delay_ms: u64,
}

impl Default for ProceduralSceneParams {
    fn default() -> Self {
        Self {
            instance_count: 8,
            include_curves: true,
            fail: false,
            load_delay_ms: 0,
        }
    }
}

/// 生成一个地面、若干共享 mesh 的 cube 以及几条曲线
pub struct ProceduralSceneLoader {
    params: ProceduralSceneParams,
}

impl ProceduralSceneLoader {
    pub const GROUND_MESH: MeshId = MeshId(0);
    pub const CUBE_MESH: MeshId = MeshId(1);
    const CURVE_MESH_BASE: u32 = 100;

    pub fn new(params: ProceduralSceneParams) -> Self {
        Self { params }
    }

    fn ground() -> MeshDesc {
        let positions = vec![
            glam::vec3(-10.0, 0.0, -10.0),
            glam::vec3(10.0, 0.0, -10.0),
            glam::vec3(10.0, 0.0, 10.0),
            glam::vec3(-10.0, 0.0, 10.0),
        ];
        MeshDesc {
            id: Self::GROUND_MESH,
            name: "ground".to_string(),
            normals: Some(vec![glam::Vec3::Y; 4]),
            uvs: Some(vec![glam::vec2(0.0, 0.0), glam::vec2(1.0, 0.0), glam::vec2(1.0, 1.0), glam::vec2(0.0, 1.0)]),
            positions,
            indices: vec![0, 2, 1, 0, 3, 2],
            tangents: None,
        }
    }

    /// 没有法线，上传时会生成面法线
    fn cube() -> MeshDesc {
        let positions = (0..8)
            .map(|i| glam::vec3((i & 1) as f32, ((i >> 1) & 1) as f32, ((i >> 2) & 1) as f32) - glam::Vec3::splat(0.5))
            .collect();
        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
        ];
        MeshDesc {
            id: Self::CUBE_MESH,
            name: "cube".to_string(),
            positions,
            indices,
            ..Default::default()
        }
    }

    fn materials() -> Vec<MaterialDesc> {
        vec![
            MaterialDesc::new("matte").with("albedo", MaterialParam::Color(glam::vec3(0.7, 0.7, 0.7))),
            MaterialDesc::new("plastic").with("diffuse", MaterialParam::Color(glam::vec3(0.8, 0.2, 0.2))),
            MaterialDesc::new("metal").with("roughness", MaterialParam::Float(0.05)),
            MaterialDesc::new("glass").with("ior", MaterialParam::Float(1.45)),
            MaterialDesc::new("mix")
                .with("first", MaterialParam::Material(1))
                .with("second", MaterialParam::Material(2))
                .with("amount", MaterialParam::Float(0.3)),
            MaterialDesc::new("uber").with("opacity", MaterialParam::Float(0.8)),
        ]
    }
}

impl SceneLoader for ProceduralSceneLoader {
    fn name(&self) -> &str {
        "procedural"
    }

    fn load(&self) -> Result<SceneGraph, SceneLoadError> {
        let _span = tracy_client::span!("ProceduralSceneLoader::load");
        if self.params.load_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.params.load_delay_ms));
        }
        if self.params.fail {
            return Err(SceneLoadError::Malformed("procedural scene configured to fail".to_string()));
        }

        let materials = Self::materials();
        let material_count = materials.len() as u32;

        let mut instances = vec![InstanceDesc {
            mesh: Self::GROUND_MESH,
            material: 0,
            transform: glam::Mat4::IDENTITY,
            emission: None,
        }];
        let columns = (self.params.instance_count as f32).sqrt().ceil().max(1.0) as u32;
        instances.extend((0..self.params.instance_count).map(|i| {
            let (row, column) = (i / columns, i % columns);
            let offset = glam::vec3(column as f32 * 1.5, 0.5, row as f32 * -1.5);
            InstanceDesc {
                mesh: Self::CUBE_MESH,
                material: 1 + i % (material_count - 1),
                transform: glam::Mat4::from_translation(offset),
                // 每隔 5 个放一个发光体
                emission: (i % 5 == 4).then_some(glam::Vec3::splat(4.0)),
            }
        }));

        let curves = if self.params.include_curves {
            (0..3)
                .map(|i| CurveDesc {
                    id: MeshId(Self::CURVE_MESH_BASE + i),
                    control_points: [
                        glam::vec3(0.0, 0.0, 0.0),
                        glam::vec3(0.2, 0.6, 0.0),
                        glam::vec3(-0.2, 1.2, 0.1),
                        glam::vec3(0.1, 1.8, 0.0),
                    ],
                    radius: 0.03,
                    material: 0,
                    transform: glam::Mat4::from_translation(glam::vec3(-2.0 - i as f32 * 0.3, 0.0, 1.0)),
                })
                .collect()
        } else {
            vec![]
        };

        let scene = SceneGraph {
            meshes: vec![Self::ground(), Self::cube()],
            materials,
            instances,
            curves,
            camera: Camera::default(),
            environment: EnvironmentLight {
                image: "sky".to_string(),
                ..Default::default()
            },
        };
        scene.validate()?;

        log::info!(
            "procedural scene generated: {} meshes, {} instances, {} curves",
            scene.meshes.len(),
            scene.instances.len(),
            scene.curves.len()
        );
        Ok(scene)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::Material;

    #[test]
    fn test_procedural_scene_is_valid() {
        let loader = ProceduralSceneLoader::new(ProceduralSceneParams::default());
        let scene = loader.load().unwrap();
        assert_eq!(scene.instances.len(), 9);
        assert_eq!(scene.curves.len(), 3);
        assert_eq!(scene.instance_count(), 12);
        assert!(Material::convert_all(&scene.materials).is_ok());
        assert!(scene.instances.iter().any(|i| i.emission.is_some()));
    }

    #[test]
    fn test_without_curves() {
        let loader = ProceduralSceneLoader::new(ProceduralSceneParams {
            instance_count: 3,
            include_curves: false,
            ..Default::default()
        });
        let scene = loader.load().unwrap();
        assert!(scene.curves.is_empty());
        assert_eq!(scene.instances.iter().filter(|i| i.mesh == ProceduralSceneLoader::CUBE_MESH).count(), 3);
    }

    #[test]
    fn test_failure_flag() {
        let loader = ProceduralSceneLoader::new(ProceduralSceneParams {
            fail: true,
            ..Default::default()
        });
        assert!(matches!(loader.load(), Err(SceneLoadError::Malformed(_))));
    }

    #[test]
    fn test_params_from_partial_toml() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            scene: ProceduralSceneParams,
        }
        let wrapper: Wrapper = toml::from_str("[scene]\ninstance_count = 2\n").unwrap();
        assert_eq!(wrapper.scene.instance_count, 2);
        assert!(wrapper.scene.include_curves);
    }
}
