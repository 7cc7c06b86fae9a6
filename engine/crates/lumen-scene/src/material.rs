use crate::error::SceneLoadError;
use crate::scene_graph::{MaterialDesc, MaterialParam};

/// 渲染核心支持的材质
///
/// 材质集合是封闭的，加载时由 `MaterialDesc` 一次性转换
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Material {
    Matte {
        albedo: glam::Vec3,
        sigma: f32,
    },
    Plastic {
        diffuse: glam::Vec3,
        specular: glam::Vec3,
        roughness: f32,
    },
    Metal {
        eta: glam::Vec3,
        k: glam::Vec3,
        roughness: f32,
    },
    Glass {
        reflectance: glam::Vec3,
        transmittance: glam::Vec3,
        ior: f32,
    },
    /// 按 amount 在两个材质之间插值
    Mix {
        first: u32,
        second: u32,
        amount: f32,
    },
    Uber {
        diffuse: glam::Vec3,
        specular: glam::Vec3,
        transmittance: glam::Vec3,
        roughness: f32,
        opacity: f32,
        ior: f32,
    },
}

/// 上传到 GPU 的材质，布局与 shader 中的 std430 结构一致
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuMaterial {
    pub kind: u32,
    pub first: u32,
    pub second: u32,
    pub _padding: u32,
    /// rgb + 一个标量参数
    pub color0: [f32; 4],
    pub color1: [f32; 4],
    pub color2: [f32; 4],
}

impl Material {
    pub const KIND_MATTE: u32 = 0;
    pub const KIND_PLASTIC: u32 = 1;
    pub const KIND_METAL: u32 = 2;
    pub const KIND_GLASS: u32 = 3;
    pub const KIND_MIX: u32 = 4;
    pub const KIND_UBER: u32 = 5;

    /// 从加载器的描述转换
    ///
    /// # 参数
    /// - `self_index`: 该材质在材质列表中的位置，mix 不允许引用自身
    /// - `material_count`: 材质列表的长度
    pub fn from_desc(desc: &MaterialDesc, self_index: u32, material_count: u32) -> Result<Self, SceneLoadError> {
        let params = ParamReader { desc };
        let material = match desc.kind.as_str() {
            "matte" => Material::Matte {
                albedo: params.color("albedo", glam::Vec3::splat(0.5))?,
                sigma: params.float("sigma", 0.0)?,
            },
            "plastic" => Material::Plastic {
                diffuse: params.color("diffuse", glam::Vec3::splat(0.25))?,
                specular: params.color("specular", glam::Vec3::splat(0.25))?,
                roughness: params.float("roughness", 0.1)?,
            },
            "metal" => Material::Metal {
                // 铜
                eta: params.color("eta", glam::vec3(0.2, 0.92, 1.1))?,
                k: params.color("k", glam::vec3(3.9, 2.45, 2.14))?,
                roughness: params.float("roughness", 0.01)?,
            },
            "glass" => Material::Glass {
                reflectance: params.color("reflectance", glam::Vec3::ONE)?,
                transmittance: params.color("transmittance", glam::Vec3::ONE)?,
                ior: params.float("ior", 1.5)?,
            },
            "mix" => {
                let first = params.material("first")?;
                let second = params.material("second")?;
                for reference in [first, second] {
                    if reference >= material_count || reference == self_index {
                        return Err(SceneLoadError::Malformed(format!(
                            "mix material {} references invalid material {}",
                            self_index, reference
                        )));
                    }
                }
                Material::Mix {
                    first,
                    second,
                    amount: params.float("amount", 0.5)?.clamp(0.0, 1.0),
                }
            }
            "uber" => Material::Uber {
                diffuse: params.color("diffuse", glam::Vec3::splat(0.25))?,
                specular: params.color("specular", glam::Vec3::splat(0.25))?,
                transmittance: params.color("transmittance", glam::Vec3::ZERO)?,
                roughness: params.float("roughness", 0.1)?,
                opacity: params.float("opacity", 1.0)?,
                ior: params.float("ior", 1.5)?,
            },
            other => return Err(SceneLoadError::UnsupportedMaterial(other.to_string())),
        };
        Ok(material)
    }

    /// 按顺序转换所有材质
    pub fn convert_all(descs: &[MaterialDesc]) -> Result<Vec<Material>, SceneLoadError> {
        let count = descs.len() as u32;
        descs
            .iter()
            .enumerate()
            .map(|(index, desc)| Material::from_desc(desc, index as u32, count))
            .collect()
    }

    pub fn to_gpu(&self) -> GpuMaterial {
        let pack = |rgb: glam::Vec3, w: f32| [rgb.x, rgb.y, rgb.z, w];
        match *self {
            Material::Matte { albedo, sigma } => GpuMaterial {
                kind: Self::KIND_MATTE,
                color0: pack(albedo, sigma),
                ..Default::default()
            },
            Material::Plastic {
                diffuse,
                specular,
                roughness,
            } => GpuMaterial {
                kind: Self::KIND_PLASTIC,
                color0: pack(diffuse, roughness),
                color1: pack(specular, 0.0),
                ..Default::default()
            },
            Material::Metal { eta, k, roughness } => GpuMaterial {
                kind: Self::KIND_METAL,
                color0: pack(eta, roughness),
                color1: pack(k, 0.0),
                ..Default::default()
            },
            Material::Glass {
                reflectance,
                transmittance,
                ior,
            } => GpuMaterial {
                kind: Self::KIND_GLASS,
                color0: pack(reflectance, ior),
                color1: pack(transmittance, 0.0),
                ..Default::default()
            },
            Material::Mix { first, second, amount } => GpuMaterial {
                kind: Self::KIND_MIX,
                first,
                second,
                color0: [0.0, 0.0, 0.0, amount],
                ..Default::default()
            },
            Material::Uber {
                diffuse,
                specular,
                transmittance,
                roughness,
                opacity,
                ior,
            } => GpuMaterial {
                kind: Self::KIND_UBER,
                color0: pack(diffuse, roughness),
                color1: pack(specular, opacity),
                color2: pack(transmittance, ior),
                ..Default::default()
            },
        }
    }
}

struct ParamReader<'a> {
    desc: &'a MaterialDesc,
}

impl ParamReader<'_> {
    fn mismatch(&self, name: &str, expected: &str) -> SceneLoadError {
        SceneLoadError::Malformed(format!("{} parameter `{}` must be a {}", self.desc.kind, name, expected))
    }

    fn float(&self, name: &str, default: f32) -> Result<f32, SceneLoadError> {
        match self.desc.params.get(name) {
            None => Ok(default),
            Some(MaterialParam::Float(value)) => Ok(*value),
            Some(_) => Err(self.mismatch(name, "float")),
        }
    }

    fn color(&self, name: &str, default: glam::Vec3) -> Result<glam::Vec3, SceneLoadError> {
        match self.desc.params.get(name) {
            None => Ok(default),
            Some(MaterialParam::Color(value)) => Ok(*value),
            // 单个标量视为灰度
            Some(MaterialParam::Float(value)) => Ok(glam::Vec3::splat(*value)),
            Some(_) => Err(self.mismatch(name, "color")),
        }
    }

    fn material(&self, name: &str) -> Result<u32, SceneLoadError> {
        match self.desc.params.get(name) {
            Some(MaterialParam::Material(index)) => Ok(*index),
            None => Err(SceneLoadError::Malformed(format!("{} requires parameter `{}`", self.desc.kind, name))),
            Some(_) => Err(self.mismatch(name, "material reference")),
        }
    }
}
