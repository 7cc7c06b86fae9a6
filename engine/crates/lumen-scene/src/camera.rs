/// 场景中唯一的相机
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Camera {
    pub position: glam::Vec3,
    pub look_at: glam::Vec3,
    pub up: glam::Vec3,
    /// 垂直方向的视角，单位为度
    pub fov_y_deg: f32,
    /// 为 0 时是针孔相机
    pub lens_radius: f32,
    pub focal_distance: f32,
}

/// 传给 shader 的相机基向量
///
/// - `u`: 屏幕右方向，长度为半宽
/// - `v`: 屏幕上方向，长度为半高
/// - `w`: 看向的方向，单位长度
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraBasis {
    pub origin: glam::Vec3,
    pub u: glam::Vec3,
    pub v: glam::Vec3,
    pub w: glam::Vec3,
}

impl Camera {
    pub fn forward(&self) -> glam::Vec3 {
        (self.look_at - self.position).normalize_or_zero()
    }

    pub fn view_matrix(&self) -> glam::Mat4 {
        glam::Mat4::look_at_rh(self.position, self.look_at, self.up)
    }

    pub fn basis(&self, aspect: f32) -> CameraBasis {
        let w = self.forward();
        let right = w.cross(self.up).normalize_or_zero();
        let up = right.cross(w);

        let half_height = (self.fov_y_deg.to_radians() * 0.5).tan();
        let half_width = half_height * aspect;
        CameraBasis {
            origin: self.position,
            u: right * half_width,
            v: up * half_height,
            w,
        }
    }

    /// 绕 look_at 点水平旋转
    pub fn orbit(&mut self, angle_deg: f32) {
        let rotation = glam::Mat3::from_axis_angle(self.up.normalize_or_zero(), angle_deg.to_radians());
        self.position = self.look_at + rotation * (self.position - self.look_at);
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: glam::vec3(0.0, 2.0, 8.0),
            look_at: glam::Vec3::ZERO,
            up: glam::Vec3::Y,
            fov_y_deg: 45.0,
            lens_radius: 0.0,
            focal_distance: 8.0,
        }
    }
}
