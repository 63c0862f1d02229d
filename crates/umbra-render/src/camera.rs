//! Camera and view management.

use glam::{Mat4, Vec3};

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 500.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            aspect,
            ..Self::default()
        }
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Match the aspect ratio of a `width` x `height` target.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    /// Rotate around `pivot` on the vertical axis by `angle` radians.
    pub fn orbit(&mut self, pivot: Vec3, angle: f32) {
        let offset = glam::Quat::from_rotation_y(angle) * (self.position - pivot);
        self.position = pivot + offset;
        self.look_at(pivot);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Projection with the y axis flipped for Vulkan clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Get camera uniforms for GPU.
    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::from(self)
    }
}

/// Camera uniform buffer data for GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl CameraUniforms {
    /// Size in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        Self {
            view: camera.view_matrix().to_cols_array_2d(),
            projection: camera.projection_matrix().to_cols_array_2d(),
            view_projection: camera.view_projection_matrix().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn target_projects_to_screen_center() {
        let camera = Camera::looking_at(Vec3::new(3.0, 2.0, 6.0), Vec3::ZERO, 1.0);
        let clip = camera.view_projection_matrix() * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y / clip.w, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn up_is_negative_clip_y() {
        let camera = Camera::default();
        let clip = camera.view_projection_matrix() * glam::Vec4::new(0.0, 1.0, 0.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn orbit_keeps_distance() {
        let mut camera = Camera::looking_at(Vec3::new(0.0, 1.0, 4.0), Vec3::ZERO, 1.0);
        let before = camera.position.length();
        camera.orbit(Vec3::ZERO, 1.3);
        assert_relative_eq!(camera.position.length(), before, epsilon = 1e-5);
        assert_relative_eq!(camera.direction.dot(-camera.position.normalize()), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn uniforms_are_tightly_packed() {
        assert_eq!(CameraUniforms::SIZE, 3 * 64 + 16);
        let uniforms = Camera::default().uniforms();
        assert_relative_eq!(uniforms.position[2], 5.0);
    }
}
