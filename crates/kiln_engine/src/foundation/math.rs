//! Math types and the Vulkan-convention camera matrices.
//!
//! Thin aliases over nalgebra plus the projection fix-up for Vulkan clip
//! space (y-down, z in [0, 1]).

pub use nalgebra::{Matrix4, Point3, Vector3, Vector4};

/// 3-component f32 vector.
pub type Vec3 = Vector3<f32>;
/// 4-component f32 vector.
pub type Vec4 = Vector4<f32>;
/// 4x4 f32 matrix (column-major, as uploaded to the GPU).
pub type Mat4 = Matrix4<f32>;

/// Vertical field of view of the mesh path, radians.
pub const FOV_Y: f32 = std::f32::consts::FRAC_PI_4;
/// Near plane distance.
pub const Z_NEAR: f32 = 0.1;
/// Far plane distance.
pub const Z_FAR: f32 = 100.0;

/// Symmetric perspective projection corrected for Vulkan clip space.
///
/// Starts from the GL-convention matrix, then negates the y scale (clip y
/// points down) and remaps depth from [-1, 1] to [0, 1].
pub fn perspective_vk(aspect: f32) -> Mat4 {
    let mut m = nalgebra::Perspective3::new(aspect, FOV_Y, Z_NEAR, Z_FAR).to_homogeneous();
    m[(1, 1)] = -m[(1, 1)];
    m[(2, 2)] = 0.5 * (m[(2, 2)] - 1.0);
    m[(2, 3)] = 0.5 * m[(2, 3)];
    m
}

/// Right-handed look-at view matrix with up = +Y.
pub fn look_at(eye: Vec3, target: Vec3) -> Mat4 {
    Mat4::look_at_rh(
        &Point3::from(eye),
        &Point3::from(target),
        &Vec3::new(0.0, 1.0, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn project(m: &Mat4, p: Vec3) -> Vec3 {
        let clip = m * Vec4::new(p.x, p.y, p.z, 1.0);
        Vec3::new(clip.x / clip.w, clip.y / clip.w, clip.z / clip.w)
    }

    #[test]
    fn projection_flips_y() {
        let m = perspective_vk(1.0);
        assert!(m[(1, 1)] < 0.0, "clip-space y points down");
    }

    #[test]
    fn depth_maps_near_to_zero_and_far_to_one() {
        let m = perspective_vk(16.0 / 9.0);
        // View space looks down -Z in a right-handed frame.
        let near = project(&m, Vec3::new(0.0, 0.0, -Z_NEAR));
        let far = project(&m, Vec3::new(0.0, 0.0, -Z_FAR));
        assert_relative_eq!(near.z, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn look_at_is_right_handed() {
        let view = look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros());
        // The eye looks down -Z: a point in front of the camera lands at
        // negative view-space z.
        let p = view * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(p.z < 0.0);
        // And the eye itself maps to the origin.
        let eye = view * Vec4::new(0.0, 0.0, 5.0, 1.0);
        assert_relative_eq!(eye.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(eye.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(eye.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn world_x_stays_right_on_screen_after_flip() {
        let proj = perspective_vk(1.0);
        let view = look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros());
        let p = project(&(proj * view), Vec3::new(1.0, 0.0, 0.0));
        assert!(p.x > 0.0);
        // +Y world maps to negative (up) clip y under the Vulkan flip.
        let q = project(&(proj * view), Vec3::new(0.0, 1.0, 0.0));
        assert!(q.y < 0.0);
    }
}
