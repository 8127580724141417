//! Host-side mirror of the shader math: cube texel directions, the equirectangular lookup and
//! the low-discrepancy/GGX sampling helpers shared by the convolution and BRDF code.

use glam::{Vec2, Vec3, Vec4};
use std::f32::consts::{PI, TAU};

use crate::hdr::HdrImage;

pub const CUBE_FACE_COUNT: u32 = 6;

/// Direction through the centre of texel `(x, y)` of `face`, using the Vulkan cube convention
/// (layer order +X, -X, +Y, -Y, +Z, -Z, image rows top to bottom).
pub fn face_direction(face: u32, x: u32, y: u32, side: u32) -> Vec3 {
    let u = 2.0 * (x as f32 + 0.5) / side as f32 - 1.0;
    let v = 2.0 * (y as f32 + 0.5) / side as f32 - 1.0;
    match face {
        0 => Vec3::new(1.0, -v, -u),
        1 => Vec3::new(-1.0, -v, u),
        2 => Vec3::new(u, 1.0, v),
        3 => Vec3::new(u, -1.0, -v),
        4 => Vec3::new(u, -v, 1.0),
        _ => Vec3::new(-u, -v, -1.0),
    }
    .normalize()
}

/// Face whose major axis matches `dir`.
pub fn dominant_face(dir: Vec3) -> u32 {
    let a = dir.abs();
    if a.x >= a.y && a.x >= a.z {
        if dir.x >= 0.0 { 0 } else { 1 }
    } else if a.y >= a.z {
        if dir.y >= 0.0 { 2 } else { 3 }
    } else if dir.z >= 0.0 {
        4
    } else {
        5
    }
}

/// Equirectangular texture coordinate for `dir`. `u` wraps around the horizon starting at -X,
/// `v` runs from +Y (0) to -Y (1). `flip_y` negates the vertical axis first.
pub fn direction_to_equirect_uv(dir: Vec3, flip_y: bool) -> Vec2 {
    let mut d = dir.normalize();
    if flip_y {
        d.y = -d.y;
    }
    let u = d.z.atan2(d.x) / TAU + 0.5;
    let v = d.y.clamp(-1.0, 1.0).acos() / PI;
    Vec2::new(u, v)
}

/// Bilinear lookup with the sampler the projector uses: repeat in u, clamp in v.
pub fn sample_equirect(image: &HdrImage, uv: Vec2) -> Vec4 {
    let x = uv.x * image.width as f32 - 0.5;
    let y = (uv.y * image.height as f32 - 0.5).clamp(0.0, (image.height - 1) as f32);
    let x0 = x.floor();
    let y0 = y.floor();
    let tx = x - x0;
    let ty = y - y0;

    let w = image.width as i64;
    let ix0 = (x0 as i64).rem_euclid(w) as u32;
    let ix1 = (x0 as i64 + 1).rem_euclid(w) as u32;
    let iy0 = y0 as u32;
    let iy1 = (iy0 + 1).min(image.height - 1);

    let c0 = image.pixel(ix0, iy0).lerp(image.pixel(ix1, iy0), tx);
    let c1 = image.pixel(ix0, iy1).lerp(image.pixel(ix1, iy1), tx);
    c0.lerp(c1, ty)
}

pub fn radical_inverse_vdc(bits: u32) -> f32 {
    bits.reverse_bits() as f32 * 2.328_306_4e-10
}

pub fn hammersley(i: u32, n: u32) -> Vec2 {
    Vec2::new(i as f32 / n as f32, radical_inverse_vdc(i))
}

/// Orthonormal basis around `n`, returning `v` expressed in world space.
pub fn tangent_to_world(n: Vec3, v: Vec3) -> Vec3 {
    let up = if n.z.abs() < 0.999 { Vec3::Z } else { Vec3::X };
    let tangent = up.cross(n).normalize();
    let bitangent = n.cross(tangent);
    tangent * v.x + bitangent * v.y + n * v.z
}

/// GGX half vector around `n` for perceptual `roughness` (alpha = roughness^2).
pub fn importance_sample_ggx(xi: Vec2, n: Vec3, roughness: f32) -> Vec3 {
    let a = roughness * roughness;
    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let h = Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta);
    tangent_to_world(n, h).normalize()
}

pub fn reflect(i: Vec3, n: Vec3) -> Vec3 {
    i - 2.0 * i.dot(n) * n
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn face_centres_point_along_axes() {
        let axes = [Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y, Vec3::Z, -Vec3::Z];
        for (face, axis) in axes.iter().enumerate() {
            // Even side: average the four centre texels
            let side = 8;
            let mut sum = Vec3::ZERO;
            for (x, y) in [(3, 3), (4, 3), (3, 4), (4, 4)] {
                sum += face_direction(face as u32, x, y, side);
            }
            let dir = sum.normalize();
            assert!((dir - *axis).length() < EPS, "face {} -> {:?}", face, dir);
        }
    }

    #[test]
    fn every_texel_belongs_to_its_own_face() {
        let side = 16;
        for face in 0..CUBE_FACE_COUNT {
            for y in 0..side {
                for x in 0..side {
                    assert_eq!(dominant_face(face_direction(face, x, y, side)), face);
                }
            }
        }
    }

    #[test]
    fn top_row_of_side_faces_looks_up() {
        for face in [0, 1, 4, 5] {
            let top = face_direction(face, 4, 0, 8);
            let bottom = face_direction(face, 4, 7, 8);
            assert!(top.y > 0.0 && bottom.y < 0.0);
        }
    }

    #[test]
    fn equirect_uv_of_cardinal_directions() {
        let uv = direction_to_equirect_uv(Vec3::X, false);
        assert!((uv - Vec2::new(0.5, 0.5)).length() < EPS);

        let uv = direction_to_equirect_uv(Vec3::Z, false);
        assert!((uv - Vec2::new(0.75, 0.5)).length() < EPS);

        let uv = direction_to_equirect_uv(-Vec3::Z, false);
        assert!((uv - Vec2::new(0.25, 0.5)).length() < EPS);

        assert!(direction_to_equirect_uv(Vec3::Y, false).y.abs() < EPS);
        assert!((direction_to_equirect_uv(-Vec3::Y, false).y - 1.0).abs() < EPS);
    }

    #[test]
    fn flip_y_mirrors_latitude_only() {
        let dir = Vec3::new(0.3, 0.7, -0.2).normalize();
        let a = direction_to_equirect_uv(dir, false);
        let b = direction_to_equirect_uv(dir, true);
        assert!((a.x - b.x).abs() < EPS);
        assert!((a.y + b.y - 1.0).abs() < EPS);
    }

    #[test]
    fn hammersley_sequence_is_stratified() {
        assert_eq!(hammersley(0, 4), Vec2::new(0.0, 0.0));
        assert!((hammersley(1, 4).y - 0.5).abs() < EPS);
        assert!((hammersley(2, 4).y - 0.25).abs() < EPS);
        assert!((hammersley(3, 4).y - 0.75).abs() < EPS);
    }

    #[test]
    fn ggx_at_zero_roughness_returns_normal() {
        let n = Vec3::new(0.2, -0.5, 0.8).normalize();
        for i in 0..16 {
            let h = importance_sample_ggx(hammersley(i, 16), n, 0.0);
            assert!((h - n).length() < 1e-3);
        }
    }

    #[test]
    fn tangent_basis_is_orthonormal() {
        for n in [Vec3::Z, -Vec3::Z, Vec3::X, Vec3::new(1.0, 2.0, 3.0).normalize()] {
            let t = tangent_to_world(n, Vec3::X);
            let b = tangent_to_world(n, Vec3::Y);
            assert!(t.dot(n).abs() < EPS && b.dot(n).abs() < EPS && t.dot(b).abs() < EPS);
            assert!((t.length() - 1.0).abs() < EPS);
        }
    }
}
