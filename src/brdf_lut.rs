//! Split-sum BRDF integration table.
//!
//! Texel `(x, y)` holds the Fresnel scale (red) and bias (green) for `N.V = (x + 0.5) / size`
//! and roughness `(y + 0.5) / size`.

use glam::{Vec3, Vec4};

use crate::cubemap_math::{hammersley, importance_sample_ggx, reflect};
use crate::hdr::HdrImage;

pub const BRDF_LUT_SIZE: u32 = 512;
pub const BRDF_LUT_SAMPLES: u32 = 1024;

/// Schlick-GGX with the image-based-lighting remap `k = roughness^2 / 2`.
fn geometry_schlick_ggx(n_dot_v: f32, roughness: f32) -> f32 {
    let k = roughness * roughness * 0.5;
    n_dot_v / (n_dot_v * (1.0 - k) + k)
}

fn geometry_smith(n_dot_v: f32, n_dot_l: f32, roughness: f32) -> f32 {
    geometry_schlick_ggx(n_dot_v, roughness) * geometry_schlick_ggx(n_dot_l, roughness)
}

/// Returns `(scale, bias)` such that the specular response is `F0 * scale + bias`.
pub fn integrate_brdf(n_dot_v: f32, roughness: f32, samples: u32) -> (f32, f32) {
    let n = Vec3::Z;
    let v = Vec3::new((1.0 - n_dot_v * n_dot_v).max(0.0).sqrt(), 0.0, n_dot_v);

    let mut a = 0.0f32;
    let mut b = 0.0f32;
    for i in 0..samples {
        let h = importance_sample_ggx(hammersley(i, samples), n, roughness);
        let l = reflect(-v, h);

        let n_dot_l = l.z.max(0.0);
        let n_dot_h = h.z.max(0.0);
        let v_dot_h = v.dot(h).max(0.0);

        if n_dot_l > 0.0 {
            let g = geometry_smith(n_dot_v, n_dot_l, roughness);
            let g_vis = g * v_dot_h / (n_dot_h * n_dot_v).max(1e-4);
            let fc = (1.0 - v_dot_h).powi(5);
            a += (1.0 - fc) * g_vis;
            b += fc * g_vis;
        }
    }

    let inv = 1.0 / samples.max(1) as f32;
    (a * inv, b * inv)
}

pub fn generate_brdf_lut(size: u32, samples: u32) -> HdrImage {
    HdrImage::from_fn(size, size, |x, y| {
        let n_dot_v = (x as f32 + 0.5) / size as f32;
        let roughness = (y as f32 + 0.5) / size as f32;
        let (scale, bias) = integrate_brdf(n_dot_v, roughness, samples);
        Vec4::new(scale, bias, 0.0, 1.0)
    })
}
