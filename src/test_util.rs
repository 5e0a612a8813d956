// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 测试用合成帧
use image::{Rgb, RgbImage};

fn noise(x: i64, y: i64) -> u8 {
    let mut h = (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 32;
    (h & 0xFF) as u8
}

/// Blocky noise texture that slides by `shift` pixels per frame.
pub fn textured_frames(count: usize, width: u32, height: u32, shift: (i64, i64)) -> Vec<RgbImage> {
    (0..count as i64)
        .map(|i| {
            RgbImage::from_fn(width, height, |x, y| {
                let sx = x as i64 - shift.0 * i;
                let sy = y as i64 - shift.1 * i;
                let v = noise(sx.div_euclid(4), sy.div_euclid(4));
                Rgb([v, v / 2 + 64, 255 - v])
            })
        })
        .collect()
}
