// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 相关滤波跟踪器 (MOSSE)
//!
//! 状态: 目标中心/尺寸 + 频域滤波器分子 A / 分母 B
//! 每帧: 采样窗口 → 预处理 → FFT → 与滤波器相关 → 峰值与PSR → 位移 → 在线更新

use std::f32::consts::PI;
use std::sync::Arc;

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use ndarray::Array2;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use tracing::trace;

use super::{BackendKind, Tracker};
use crate::config::LocalTrackerConfig;
use crate::error::{Result, TrackError};
use crate::types::RectF;

// ========== 二维FFT ==========

/// 行列分离的二维FFT
struct Fft2d {
    row_fwd: Arc<dyn Fft<f32>>,
    row_inv: Arc<dyn Fft<f32>>,
    col_fwd: Arc<dyn Fft<f32>>,
    col_inv: Arc<dyn Fft<f32>>,
}

impl Fft2d {
    fn new(rows: usize, cols: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            row_fwd: planner.plan_fft_forward(cols),
            row_inv: planner.plan_fft_inverse(cols),
            col_fwd: planner.plan_fft_forward(rows),
            col_inv: planner.plan_fft_inverse(rows),
        }
    }

    fn forward(&self, data: &mut Array2<Complex32>) {
        Self::apply(data, &*self.row_fwd, &*self.col_fwd);
    }

    /// 归一化的逆变换
    fn inverse(&self, data: &mut Array2<Complex32>) {
        Self::apply(data, &*self.row_inv, &*self.col_inv);
        let n = data.len() as f32;
        data.mapv_inplace(|v| v / n);
    }

    fn apply(data: &mut Array2<Complex32>, row_fft: &dyn Fft<f32>, col_fft: &dyn Fft<f32>) {
        let mut buf = vec![Complex32::default(); data.ncols()];
        for mut row in data.rows_mut() {
            buf.iter_mut().zip(row.iter()).for_each(|(b, v)| *b = *v);
            row_fft.process(&mut buf);
            row.iter_mut().zip(buf.iter()).for_each(|(v, b)| *v = *b);
        }

        let mut buf = vec![Complex32::default(); data.nrows()];
        for mut col in data.columns_mut() {
            buf.iter_mut().zip(col.iter()).for_each(|(b, v)| *b = *v);
            col_fft.process(&mut buf);
            col.iter_mut().zip(buf.iter()).for_each(|(v, b)| *v = *b);
        }
    }
}

// ========== 窗口工具 ==========

fn hann(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (n - 1) as f32).cos())
        .collect()
}

fn hann2d(rows: usize, cols: usize) -> Array2<f32> {
    let (hr, hc) = (hann(rows), hann(cols));
    Array2::from_shape_fn((rows, cols), |(r, c)| hr[r] * hc[c])
}

/// 以窗口中心为峰的期望响应
fn gaussian_peak(rows: usize, cols: usize, sigma: f32) -> Array2<f32> {
    let (cy, cx) = ((rows - 1) as f32 / 2.0, (cols - 1) as f32 / 2.0);
    let denom = 2.0 * sigma * sigma;
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let (dy, dx) = (r as f32 - cy, c as f32 - cx);
        (-(dx * dx + dy * dy) / denom).exp()
    })
}

/// 奇数边长, 保证中心落在像素上
fn odd(v: f32) -> usize {
    (v.round().max(9.0) as usize) | 1
}

/// 以 (cx, cy) 为中心、每窗口像素对应 `scale` 个帧像素的最近邻采样, 越界取边缘
fn sample_window(
    gray: &GrayImage,
    center: (f32, f32),
    rows: usize,
    cols: usize,
    scale: f32,
) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (half_c, half_r) = ((cols - 1) as f32 / 2.0, (rows - 1) as f32 / 2.0);
    GrayImage::from_fn(cols as u32, rows as u32, |c, r| {
        let fx = center.0 + (c as f32 - half_c) * scale;
        let fy = center.1 + (r as f32 - half_r) * scale;
        let x = (fx.round() as i64).clamp(0, w as i64 - 1) as u32;
        let y = (fy.round() as i64).clamp(0, h as i64 - 1) as u32;
        *gray.get_pixel(x, y)
    })
}

// ========== MOSSE ==========

struct MosseState {
    center: (f32, f32),
    size: (f32, f32),
    rows: usize,
    cols: usize,
    scale: f32,
    window: Array2<f32>,
    target: Array2<Complex32>, // G
    num: Array2<Complex32>,    // A
    den: Array2<Complex32>,    // B
    fft: Fft2d,
}

/// 相关滤波跟踪器, 相同输入下结果确定
pub struct LocalTracker {
    config: LocalTrackerConfig,
    state: Option<MosseState>,
}

impl LocalTracker {
    pub fn new(config: LocalTrackerConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// 最近一帧的目标框
    pub fn current(&self) -> Option<RectF> {
        self.state
            .as_ref()
            .map(|s| RectF::from_center(s.center.0, s.center.1, s.size.0, s.size.1))
    }

    /// log → 零均值单位方差 → Hann窗 → FFT
    fn transform(state: &MosseState, patch: &GrayImage) -> Array2<Complex32> {
        let mut values = Array2::from_shape_fn((state.rows, state.cols), |(r, c)| {
            (patch.get_pixel(c as u32, r as u32)[0] as f32 + 1.0).ln()
        });
        let mean = values.mean().unwrap_or(0.0);
        let std = values.std(0.0);
        values.mapv_inplace(|v| (v - mean) / (std + 1e-5));
        values *= &state.window;

        let mut spectrum = values.mapv(|v| Complex32::new(v, 0.0));
        state.fft.forward(&mut spectrum);
        spectrum
    }

    /// 相关响应与峰值位置 (行, 列, 峰值)
    fn respond(state: &MosseState, spectrum: &Array2<Complex32>, lambda: f32) -> (Array2<f32>, usize, usize, f32) {
        let mut product = Array2::from_shape_fn(spectrum.dim(), |idx| {
            spectrum[idx] * state.num[idx] / (state.den[idx] + lambda)
        });
        state.fft.inverse(&mut product);
        let response = product.mapv(|v| v.re);

        let mut best = (0, 0, f32::NEG_INFINITY);
        for ((r, c), &v) in response.indexed_iter() {
            if v > best.2 {
                best = (r, c, v);
            }
        }
        (response, best.0, best.1, best.2)
    }

    /// 峰值旁瓣比
    fn psr(response: &Array2<f32>, peak_r: usize, peak_c: usize, peak: f32) -> f32 {
        let (rows, cols) = response.dim();
        let half = 5.min(rows.min(cols) / 4) as isize;
        let (mut sum, mut sum_sq, mut n) = (0.0f64, 0.0f64, 0usize);
        for ((r, c), &v) in response.indexed_iter() {
            if (r as isize - peak_r as isize).abs() <= half
                && (c as isize - peak_c as isize).abs() <= half
            {
                continue;
            }
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
            n += 1;
        }
        if n < 2 {
            return 0.0;
        }
        let mean = sum / n as f64;
        let std = (sum_sq / n as f64 - mean * mean).max(0.0).sqrt();
        ((peak as f64 - mean) / (std + 1e-5)) as f32
    }
}

impl Tracker for LocalTracker {
    fn init(&mut self, frame: &RgbImage, rect: RectF) -> Result<()> {
        if self.state.is_some() {
            return Err(TrackError::invalid("local tracker already initialized"));
        }
        if rect.w < 1.0 || rect.h < 1.0 {
            return Err(TrackError::invalid(format!("degenerate init box {rect:?}")));
        }

        let cfg = &self.config;
        let (pw, ph) = (rect.w * (1.0 + cfg.padding), rect.h * (1.0 + cfg.padding));
        let scale = (pw.max(ph) / cfg.max_window as f32).max(1.0);
        let (rows, cols) = (odd(ph / scale), odd(pw / scale));

        let fft = Fft2d::new(rows, cols);
        let mut target = gaussian_peak(rows, cols, cfg.sigma).mapv(|v| Complex32::new(v, 0.0));
        fft.forward(&mut target);

        let mut state = MosseState {
            center: rect.center(),
            size: (rect.w, rect.h),
            rows,
            cols,
            scale,
            window: hann2d(rows, cols),
            num: Array2::zeros((rows, cols)),
            den: Array2::zeros((rows, cols)),
            target,
            fft,
        };

        // 首帧样本 + 确定性的小角度旋转扰动
        let gray = imageops::grayscale(frame);
        let patch = sample_window(&gray, state.center, rows, cols, scale);
        let count = cfg.perturbations.max(1);
        for i in 0..count {
            let sample = if i == 0 {
                patch.clone()
            } else {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                let theta = sign * 0.05 * ((i + 1) / 2) as f32;
                rotate_about_center(&patch, theta, Interpolation::Bilinear, Luma([0u8]))
            };
            let spectrum = Self::transform(&state, &sample);
            state.num += &(&state.target * &spectrum.mapv(|v| v.conj()));
            state.den += &(&spectrum * &spectrum.mapv(|v| v.conj()));
        }
        trace!("mosse init: window {cols}x{rows}, scale {scale:.2}");

        self.state = Some(state);
        Ok(())
    }

    fn update(&mut self, frame: &RgbImage) -> Result<Option<RectF>> {
        let cfg = &self.config;
        let state = self.state.as_mut().ok_or(TrackError::NotInitialized)?;

        let gray = imageops::grayscale(frame);
        let patch = sample_window(&gray, state.center, state.rows, state.cols, state.scale);
        let spectrum = Self::transform(state, &patch);
        let (response, pr, pc, peak) = Self::respond(state, &spectrum, cfg.regularization);
        let psr = Self::psr(&response, pr, pc, peak);

        if psr < cfg.psr_threshold {
            trace!("mosse lost: psr {psr:.2}");
            return Ok(None);
        }

        let dx = pc as f32 - (state.cols - 1) as f32 / 2.0;
        let dy = pr as f32 - (state.rows - 1) as f32 / 2.0;
        state.center.0 += dx * state.scale;
        state.center.1 += dy * state.scale;

        // 在新位置重新采样后更新滤波器
        let patch = sample_window(&gray, state.center, state.rows, state.cols, state.scale);
        let spectrum = Self::transform(state, &patch);
        let lr = cfg.learning_rate;
        let num = &state.target * &spectrum.mapv(|v| v.conj());
        let den = &spectrum * &spectrum.mapv(|v| v.conj());
        state.num = num * lr + &state.num * (1.0 - lr);
        state.den = den * lr + &state.den * (1.0 - lr);

        Ok(Some(RectF::from_center(
            state.center.0,
            state.center.1,
            state.size.0,
            state.size.1,
        )))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::textured_frames;

    fn rect(x: f32, y: f32, w: f32, h: f32) -> RectF {
        RectF { x, y, w, h }
    }

    #[test]
    fn test_fft_round_trip() {
        let fft = Fft2d::new(5, 7);
        let original = Array2::from_shape_fn((5, 7), |(r, c)| Complex32::new((r * 7 + c) as f32, 0.0));
        let mut data = original.clone();
        fft.forward(&mut data);
        fft.inverse(&mut data);
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((a.re - b.re).abs() < 1e-3);
            assert!(a.im.abs() < 1e-3);
        }
    }

    #[test]
    fn test_static_frames_hold_position() {
        let frames = textured_frames(5, 160, 120, (0, 0));
        let mut tracker = LocalTracker::new(LocalTrackerConfig::default());
        tracker.init(&frames[0], rect(60.0, 40.0, 40.0, 40.0)).unwrap();

        for frame in &frames[1..] {
            let out = tracker.update(frame).unwrap().expect("static target lost");
            assert!((out.x - 60.0).abs() <= 1.0, "{out:?}");
            assert!((out.y - 40.0).abs() <= 1.0, "{out:?}");
            assert_eq!((out.w, out.h), (40.0, 40.0));
        }
    }

    #[test]
    fn test_follows_translation() {
        // 纹理每帧向右移动2像素, 向下1像素
        let frames = textured_frames(6, 160, 120, (2, 1));
        let mut tracker = LocalTracker::new(LocalTrackerConfig::default());
        tracker.init(&frames[0], rect(60.0, 40.0, 40.0, 40.0)).unwrap();

        let mut last = None;
        for frame in &frames[1..] {
            if let Some(out) = tracker.update(frame).unwrap() {
                last = Some(out);
            }
        }
        let out = last.expect("target lost on every frame");
        assert!((out.x - 70.0).abs() <= 3.0, "{out:?}");
        assert!((out.y - 45.0).abs() <= 3.0, "{out:?}");
    }

    #[test]
    fn test_unrelated_frames_report_loss() {
        let mut frames = textured_frames(1, 160, 120, (0, 0));
        // 完全不同的纹理
        frames.extend(textured_frames(5, 160, 120, (997, 613)).into_iter().skip(1));
        let config = LocalTrackerConfig {
            psr_threshold: 10.0,
            ..Default::default()
        };
        let mut tracker = LocalTracker::new(config);
        tracker.init(&frames[0], rect(60.0, 40.0, 40.0, 40.0)).unwrap();

        let lost = frames[1..]
            .iter()
            .filter(|f| tracker.update(f).unwrap().is_none())
            .count();
        assert!(lost >= 3, "only {lost} of 4 frames reported lost");
    }

    #[test]
    fn test_large_box_is_downscaled() {
        let frames = textured_frames(2, 400, 300, (0, 0));
        let mut tracker = LocalTracker::new(LocalTrackerConfig::default());
        tracker.init(&frames[0], rect(50.0, 50.0, 200.0, 120.0)).unwrap();
        let state = tracker.state.as_ref().unwrap();
        assert!(state.cols <= 97 && state.rows <= 97);
        assert!(state.cols % 2 == 1 && state.rows % 2 == 1);
        let scale = state.scale;

        let out = tracker.update(&frames[1]).unwrap().expect("lost");
        assert!((out.x - 50.0).abs() <= scale + 0.5);
    }

    #[test]
    fn test_double_init_rejected() {
        let frames = textured_frames(1, 64, 64, (0, 0));
        let mut tracker = LocalTracker::new(LocalTrackerConfig::default());
        tracker.init(&frames[0], rect(10.0, 10.0, 20.0, 20.0)).unwrap();
        assert!(tracker.init(&frames[0], rect(10.0, 10.0, 20.0, 20.0)).is_err());
        assert!(tracker.current().is_some());
    }
}
