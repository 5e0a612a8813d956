// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 孪生网络跟踪器 (SiamFC)
//!
//! ```text
//! 首帧模板 → 特征 z        (exemplar_size)
//! 当前帧多尺度搜索区域 → 特征 x (instance_size)
//!          ↓
//!    互相关响应图 → 余弦窗惩罚 + 尺度惩罚 → 峰值 → 位移
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use ndarray::{s, Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::onnx::OnnxBackbone;
use super::{BackendKind, Tracker};
use crate::config::SiameseConfig;
use crate::error::{Result, TrackError};
use crate::types::RectF;

/// 特征提取器: RGB图块 → (C, H, W) 特征图
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, patch: &RgbImage) -> Result<Array3<f32>>;
}

/// 与模型配套的跟踪参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SiameseParams {
    pub exemplar_size: u32,
    pub instance_size: u32,
    pub total_stride: u32,
    pub context_amount: f32,
    pub scale_step: f32,
    pub scale_num: usize,
    pub scale_penalty: f32,
    pub scale_lr: f32,
    pub window_influence: f32,
    /// 峰值处余弦相似度低于此值视为丢失
    pub min_score: f32,
}

impl Default for SiameseParams {
    fn default() -> Self {
        Self {
            exemplar_size: 127,
            instance_size: 255,
            total_stride: 8,
            context_amount: 0.5,
            scale_step: 1.0375,
            scale_num: 3,
            scale_penalty: 0.9745,
            scale_lr: 0.59,
            window_influence: 0.176,
            min_score: 0.3,
        }
    }
}

impl SiameseParams {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |reason: String| TrackError::BackendUnavailable {
            backend: "siamese",
            reason,
        };
        let json = fs::read_to_string(path)
            .map_err(|e| unavailable(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&json).map_err(|e| unavailable(format!("{}: {e}", path.display())))
    }

    fn scales(&self) -> Vec<f32> {
        let n = self.scale_num.max(1);
        let mid = (n - 1) as f32 / 2.0;
        (0..n)
            .map(|i| self.scale_step.powf(i as f32 - mid))
            .collect()
    }
}

/// 已加载的模型: 特征提取器 + 参数
pub struct SiameseModel {
    extractor: Arc<dyn FeatureExtractor>,
    params: SiameseParams,
}

impl SiameseModel {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, params: SiameseParams) -> Self {
        Self { extractor, params }
    }

    /// 从磁盘加载 ONNX 主干网络与参数文件
    pub fn load(config: &SiameseConfig) -> Result<Self> {
        let params = match &config.params_path {
            Some(path) => SiameseParams::load(path)?,
            None => SiameseParams::default(),
        };
        let backbone = OnnxBackbone::load(&config.model_path, config.intra_threads)?;
        Ok(Self::new(Arc::new(backbone), params))
    }

    pub fn params(&self) -> &SiameseParams {
        &self.params
    }
}

struct SiamState {
    center: (f32, f32),
    size: (f32, f32),
    exemplar: Array3<f32>,
    exemplar_norm: f32,
}

pub struct SiameseTracker {
    model: Arc<SiameseModel>,
    state: Option<SiamState>,
}

impl SiameseTracker {
    pub fn new(model: Arc<SiameseModel>) -> Self {
        Self { model, state: None }
    }

    /// 带上下文的模板边长
    fn exemplar_side(params: &SiameseParams, size: (f32, f32)) -> f32 {
        let p = params.context_amount * (size.0 + size.1);
        ((size.0 + p) * (size.1 + p)).sqrt()
    }
}

/// 以 center 为中心截取边长 side 的正方形区域, 缩放到 out × out (最近邻, 越界取边缘)
fn crop_square(frame: &RgbImage, center: (f32, f32), side: f32, out: u32) -> RgbImage {
    let (w, h) = frame.dimensions();
    let step = side / out as f32;
    let (x0, y0) = (center.0 - side / 2.0, center.1 - side / 2.0);
    RgbImage::from_fn(out, out, |u, v| {
        let fx = x0 + (u as f32 + 0.5) * step;
        let fy = y0 + (v as f32 + 0.5) * step;
        let x = (fx.floor() as i64).clamp(0, w as i64 - 1) as u32;
        let y = (fy.floor() as i64).clamp(0, h as i64 - 1) as u32;
        *frame.get_pixel(x, y)
    })
}

fn norm(features: ArrayView3<f32>) -> f32 {
    features.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// 互相关, 返回每个位置的余弦相似度
fn xcorr_cosine(z: &Array3<f32>, z_norm: f32, x: &Array3<f32>) -> Result<Array2<f32>> {
    let (zc, zh, zw) = z.dim();
    let (xc, xh, xw) = x.dim();
    if zc != xc || xh < zh || xw < zw {
        return Err(TrackError::invalid(format!(
            "feature shapes do not correlate: exemplar {:?}, instance {:?}",
            z.dim(),
            x.dim()
        )));
    }
    let (rh, rw) = (xh - zh + 1, xw - zw + 1);
    Ok(Array2::from_shape_fn((rh, rw), |(r, c)| {
        let window = x.slice(s![.., r..r + zh, c..c + zw]);
        let dot: f32 = window.iter().zip(z.iter()).map(|(a, b)| a * b).sum();
        let denom = z_norm * norm(window);
        if denom > 1e-6 {
            dot / denom
        } else {
            0.0
        }
    }))
}

fn hann2d(rows: usize, cols: usize) -> Array2<f32> {
    let hann = |n: usize, i: usize| {
        if n < 2 {
            1.0
        } else {
            0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos()
        }
    };
    Array2::from_shape_fn((rows, cols), |(r, c)| hann(rows, r) * hann(cols, c))
}

impl Tracker for SiameseTracker {
    fn init(&mut self, frame: &RgbImage, rect: RectF) -> Result<()> {
        if self.state.is_some() {
            return Err(TrackError::invalid("siamese tracker already initialized"));
        }
        if rect.w < 1.0 || rect.h < 1.0 {
            return Err(TrackError::invalid(format!("degenerate init box {rect:?}")));
        }
        let params = &self.model.params;
        let size = (rect.w, rect.h);
        let center = rect.center();

        let side = Self::exemplar_side(params, size);
        let patch = crop_square(frame, center, side, params.exemplar_size);
        let exemplar = self.model.extractor.extract(&patch)?;
        let exemplar_norm = norm(exemplar.view());

        self.state = Some(SiamState {
            center,
            size,
            exemplar,
            exemplar_norm,
        });
        Ok(())
    }

    fn update(&mut self, frame: &RgbImage) -> Result<Option<RectF>> {
        let model = Arc::clone(&self.model);
        let params = &model.params;
        let state = self.state.as_mut().ok_or(TrackError::NotInitialized)?;

        let z_side = Self::exemplar_side(params, state.size);
        let x_side = z_side * params.instance_size as f32 / params.exemplar_size as f32;

        // 各尺度取响应图, 以惩罚后的峰值选尺度
        let mut best: Option<(f32, f32, Array2<f32>)> = None;
        for scale in params.scales() {
            let patch = crop_square(frame, state.center, x_side * scale, params.instance_size);
            let features = model.extractor.extract(&patch)?;
            let response = xcorr_cosine(&state.exemplar, state.exemplar_norm, &features)?;
            let peak = response.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let penalized = if (scale - 1.0).abs() > 1e-6 {
                peak * params.scale_penalty
            } else {
                peak
            };
            if best.as_ref().map_or(true, |(p, _, _)| penalized > *p) {
                best = Some((penalized, scale, response));
            }
        }
        let Some((_, scale, response)) = best else {
            return Ok(None);
        };

        let (rows, cols) = response.dim();
        let wi = params.window_influence;
        let blended = &response * (1.0 - wi) + &(hann2d(rows, cols) * wi);
        let mut peak = (0, 0, f32::NEG_INFINITY);
        for ((r, c), &v) in blended.indexed_iter() {
            if v > peak.2 {
                peak = (r, c, v);
            }
        }
        let score = response[[peak.0, peak.1]];
        if score < params.min_score {
            trace!("siamese lost: score {score:.3}");
            return Ok(None);
        }

        // 响应图格 → 搜索图像素 → 帧像素
        let frame_per_pixel = x_side * scale / params.instance_size as f32;
        let dy = (peak.0 as f32 - (rows - 1) as f32 / 2.0) * params.total_stride as f32;
        let dx = (peak.1 as f32 - (cols - 1) as f32 / 2.0) * params.total_stride as f32;
        state.center.0 += dx * frame_per_pixel;
        state.center.1 += dy * frame_per_pixel;

        let lr_scale = 1.0 - params.scale_lr + params.scale_lr * scale;
        state.size.0 *= lr_scale;
        state.size.1 *= lr_scale;

        Ok(Some(RectF::from_center(
            state.center.0,
            state.center.1,
            state.size.0,
            state.size.1,
        )))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Siamese
    }
}

/// 平均池化灰度特征 (去均值), 用于测试
#[cfg(test)]
pub(crate) struct PooledIntensity {
    pub stride: u32,
}

#[cfg(test)]
impl FeatureExtractor for PooledIntensity {
    fn extract(&self, patch: &RgbImage) -> Result<Array3<f32>> {
        let s = self.stride;
        let (w, h) = patch.dimensions();
        let (fw, fh) = ((w / s) as usize, (h / s) as usize);
        let mut out = Array3::<f32>::zeros((1, fh, fw));
        for ((_, r, c), v) in out.indexed_iter_mut() {
            let mut sum = 0.0;
            for y in 0..s {
                for x in 0..s {
                    let p = patch.get_pixel(c as u32 * s + x, r as u32 * s + y);
                    sum += (p[0] as f32 + p[1] as f32 + p[2] as f32) / 3.0;
                }
            }
            *v = sum / (s * s) as f32;
        }
        let mean = out.mean().unwrap_or(0.0);
        out.mapv_inplace(|v| v - mean);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::textured_frames;

    fn model(min_score: f32) -> Arc<SiameseModel> {
        let params = SiameseParams {
            min_score,
            ..Default::default()
        };
        Arc::new(SiameseModel::new(Arc::new(PooledIntensity { stride: 8 }), params))
    }

    fn rect(x: f32, y: f32, w: f32, h: f32) -> RectF {
        RectF { x, y, w, h }
    }

    #[test]
    fn test_scales_are_symmetric() {
        let scales = SiameseParams::default().scales();
        assert_eq!(scales.len(), 3);
        assert!((scales[1] - 1.0).abs() < 1e-6);
        assert!((scales[0] * scales[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_xcorr_peaks_on_exact_match() {
        let x = Array3::from_shape_fn((2, 6, 6), |(c, r, col)| ((c * 31 + r * 7 + col * 13) % 11) as f32 - 5.0);
        let z = x.slice(s![.., 2..5, 1..4]).to_owned();
        let response = xcorr_cosine(&z, norm(z.view()), &x).unwrap();
        assert_eq!(response.dim(), (4, 4));
        assert!((response[[2, 1]] - 1.0).abs() < 1e-5);
        assert!(response.iter().all(|v| *v <= 1.0 + 1e-5));
    }

    #[test]
    fn test_static_frames_hold_position() {
        let frames = textured_frames(4, 200, 160, (0, 0));
        let mut tracker = SiameseTracker::new(model(0.3));
        tracker.init(&frames[0], rect(80.0, 60.0, 40.0, 40.0)).unwrap();

        for frame in &frames[1..] {
            let out = tracker.update(frame).unwrap().expect("static target lost");
            assert!((out.x - 80.0).abs() <= 1.0, "{out:?}");
            assert!((out.y - 60.0).abs() <= 1.0, "{out:?}");
            assert!((out.w - 40.0).abs() <= 0.5, "{out:?}");
        }
    }

    #[test]
    fn test_unrelated_frames_report_loss() {
        let mut frames = textured_frames(1, 200, 160, (0, 0));
        frames.extend(textured_frames(4, 200, 160, (997, 613)).into_iter().skip(1));
        let mut tracker = SiameseTracker::new(model(0.6));
        tracker.init(&frames[0], rect(80.0, 60.0, 40.0, 40.0)).unwrap();
        for frame in &frames[1..] {
            assert!(tracker.update(frame).unwrap().is_none());
        }
    }

    #[test]
    fn test_update_before_init() {
        let frames = textured_frames(1, 64, 64, (0, 0));
        let mut tracker = SiameseTracker::new(model(0.3));
        assert!(matches!(
            tracker.update(&frames[0]),
            Err(TrackError::NotInitialized)
        ));
        assert_eq!(tracker.kind(), BackendKind::Siamese);
    }
}
