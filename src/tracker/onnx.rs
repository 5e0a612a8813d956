// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! ONNX Runtime 主干网络 (孪生跟踪器特征提取)

use std::path::Path;
use std::sync::Mutex;

use image::RgbImage;
use ndarray::{Array3, Array4, Axis, Ix3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::info;

use super::siamese::FeatureExtractor;
use crate::error::{Result, TrackError};

fn unavailable(reason: impl ToString) -> TrackError {
    TrackError::BackendUnavailable {
        backend: "siamese",
        reason: reason.to_string(),
    }
}

/// 单输入单输出的全卷积主干: (1, 3, H, W) → (1, C, h, w)
pub struct OnnxBackbone {
    session: Mutex<Session>,
}

impl OnnxBackbone {
    pub fn load(path: impl AsRef<Path>, intra_threads: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(unavailable(format!("model file {} not found", path.display())));
        }
        let session = Session::builder()
            .map_err(unavailable)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(unavailable)?
            .with_intra_threads(intra_threads.max(1))
            .map_err(unavailable)?
            .commit_from_file(path)
            .map_err(unavailable)?;
        info!("onnx backbone loaded from {}", path.display());
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

/// RGB → NCHW, 保留 0..255 的像素值
fn to_tensor(patch: &RgbImage) -> Array4<f32> {
    let (w, h) = patch.dimensions();
    let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, px) in patch.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = px[c] as f32;
        }
    }
    input
}

impl FeatureExtractor for OnnxBackbone {
    fn extract(&self, patch: &RgbImage) -> Result<Array3<f32>> {
        let input = to_tensor(patch);
        let tensor = TensorRef::from_array_view(input.view()).map_err(unavailable)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| unavailable("backbone session poisoned"))?;
        let outputs = session.run(ort::inputs![tensor]).map_err(unavailable)?;
        let features = outputs[0]
            .try_extract_array::<f32>()
            .map_err(unavailable)?;

        if features.ndim() != 4 || features.shape()[0] != 1 {
            return Err(unavailable(format!(
                "unexpected backbone output shape {:?}",
                features.shape()
            )));
        }
        let features = features
            .index_axis(Axis(0), 0)
            .to_owned()
            .into_dimensionality::<Ix3>()
            .map_err(unavailable)?;
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_unavailable() {
        assert!(matches!(
            OnnxBackbone::load("models/missing_backbone.onnx", 1),
            Err(TrackError::BackendUnavailable { backend: "siamese", .. })
        ));
    }

    #[test]
    fn test_tensor_layout_is_nchw() {
        let patch = RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, 7]));
        let t = to_tensor(&patch);
        assert_eq!(t.shape(), &[1, 3, 2, 3]);
        assert_eq!(t[[0, 0, 1, 2]], 2.0);
        assert_eq!(t[[0, 1, 1, 2]], 1.0);
        assert_eq!(t[[0, 2, 0, 0]], 7.0);
    }
}
