// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 单目标跟踪器公共组件
//! Single-object tracker interface and backend registry

pub mod local;
pub mod onnx;
pub mod siamese;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::RgbImage;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{LocalTrackerConfig, SiameseConfig};
use crate::error::{Result, TrackError};
use crate::types::RectF;

pub use local::LocalTracker;
pub use siamese::{FeatureExtractor, SiameseModel, SiameseParams, SiameseTracker};

// ========== 跟踪器统一接口 ==========

/// 单目标跟踪器 Trait
///
/// 跟踪器是有状态的: 先在首帧调用一次 `init`, 之后按帧号递增顺序调用 `update`。
/// 乱序或跳过初始化不会被检测到, 只会悄悄得到错误结果。
pub trait Tracker: Send {
    /// 用首帧和 (x, y, w, h) 初始化
    fn init(&mut self, frame: &RgbImage, rect: RectF) -> Result<()>;

    /// 跟踪下一帧; `Ok(None)` 表示目标丢失
    fn update(&mut self, frame: &RgbImage) -> Result<Option<RectF>>;

    fn kind(&self) -> BackendKind;
}

// ========== 后端选择 ==========

/// 跟踪后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 相关滤波跟踪器 (MOSSE)
    Local,
    /// 孪生网络跟踪器 (SiamFC)
    Siamese,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Siamese => "siamese",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "csrt" | "mosse" => Ok(BackendKind::Local),
            "siamese" | "pysot" | "siamfc" => Ok(BackendKind::Siamese),
            _ => Err(TrackError::UnknownBackend(s.to_string())),
        }
    }
}

type SiameseLoader = Box<dyn Fn() -> Result<SiameseModel> + Send + Sync>;

/// 后端注册表: 按类型创建跟踪器, 孪生网络模型只加载一次
pub struct BackendRegistry {
    local: LocalTrackerConfig,
    loader: SiameseLoader,
    siamese: OnceCell<std::result::Result<Arc<SiameseModel>, String>>,
}

impl BackendRegistry {
    pub fn new(local: LocalTrackerConfig, siamese: SiameseConfig) -> Self {
        Self {
            local,
            loader: Box::new(move || SiameseModel::load(&siamese)),
            siamese: OnceCell::new(),
        }
    }

    /// 使用已构建的孪生网络模型 (自定义特征提取器)
    pub fn with_siamese_model(local: LocalTrackerConfig, model: SiameseModel) -> Self {
        let registry = Self {
            local,
            loader: Box::new(|| {
                Err(TrackError::BackendUnavailable {
                    backend: "siamese",
                    reason: "model already provided".to_string(),
                })
            }),
            siamese: OnceCell::new(),
        };
        let _ = registry.siamese.set(Ok(Arc::new(model)));
        registry
    }

    pub fn create(&self, kind: BackendKind) -> Result<Box<dyn Tracker>> {
        match kind {
            BackendKind::Local => Ok(Box::new(LocalTracker::new(self.local.clone()))),
            BackendKind::Siamese => Ok(Box::new(SiameseTracker::new(self.siamese_model()?))),
        }
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.ensure(kind).is_ok()
    }

    /// 后端不可用时返回 (缓存的) `BackendUnavailable`
    pub fn ensure(&self, kind: BackendKind) -> Result<()> {
        match kind {
            BackendKind::Local => Ok(()),
            BackendKind::Siamese => self.siamese_model().map(|_| ()),
        }
    }

    /// 加载失败会被缓存, 只影响孪生网络后端
    fn siamese_model(&self) -> Result<Arc<SiameseModel>> {
        let loaded = self.siamese.get_or_init(|| match (self.loader)() {
            Ok(model) => {
                info!("siamese tracker model loaded");
                Ok(Arc::new(model))
            }
            Err(e) => {
                warn!("siamese tracker unavailable: {e}");
                Err(e.to_string())
            }
        });
        loaded
            .as_ref()
            .map(Arc::clone)
            .map_err(|reason| TrackError::BackendUnavailable {
                backend: "siamese",
                reason: reason.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::textured_frames;

    #[test]
    fn test_backend_names() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("CSRT".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("pysot".parse::<BackendKind>().unwrap(), BackendKind::Siamese);
        assert!(matches!(
            "kcf".parse::<BackendKind>(),
            Err(TrackError::UnknownBackend(name)) if name == "kcf"
        ));
        assert_eq!(BackendKind::Siamese.to_string(), "siamese");
    }

    #[test]
    fn test_missing_model_only_disables_siamese() {
        let siamese = SiameseConfig {
            model_path: "does/not/exist.onnx".to_string(),
            ..Default::default()
        };
        let registry = BackendRegistry::new(LocalTrackerConfig::default(), siamese);

        assert!(registry.create(BackendKind::Local).is_ok());
        assert!(matches!(
            registry.create(BackendKind::Siamese),
            Err(TrackError::BackendUnavailable { backend: "siamese", .. })
        ));
        // cached failure, still unavailable
        assert!(!registry.is_available(BackendKind::Siamese));
        assert!(matches!(
            registry.ensure(BackendKind::Siamese),
            Err(TrackError::BackendUnavailable { backend: "siamese", .. })
        ));
        assert!(registry.is_available(BackendKind::Local));
    }

    #[test]
    fn test_provided_siamese_model() {
        let model = SiameseModel::new(
            Arc::new(siamese::PooledIntensity { stride: 8 }),
            SiameseParams::default(),
        );
        let registry = BackendRegistry::with_siamese_model(LocalTrackerConfig::default(), model);
        assert!(registry.is_available(BackendKind::Siamese));

        let frames = textured_frames(2, 160, 120, (0, 0));
        let mut tracker = registry.create(BackendKind::Siamese).unwrap();
        assert_eq!(tracker.kind(), BackendKind::Siamese);
        tracker.init(&frames[0], RectF { x: 60.0, y: 40.0, w: 32.0, h: 32.0 }).unwrap();
        assert!(tracker.update(&frames[1]).unwrap().is_some());
    }

    #[test]
    fn test_update_before_init_is_error() {
        let registry = BackendRegistry::new(LocalTrackerConfig::default(), SiameseConfig::default());
        let frame = &textured_frames(1, 32, 32, (0, 0))[0];
        let mut tracker = registry.create(BackendKind::Local).unwrap();
        assert!(matches!(
            tracker.update(frame),
            Err(TrackError::NotInitialized)
        ));
    }
}
