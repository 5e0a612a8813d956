// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 跟踪器配置 - 通过JSON文件调整参数

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TrackError};
use crate::input::Quality;
use crate::tracker::BackendKind;

/// 跟踪编排参数配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    // === 后端选择 ===
    pub range_backend: BackendKind, // 单目标区间跟踪
    pub batch_backend: BackendKind, // NORMAL/APPEND 批量跟踪

    // === 帧采样 ===
    pub stride: u32,           // 帧跳采样间隔
    pub frame_quality: Quality, // 跟踪与编辑使用的帧质量

    // === 预览 ===
    pub preview_stride: usize, // 轨迹预览抽样间隔
    pub jpeg_quality: u8,      // 预览JPEG质量
    pub centroid_radius: i32,  // 中心点标记半径

    // === 请求限制 ===
    pub max_frames_per_request: u32,
    pub max_objects_per_request: usize,
    pub workers: usize, // 并行跟踪线程数

    /// 仅在目标周围区域内跟踪 (单目标区间跟踪)
    pub crop_background: bool,

    pub local: LocalTrackerConfig,
    pub siamese: SiameseConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            range_backend: BackendKind::Local,
            batch_backend: BackendKind::Siamese,
            stride: 2,
            frame_quality: Quality::Compressed,
            preview_stride: 3,
            jpeg_quality: 90,
            centroid_radius: 6,
            max_frames_per_request: 600,
            max_objects_per_request: 64,
            workers: 4,
            crop_background: false,
            local: LocalTrackerConfig::default(),
            siamese: SiameseConfig::default(),
        }
    }
}

/// 相关滤波跟踪器参数 (MOSSE)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTrackerConfig {
    pub padding: f32,         // 搜索窗口相对目标的扩展比例
    pub max_window: u32,      // 窗口最大边长, 超出则降采样
    pub learning_rate: f32,   // 在线更新速率
    pub regularization: f32,  // 频域正则项
    pub sigma: f32,           // 期望响应的高斯宽度
    pub psr_threshold: f32,   // 低于此值视为丢失
    pub perturbations: usize, // 初始化时的旋转扰动样本数
}

impl Default for LocalTrackerConfig {
    fn default() -> Self {
        Self {
            padding: 1.0,
            max_window: 96,
            learning_rate: 0.125,
            regularization: 0.01,
            sigma: 2.0,
            psr_threshold: 7.0,
            perturbations: 8,
        }
    }
}

/// 孪生网络跟踪器模型路径
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SiameseConfig {
    pub model_path: String,
    /// 与模型配套的参数文件, 缺省使用内置参数
    pub params_path: Option<String>,
    pub intra_threads: usize,
}

impl Default for SiameseConfig {
    fn default() -> Self {
        Self {
            model_path: "models/siamfc_backbone.onnx".to_string(),
            params_path: None,
            intra_threads: 1,
        }
    }
}

impl TrackerConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("config parse failed: {e}, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!("config file missing, writing defaults to {}", path.display());
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("{e:#}");
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("serialize config")?;
        fs::write(path, json).with_context(|| format!("write config to {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 {
            return Err(TrackError::invalid("stride must be at least 1"));
        }
        if self.preview_stride == 0 {
            return Err(TrackError::invalid("preview_stride must be at least 1"));
        }
        if self.workers == 0 {
            return Err(TrackError::invalid("workers must be at least 1"));
        }
        if self.centroid_radius < 0 {
            return Err(TrackError::invalid("centroid_radius must not be negative"));
        }
        if self.max_frames_per_request == 0 || self.max_objects_per_request == 0 {
            return Err(TrackError::invalid("request limits must be at least 1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(TrackError::invalid("jpeg_quality must be within 1..=100"));
        }
        if self.local.padding < 0.0 || self.local.max_window < 8 {
            return Err(TrackError::invalid("local tracker window too small"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TrackerConfig::default();
        assert_eq!(config.stride, 2);
        assert_eq!(config.preview_stride, 3);
        assert_eq!(config.batch_backend, BackendKind::Siamese);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "stride": 3, "batch_backend": "local", "local": { "psr_threshold": 5.0 } }"#;
        let config: TrackerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stride, 3);
        assert_eq!(config.batch_backend, BackendKind::Local);
        assert_eq!(config.local.psr_threshold, 5.0);
        assert_eq!(config.local.learning_rate, 0.125);
        assert_eq!(config.frame_quality, Quality::Compressed);
    }

    #[test]
    fn test_load_writes_defaults_when_missing() {
        let path = std::env::temp_dir().join(format!("annotrack-config-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        let config = TrackerConfig::load(&path);
        assert_eq!(config.stride, 2);
        assert!(path.exists());

        let mut changed = config.clone();
        changed.workers = 9;
        changed.save(&path).unwrap();
        assert_eq!(TrackerConfig::load(&path).workers, 9);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_validate_rejects_zero_stride() {
        let config = TrackerConfig {
            stride: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TrackError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let bad = [
            TrackerConfig {
                centroid_radius: -1,
                ..Default::default()
            },
            TrackerConfig {
                max_frames_per_request: 0,
                ..Default::default()
            },
            TrackerConfig {
                max_objects_per_request: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(TrackError::InvalidArgument(_))
            ));
        }
        assert!(TrackerConfig {
            centroid_radius: 0,
            ..Default::default()
        }
        .validate()
        .is_ok());
    }
}
