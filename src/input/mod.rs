// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧输入系统 (Frame Input System)
///
/// 按帧号提供已解码图像, 跟踪核心只依赖 `FrameSource` 接口
/// - DirectoryFrameSource: 按文件名排序的图片目录
/// - MemoryFrameSource:    内存中的帧序列
pub mod directory;
pub mod memory;

use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};

pub use directory::DirectoryFrameSource;
pub use memory::MemoryFrameSource;

/// 帧质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Compressed,
    Original,
}

impl FromStr for Quality {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compressed" => Ok(Quality::Compressed),
            "original" => Ok(Quality::Original),
            other => Err(TrackError::invalid(format!("unknown quality `{other}`"))),
        }
    }
}

/// 已解码帧
#[derive(Clone, Debug)]
pub struct Frame {
    pub index: u32,
    pub image: Arc<RgbImage>,
}

/// 编码后的帧 (图像字节 + MIME)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl EncodedFrame {
    pub fn decode(&self, index: u32) -> Result<RgbImage> {
        image::load_from_memory(&self.bytes)
            .map(|img| img.to_rgb8())
            .map_err(|e| TrackError::frame_source(index, e))
    }
}

/// Compressed → JPEG, Original → PNG (lossless).
pub fn encode_image(image: &RgbImage, quality: Quality, jpeg_quality: u8) -> Result<EncodedFrame> {
    let mut bytes = Vec::new();
    match quality {
        Quality::Compressed => {
            JpegEncoder::new_with_quality(&mut bytes, jpeg_quality).encode_image(image)?;
            Ok(EncodedFrame {
                bytes,
                mime: "image/jpeg",
            })
        }
        Quality::Original => {
            image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
            Ok(EncodedFrame {
                bytes,
                mime: "image/png",
            })
        }
    }
}

/// `start, start+stride, …` up to and including `end`.
pub fn frame_indices(start: u32, end: u32, stride: u32) -> Result<Vec<u32>> {
    if stride == 0 {
        return Err(TrackError::invalid("stride must be at least 1"));
    }
    if end < start {
        return Err(TrackError::invalid(format!(
            "frame range [{start}, {end}] is empty"
        )));
    }
    Ok((start..=end).step_by(stride as usize).collect())
}

/// 外部帧源
pub trait FrameSource: Send + Sync {
    fn frame_count(&self) -> u32;

    fn get_frame(&self, index: u32, quality: Quality) -> Result<EncodedFrame>;

    /// 取 `[start, end]` 区间内按 stride 采样的解码帧, 超出末尾的部分截断
    fn get_frame_range(
        &self,
        start: u32,
        end: u32,
        quality: Quality,
        stride: u32,
    ) -> Result<Vec<Frame>> {
        let last = clamp_end(self.frame_count(), start, end)?;
        frame_indices(start, last, stride)?
            .into_iter()
            .map(|index| {
                let image = self.get_frame(index, quality)?.decode(index)?;
                Ok(Frame {
                    index,
                    image: Arc::new(image),
                })
            })
            .collect()
    }
}

pub(crate) fn clamp_end(frame_count: u32, start: u32, end: u32) -> Result<u32> {
    if start >= frame_count {
        return Err(TrackError::frame_source(
            start,
            format!("out of range, source has {frame_count} frames"),
        ));
    }
    Ok(end.min(frame_count - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_indices_inclusive() {
        assert_eq!(frame_indices(0, 10, 2).unwrap(), vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(frame_indices(3, 8, 3).unwrap(), vec![3, 6]);
        assert_eq!(frame_indices(5, 5, 2).unwrap(), vec![5]);
        assert!(frame_indices(5, 4, 1).is_err());
        assert!(frame_indices(0, 4, 0).is_err());
    }

    #[test]
    fn test_quality_parse() {
        assert_eq!("original".parse::<Quality>().unwrap(), Quality::Original);
        assert_eq!("Compressed".parse::<Quality>().unwrap(), Quality::Compressed);
        assert!("raw".parse::<Quality>().is_err());
    }

    #[test]
    fn test_original_encoding_is_lossless() {
        let img = RgbImage::from_fn(7, 5, |x, y| image::Rgb([x as u8 * 30, y as u8 * 40, 9]));
        let encoded = encode_image(&img, Quality::Original, 90).unwrap();
        assert_eq!(encoded.mime, "image/png");
        assert_eq!(encoded.decode(0).unwrap(), img);

        let jpeg = encode_image(&img, Quality::Compressed, 90).unwrap();
        assert_eq!(jpeg.mime, "image/jpeg");
        assert_eq!(jpeg.decode(0).unwrap().dimensions(), (7, 5));
    }
}
