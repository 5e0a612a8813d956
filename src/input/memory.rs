// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 内存帧源
/// In-memory frame sequence (already decoded)
use std::sync::Arc;

use image::RgbImage;

use super::{clamp_end, encode_image, frame_indices, EncodedFrame, Frame, FrameSource, Quality};
use crate::error::{Result, TrackError};

pub struct MemoryFrameSource {
    frames: Vec<Arc<RgbImage>>,
    jpeg_quality: u8,
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            jpeg_quality: 90,
        }
    }

    pub fn with_jpeg_quality(mut self, jpeg_quality: u8) -> Self {
        self.jpeg_quality = jpeg_quality;
        self
    }

    fn frame(&self, index: u32) -> Result<&Arc<RgbImage>> {
        self.frames.get(index as usize).ok_or_else(|| {
            TrackError::frame_source(
                index,
                format!("out of range, source has {} frames", self.frames.len()),
            )
        })
    }
}

impl FrameSource for MemoryFrameSource {
    fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    fn get_frame(&self, index: u32, quality: Quality) -> Result<EncodedFrame> {
        encode_image(self.frame(index)?, quality, self.jpeg_quality)
    }

    /// 直接共享已解码的帧, 不经过编解码
    fn get_frame_range(
        &self,
        start: u32,
        end: u32,
        _quality: Quality,
        stride: u32,
    ) -> Result<Vec<Frame>> {
        let last = clamp_end(self.frame_count(), start, end)?;
        frame_indices(start, last, stride)?
            .into_iter()
            .map(|index| {
                Ok(Frame {
                    index,
                    image: Arc::clone(self.frame(index)?),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::textured_frames;

    #[test]
    fn test_range_truncates_at_end() {
        let source = MemoryFrameSource::new(textured_frames(7, 32, 24, (0, 0)));
        let frames = source.get_frame_range(2, 100, Quality::Original, 2).unwrap();
        let indices: Vec<u32> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![2, 4, 6]);
    }

    #[test]
    fn test_range_past_end_fails() {
        let source = MemoryFrameSource::new(textured_frames(3, 16, 16, (0, 0)));
        assert!(matches!(
            source.get_frame_range(3, 5, Quality::Original, 1),
            Err(TrackError::FrameSource { index: 3, .. })
        ));
        assert!(source.get_frame(9, Quality::Original).is_err());
    }

    #[test]
    fn test_get_frame_round_trips_original() {
        let frames = textured_frames(2, 20, 10, (1, 0));
        let source = MemoryFrameSource::new(frames.clone());
        let encoded = source.get_frame(1, Quality::Original).unwrap();
        assert_eq!(encoded.decode(1).unwrap(), frames[1]);
    }
}
