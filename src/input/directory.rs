// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 图片目录帧源
/// Frames stored as numbered image files in one directory
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{encode_image, EncodedFrame, FrameSource, Quality};
use crate::error::{Result, TrackError};

const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    compressed_quality: u8,
}

impl DirectoryFrameSource {
    /// 扫描目录, 按文件名排序作为帧号
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| TrackError::frame_source(0, e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && mime_for(path).is_some())
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(TrackError::frame_source(
                0,
                format!("no image files in {}", dir.display()),
            ));
        }
        info!("frame source: {} frames in {}", files.len(), dir.display());

        Ok(Self {
            files,
            compressed_quality: 75,
        })
    }

    pub fn with_compressed_quality(mut self, quality: u8) -> Self {
        self.compressed_quality = quality;
        self
    }

    pub fn path(&self, index: u32) -> Option<&Path> {
        self.files.get(index as usize).map(PathBuf::as_path)
    }
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "image/bmp",
    })
}

impl FrameSource for DirectoryFrameSource {
    fn frame_count(&self) -> u32 {
        self.files.len() as u32
    }

    fn get_frame(&self, index: u32, quality: Quality) -> Result<EncodedFrame> {
        let path = self.path(index).ok_or_else(|| {
            TrackError::frame_source(
                index,
                format!("out of range, source has {} frames", self.files.len()),
            )
        })?;
        let mime = mime_for(path).unwrap_or("application/octet-stream");
        let bytes = fs::read(path).map_err(|e| TrackError::frame_source(index, e))?;

        // 原图直接返回; 压缩质量下非JPEG文件重新编码
        if quality == Quality::Original || mime == "image/jpeg" {
            return Ok(EncodedFrame { bytes, mime });
        }
        debug!("re-encoding frame {index} as jpeg");
        let image = EncodedFrame { bytes, mime }.decode(index)?;
        encode_image(&image, Quality::Compressed, self.compressed_quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::textured_frames;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("annotrack-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_directory_frames_sorted_by_name() {
        let dir = scratch_dir("dir-source");
        let frames = textured_frames(3, 24, 16, (2, 0));
        for (i, frame) in frames.iter().enumerate().rev() {
            frame.save(dir.join(format!("frame_{i:06}.png"))).unwrap();
        }
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let source = DirectoryFrameSource::open(&dir).unwrap();
        assert_eq!(source.frame_count(), 3);

        let original = source.get_frame(2, Quality::Original).unwrap();
        assert_eq!(original.mime, "image/png");
        assert_eq!(original.decode(2).unwrap(), frames[2]);

        let compressed = source.get_frame(0, Quality::Compressed).unwrap();
        assert_eq!(compressed.mime, "image/jpeg");

        let range = source.get_frame_range(0, 2, Quality::Original, 2).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(*range[1].image, frames[2]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_directory_fails() {
        let dir = scratch_dir("empty-source");
        assert!(matches!(
            DirectoryFrameSource::open(&dir),
            Err(TrackError::FrameSource { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
