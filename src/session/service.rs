// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 跟踪服务
//! Tracking operations over an injected session store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use image::imageops;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::composite::{render_preview, PreviewStyle};
use super::{SessionRange, SessionStore, Trajectory, TrajectoryPoint};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackError};
use crate::input::{encode_image, EncodedFrame, Frame, FrameSource, Quality};
use crate::pipeline::runner::{track, track_batch, CancelToken, SparseTrack, TrackJob};
use crate::tracker::{BackendKind, BackendRegistry};
use crate::types::{BBox, ObjectId};

/// 单目标区间跟踪结果
#[derive(Clone, Debug, Serialize)]
pub struct RangeTrack {
    pub object_id: ObjectId,
    pub frame_start: u32,
    pub frame_end: u32,
    pub initial_box: BBox,
    pub backend: BackendKind,
    pub track: SparseTrack,
}

/// 批量跟踪结果: 成功的目标与失败的目标分开返回
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub tracks: Vec<(ObjectId, SparseTrack)>,
    pub failures: Vec<(ObjectId, TrackError)>,
}

impl BatchOutcome {
    pub fn get(&self, object_id: ObjectId) -> Option<&SparseTrack> {
        self.tracks
            .iter()
            .find(|(id, _)| *id == object_id)
            .map(|(_, track)| track)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct TrackingService {
    config: TrackerConfig,
    frames: Arc<dyn FrameSource>,
    registry: Arc<BackendRegistry>,
    store: Arc<SessionStore>,
}

impl TrackingService {
    pub fn new(
        config: TrackerConfig,
        frames: Arc<dyn FrameSource>,
        store: Arc<SessionStore>,
    ) -> Result<Self> {
        let registry = BackendRegistry::new(config.local.clone(), config.siamese.clone());
        Self::with_registry(config, frames, Arc::new(registry), store)
    }

    pub fn with_registry(
        config: TrackerConfig,
        frames: Arc<dyn FrameSource>,
        registry: Arc<BackendRegistry>,
        store: Arc<SessionStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            frames,
            registry,
            store,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    // ========== 单目标区间 ==========

    /// 在 `[frame_start, frame_end]` 上跟踪一个目标, 不写入会话
    pub fn track_range(
        &self,
        object_id: ObjectId,
        frame_start: u32,
        frame_end: u32,
        initial: BBox,
        backend: BackendKind,
    ) -> Result<RangeTrack> {
        self.track_range_with(object_id, frame_start, frame_end, initial, backend, &CancelToken::new())
    }

    pub fn track_range_with(
        &self,
        object_id: ObjectId,
        frame_start: u32,
        frame_end: u32,
        initial: BBox,
        backend: BackendKind,
        cancel: &CancelToken,
    ) -> Result<RangeTrack> {
        let started = Instant::now();
        initial.validate()?;
        if frame_end < frame_start {
            return Err(TrackError::invalid(format!(
                "frame range [{frame_start}, {frame_end}] is empty"
            )));
        }
        self.check_limits(1, frame_end - frame_start)?;
        let mut tracker = self.registry.create(backend)?;

        let frames = self.fetch_frames(frame_start, frame_end, self.config.stride)?;
        let first = frames
            .first()
            .ok_or_else(|| TrackError::frame_source(frame_start, "no frames returned"))?;
        let (width, height) = first.image.dimensions();
        if !initial.fits_in(width, height) {
            return Err(TrackError::invalid(format!(
                "box {initial} outside frame ({width}x{height})"
            )));
        }

        let t0 = Instant::now();
        let sparse = if self.config.crop_background {
            let region = background_region(&initial, width, height)?;
            let cropped: Vec<Frame> = frames.iter().map(|f| crop_frame(f, &region)).collect();
            let local = initial.translate(-region.x1, -region.y1);
            let mut sparse = track(&cropped, local, tracker.as_mut(), cancel)?;
            sparse.translate(region.x1, region.y1);
            sparse
        } else {
            track(&frames, initial, tracker.as_mut(), cancel)?
        };
        debug!(
            "tracking time: {:.1}ms",
            t0.elapsed().as_secs_f64() * 1000.0
        );
        info!(
            "object {object_id}: {} boxes over [{frame_start}, {frame_end}] ({backend}, {:.1}ms total)",
            sparse.len(),
            started.elapsed().as_secs_f64() * 1000.0
        );

        Ok(RangeTrack {
            object_id,
            frame_start,
            frame_end,
            initial_box: initial,
            backend,
            track: sparse,
        })
    }

    // ========== NORMAL ==========

    /// 清空会话后为每个目标建立新轨迹
    ///
    /// 会话在跟踪全部完成后才被整体替换; 参数错误、后端不可用、帧源失败或取消时保持原状。
    /// 跟踪失败的目标不会出现在新会话中。
    pub fn track_all_normal(
        &self,
        objects: &[(ObjectId, BBox)],
        frame_start: u32,
        frames_to_track: u32,
    ) -> Result<BatchOutcome> {
        self.track_all_normal_with(objects, frame_start, frames_to_track, &CancelToken::new())
    }

    pub fn track_all_normal_with(
        &self,
        objects: &[(ObjectId, BBox)],
        frame_start: u32,
        frames_to_track: u32,
        cancel: &CancelToken,
    ) -> Result<BatchOutcome> {
        if objects.is_empty() {
            return Err(TrackError::invalid("no objects to track"));
        }
        self.check_limits(objects.len(), frames_to_track)?;
        let mut seen = BTreeSet::new();
        for (object_id, bbox) in objects {
            if !seen.insert(*object_id) {
                return Err(TrackError::invalid(format!("object {object_id} listed twice")));
            }
            bbox.validate()
                .map_err(|e| e.for_object(*object_id, "normal"))?;
        }
        let frame_end = end_frame(frame_start, frames_to_track)?;
        let stride = self.config.stride;
        self.registry.ensure(self.config.batch_backend)?;

        let mut writer = self.store.writer();
        let frames = self.fetch_frames(frame_start, frame_end, stride)?;
        let first = frames
            .first()
            .ok_or_else(|| TrackError::frame_source(frame_start, "no frames returned"))?;
        let (width, height) = first.image.dimensions();
        for (object_id, bbox) in objects {
            if !bbox.fits_in(width, height) {
                return Err(TrackError::invalid(format!(
                    "box {bbox} outside frame ({width}x{height})"
                ))
                .for_object(*object_id, "normal"));
            }
        }

        let jobs: Vec<TrackJob> = objects
            .iter()
            .map(|&(object_id, initial)| TrackJob {
                object_id,
                initial,
                frames: &frames,
            })
            .collect();
        let results = track_batch(
            &self.registry,
            self.config.batch_backend,
            &jobs,
            self.config.workers,
            cancel,
        );
        if cancel.is_cancelled() {
            return Err(TrackError::Cancelled);
        }

        let mut outcome = BatchOutcome::default();
        let mut trajectories = BTreeMap::new();
        for ((object_id, result), job) in results.into_iter().zip(&jobs) {
            let built = result.and_then(|track| {
                let mut trajectory = Trajectory::new();
                trajectory.push(TrajectoryPoint::cut(&first.image, job.initial, first.index)?)?;
                extend_trajectory(&mut trajectory, &frames[1..], &track)?;
                Ok((trajectory, track))
            });
            match built {
                Ok((trajectory, track)) => {
                    trajectories.insert(object_id, trajectory);
                    outcome.tracks.push((object_id, track));
                }
                Err(e) => {
                    warn!("object {object_id} not tracked: {e}");
                    outcome.failures.push((object_id, e.for_object(object_id, "normal")));
                }
            }
        }

        let last = frames.last().map_or(frame_start, |f| f.index);
        writer.replace_all(
            trajectories,
            Some(SessionRange {
                frame_start,
                frame_end: last,
                stride,
            }),
        );
        info!(
            "normal: {} objects tracked over [{frame_start}, {last}], {} failed",
            outcome.tracks.len(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    // ========== APPEND ==========

    /// 从已有轨迹的末尾继续跟踪
    ///
    /// 起点取第一个已有目标的最后一帧, 终点为起点 + `frames_to_track`。
    /// 每个目标在自己的最后一帧上用最后的框重新初始化。
    pub fn track_all_append(
        &self,
        object_ids: &[ObjectId],
        frames_to_track: u32,
    ) -> Result<BatchOutcome> {
        self.track_all_append_with(object_ids, frames_to_track, &CancelToken::new())
    }

    pub fn track_all_append_with(
        &self,
        object_ids: &[ObjectId],
        frames_to_track: u32,
        cancel: &CancelToken,
    ) -> Result<BatchOutcome> {
        if object_ids.is_empty() {
            return Err(TrackError::invalid("no objects to track"));
        }
        self.check_limits(object_ids.len(), frames_to_track)?;
        self.registry.ensure(self.config.batch_backend)?;

        let mut writer = self.store.writer();
        let mut outcome = BatchOutcome::default();
        let mut existing = Vec::new();
        for &object_id in object_ids {
            match writer.get(object_id).filter(|t| !t.is_empty()) {
                Some(trajectory) => existing.push((object_id, trajectory)),
                None => outcome.failures.push((
                    object_id,
                    TrackError::NoExistingTrajectory {
                        object_id,
                        operation: "append",
                    },
                )),
            }
        }
        let Some(start) = existing
            .first()
            .and_then(|(_, t)| t.last())
            .map(|p| p.frame_index)
        else {
            return Ok(outcome);
        };
        let frame_end = end_frame(start, frames_to_track)?;
        let stride = self.store.range().map_or(self.config.stride, |r| r.stride);

        // 同一起点的目标共用一次取帧
        let mut runs: BTreeMap<u32, Vec<Frame>> = BTreeMap::new();
        for (_, trajectory) in &existing {
            if let Some(point) = trajectory.last() {
                if point.frame_index <= frame_end && !runs.contains_key(&point.frame_index) {
                    let frames = self.fetch_frames(point.frame_index, frame_end, stride)?;
                    runs.insert(point.frame_index, frames);
                }
            }
        }

        let mut jobs = Vec::new();
        for (object_id, trajectory) in &existing {
            let Some(point) = trajectory.last() else { continue };
            match runs.get(&point.frame_index) {
                Some(frames) => jobs.push(TrackJob {
                    object_id: *object_id,
                    initial: point.bbox,
                    frames,
                }),
                // 已经越过终点
                None => outcome.tracks.push((*object_id, SparseTrack::default())),
            }
        }
        let results = track_batch(
            &self.registry,
            self.config.batch_backend,
            &jobs,
            self.config.workers,
            cancel,
        );
        if cancel.is_cancelled() {
            return Err(TrackError::Cancelled);
        }

        for ((object_id, result), job) in results.into_iter().zip(&jobs) {
            let previous = existing
                .iter()
                .find(|(id, _)| *id == object_id)
                .map(|(_, t)| t);
            let built = result.and_then(|track| {
                let mut trajectory = previous.map(|t| (**t).clone()).unwrap_or_default();
                extend_trajectory(&mut trajectory, &job.frames[1..], &track)?;
                Ok((trajectory, track))
            });
            match built {
                Ok((trajectory, track)) => {
                    writer.publish(object_id, trajectory);
                    outcome.tracks.push((object_id, track));
                }
                Err(e) => {
                    warn!("object {object_id} not appended: {e}");
                    outcome.failures.push((object_id, e.for_object(object_id, "append")));
                }
            }
        }

        let frame_start = self.store.range().map_or(start, |r| r.frame_start.min(start));
        let last = runs
            .values()
            .filter_map(|frames| frames.last())
            .map(|f| f.index)
            .max()
            .unwrap_or(start);
        writer.set_range(SessionRange {
            frame_start,
            frame_end: last,
            stride,
        });
        info!(
            "append: {} objects continued from frame {start} to {last}, {} failed",
            outcome.tracks.len(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    // ========== EDIT ==========

    /// 替换轨迹中一个点的框和裁剪图; 之后的点不会重新计算
    pub fn edit_point(
        &self,
        object_id: ObjectId,
        trajectory_index: usize,
        corrected: BBox,
        source_frame_index: u32,
    ) -> Result<()> {
        corrected
            .validate()
            .map_err(|e| e.for_object(object_id, "edit"))?;

        let mut writer = self.store.writer();
        let trajectory = writer.get(object_id).ok_or(TrackError::NoExistingTrajectory {
            object_id,
            operation: "edit",
        })?;
        if trajectory_index >= trajectory.len() {
            return Err(TrackError::invalid(format!(
                "trajectory index {trajectory_index} out of range [0, {})",
                trajectory.len()
            ))
            .for_object(object_id, "edit"));
        }

        let frame = self
            .frames
            .get_frame(source_frame_index, self.config.frame_quality)?
            .decode(source_frame_index)?;
        let point = TrajectoryPoint::cut(&frame, corrected, source_frame_index)
            .map_err(|e| e.for_object(object_id, "edit"))?;

        let mut next = (*trajectory).clone();
        next.replace(trajectory_index, point.bbox, point.crop)?;
        writer.publish(object_id, next);
        debug!("object {object_id}: point {trajectory_index} set to {corrected}");
        Ok(())
    }

    // ========== 预览 ==========

    /// 合成预览帧 (JPEG); 会话为空时原样返回底图
    pub fn read_composite(
        &self,
        object_id: ObjectId,
        trajectory_index: usize,
        base_frame_index: u32,
        quality: Quality,
    ) -> Result<EncodedFrame> {
        let encoded = self.frames.get_frame(base_frame_index, quality)?;
        let trails = self.store.snapshot();
        if trails.is_empty() {
            return Ok(encoded);
        }

        let trajectory = trails
            .get(&object_id)
            .ok_or(TrackError::NoExistingTrajectory {
                object_id,
                operation: "preview",
            })?;
        let focus = trajectory.get(trajectory_index).ok_or_else(|| {
            TrackError::invalid(format!(
                "trajectory index {trajectory_index} out of range [0, {})",
                trajectory.len()
            ))
            .for_object(object_id, "preview")
        })?;

        let base = encoded.decode(base_frame_index)?;
        let style = PreviewStyle {
            stride: self.config.preview_stride,
            centroid_radius: self.config.centroid_radius,
            ..Default::default()
        };
        let canvas = render_preview(&base, &trails, &focus.bbox, &style);
        encode_image(&canvas, Quality::Compressed, self.config.jpeg_quality)
    }

    // ========== 会话访问 ==========

    pub fn flush(&self) {
        self.store.writer().flush();
        info!("tracking session flushed");
    }

    pub fn trajectory(&self, object_id: ObjectId) -> Result<Arc<Trajectory>> {
        self.store
            .get(object_id)
            .ok_or(TrackError::NoExistingTrajectory {
                object_id,
                operation: "read",
            })
    }

    pub fn range(&self) -> Option<SessionRange> {
        self.store.range()
    }

    // ========== 内部 ==========

    fn check_limits(&self, objects: usize, frames_to_track: u32) -> Result<()> {
        if objects > self.config.max_objects_per_request {
            return Err(TrackError::invalid(format!(
                "{objects} objects exceed the limit of {}",
                self.config.max_objects_per_request
            )));
        }
        if frames_to_track > self.config.max_frames_per_request {
            return Err(TrackError::invalid(format!(
                "{frames_to_track} frames exceed the limit of {}",
                self.config.max_frames_per_request
            )));
        }
        Ok(())
    }

    fn fetch_frames(&self, start: u32, end: u32, stride: u32) -> Result<Vec<Frame>> {
        let t0 = Instant::now();
        let frames = self
            .frames
            .get_frame_range(start, end, self.config.frame_quality, stride)?;
        debug!(
            "frame fetching time: {:.1}ms ({} frames from {start})",
            t0.elapsed().as_secs_f64() * 1000.0,
            frames.len()
        );
        Ok(frames)
    }
}

fn end_frame(start: u32, frames_to_track: u32) -> Result<u32> {
    start
        .checked_add(frames_to_track)
        .ok_or_else(|| TrackError::invalid("frame range overflows"))
}

/// 为每个成功跟踪的帧裁剪一个轨迹点
fn extend_trajectory(trajectory: &mut Trajectory, frames: &[Frame], track: &SparseTrack) -> Result<()> {
    for frame in frames {
        if let Some(bbox) = track.get(frame.index) {
            trajectory.push(TrajectoryPoint::cut(&frame.image, *bbox, frame.index)?)?;
        }
    }
    Ok(())
}

/// 以目标框为中心的 5x5 网格区域 (四周各扩展两倍宽高)
fn background_region(bbox: &BBox, width: u32, height: u32) -> Result<BBox> {
    let (w, h) = (bbox.width(), bbox.height());
    BBox::new(bbox.x1 - 2 * w, bbox.y1 - 2 * h, bbox.x2 + 2 * w, bbox.y2 + 2 * h)?
        .clamp_to(width, height)
        .ok_or_else(|| TrackError::invalid(format!("box {bbox} outside frame")))
}

fn crop_frame(frame: &Frame, region: &BBox) -> Frame {
    let image = imageops::crop_imm(
        frame.image.as_ref(),
        region.x1 as u32,
        region.y1 as u32,
        region.width() as u32,
        region.height() as u32,
    )
    .to_image();
    Frame {
        index: frame.index,
        image: Arc::new(image),
    }
}
