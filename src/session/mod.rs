// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 跟踪会话 (Tracking Session)
///
/// 每个目标的累积轨迹 (框 + 帧号 + 裁剪图), 由调用方持有并注入服务
/// - 读: 短暂的读锁, 拿到 `Arc` 快照
/// - 写: 单一写锁串行化, 按目标整体替换 `Arc`, 读者不会看到半更新的轨迹
pub mod composite;
pub mod service;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use image::{imageops, RgbImage};
use serde::Serialize;

use crate::error::{Result, TrackError};
use crate::types::{BBox, ObjectId};

pub use composite::{render_preview, PreviewStyle};
pub use service::{BatchOutcome, RangeTrack, TrackingService};

// ========== 轨迹 ==========

/// 轨迹点: 框 + 帧号 + 该帧上框内的图像
#[derive(Clone, Debug)]
pub struct TrajectoryPoint {
    pub bbox: BBox,
    pub frame_index: u32,
    pub crop: Arc<RgbImage>,
}

impl TrajectoryPoint {
    /// 从帧中裁出框内区域; 框必须完全在帧内
    pub fn cut(frame: &RgbImage, bbox: BBox, frame_index: u32) -> Result<Self> {
        bbox.validate()?;
        let (w, h) = frame.dimensions();
        if !bbox.fits_in(w, h) {
            return Err(TrackError::invalid(format!(
                "box {bbox} outside frame {frame_index} ({w}x{h})"
            )));
        }
        let crop = imageops::crop_imm(
            frame,
            bbox.x1 as u32,
            bbox.y1 as u32,
            bbox.width() as u32,
            bbox.height() as u32,
        )
        .to_image();
        Ok(Self {
            bbox,
            frame_index,
            crop: Arc::new(crop),
        })
    }
}

/// 单个目标的有序轨迹, 帧号严格递增
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TrajectoryPoint> {
        self.points.get(index)
    }

    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.last()
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn push(&mut self, point: TrajectoryPoint) -> Result<()> {
        if let Some(last) = self.points.last() {
            if point.frame_index <= last.frame_index {
                return Err(TrackError::invalid(format!(
                    "frame {} does not follow frame {}",
                    point.frame_index, last.frame_index
                )));
            }
        }
        self.points.push(point);
        Ok(())
    }

    /// 替换第 `index` 个点的框和裁剪图, 帧号不变
    pub fn replace(&mut self, index: usize, bbox: BBox, crop: Arc<RgbImage>) -> Result<()> {
        let len = self.points.len();
        let point = self.points.get_mut(index).ok_or_else(|| {
            TrackError::invalid(format!("trajectory index {index} out of range [0, {len})"))
        })?;
        point.bbox = bbox;
        point.crop = crop;
        Ok(())
    }

    pub fn boxes(&self) -> Vec<BBox> {
        self.points.iter().map(|p| p.bbox).collect()
    }

    pub fn frame_indices(&self) -> Vec<u32> {
        self.points.iter().map(|p| p.frame_index).collect()
    }

    pub fn position_of(&self, frame_index: u32) -> Option<usize> {
        self.points
            .binary_search_by_key(&frame_index, |p| p.frame_index)
            .ok()
    }
}

// ========== 会话存储 ==========

/// 最近一次批量跟踪的帧区间
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SessionRange {
    pub frame_start: u32,
    pub frame_end: u32,
    pub stride: u32,
}

/// 目标 → 轨迹, 内存存储, 无淘汰, 需显式清空
#[derive(Default)]
pub struct SessionStore {
    trajectories: RwLock<BTreeMap<ObjectId, Arc<Trajectory>>>,
    range: RwLock<Option<SessionRange>>,
    writer: Mutex<()>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object_id: ObjectId) -> Option<Arc<Trajectory>> {
        self.read().get(&object_id).cloned()
    }

    /// 当前所有轨迹的快照
    pub fn snapshot(&self) -> BTreeMap<ObjectId, Arc<Trajectory>> {
        self.read().clone()
    }

    pub fn range(&self) -> Option<SessionRange> {
        *self.range.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 获取写锁; 所有修改串行执行
    pub fn writer(&self) -> StoreWriter<'_> {
        StoreWriter {
            store: self,
            _guard: self.writer.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ObjectId, Arc<Trajectory>>> {
        self.trajectories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// 持有写锁期间的修改接口
pub struct StoreWriter<'a> {
    store: &'a SessionStore,
    _guard: MutexGuard<'a, ()>,
}

impl StoreWriter<'_> {
    pub fn get(&self, object_id: ObjectId) -> Option<Arc<Trajectory>> {
        self.store.get(object_id)
    }

    /// 清空所有轨迹和区间
    pub fn flush(&mut self) {
        self.map_mut().clear();
        *self.range_mut() = None;
    }

    /// 整体替换一个目标的轨迹
    pub fn publish(&mut self, object_id: ObjectId, trajectory: Trajectory) {
        self.map_mut().insert(object_id, Arc::new(trajectory));
    }

    /// 一次性替换全部内容 (NORMAL 模式)
    pub fn replace_all(
        &mut self,
        trajectories: BTreeMap<ObjectId, Trajectory>,
        range: Option<SessionRange>,
    ) {
        let next = trajectories
            .into_iter()
            .map(|(id, t)| (id, Arc::new(t)))
            .collect();
        *self.map_mut() = next;
        *self.range_mut() = range;
    }

    pub fn set_range(&mut self, range: SessionRange) {
        *self.range_mut() = Some(range);
    }

    fn map_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ObjectId, Arc<Trajectory>>> {
        self.store
            .trajectories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn range_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<SessionRange>> {
        self.store
            .range
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
