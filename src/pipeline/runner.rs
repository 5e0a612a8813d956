// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 批量跟踪执行器
//! Drives trackers over ordered frame runs, one tracker per object.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, TrackError};
use crate::input::Frame;
use crate::tracker::{BackendKind, BackendRegistry, Tracker};
use crate::types::{BBox, ObjectId};

// ========== 取消令牌 ==========

/// 协作式取消: 执行器在帧与帧之间检查
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ========== 稀疏轨迹 ==========

/// 帧号 → 框 的稀疏结果, 不含首帧 (调用方给出的框)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SparseTrack {
    pub boxes: BTreeMap<u32, BBox>,
    /// 跟踪丢失的帧号
    pub lost: Vec<u32>,
}

impl SparseTrack {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn get(&self, frame_index: u32) -> Option<&BBox> {
        self.boxes.get(&frame_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, BBox)> + '_ {
        self.boxes.iter().map(|(&index, &bbox)| (index, bbox))
    }

    pub fn last(&self) -> Option<(u32, BBox)> {
        self.boxes.iter().next_back().map(|(&index, &bbox)| (index, bbox))
    }

    /// 所有框平移 (裁剪背景跟踪后映射回整帧坐标)
    pub fn translate(&mut self, dx: i32, dy: i32) {
        for bbox in self.boxes.values_mut() {
            *bbox = bbox.translate(dx, dy);
        }
    }
}

/// 在 `frames[0]` 上初始化, 之后逐帧更新
///
/// 丢失的帧不留占位, 只记录在 `lost` 中, 也不重试。
pub fn track(
    frames: &[Frame],
    initial: BBox,
    tracker: &mut dyn Tracker,
    cancel: &CancelToken,
) -> Result<SparseTrack> {
    let first = frames
        .first()
        .ok_or_else(|| TrackError::invalid("no frames to track"))?;
    if frames.windows(2).any(|w| w[0].index >= w[1].index) {
        return Err(TrackError::invalid("frame indices must be strictly increasing"));
    }
    initial.validate()?;

    let (width, height) = first.image.dimensions();
    tracker.init(&first.image, initial.to_rect())?;

    let mut result = SparseTrack::default();
    for frame in &frames[1..] {
        if cancel.is_cancelled() {
            return Err(TrackError::Cancelled);
        }
        let rect = tracker.update(&frame.image)?;
        match rect.and_then(|r| BBox::from_rect(&r, width, height)) {
            Some(bbox) => {
                result.boxes.insert(frame.index, bbox);
            }
            None => result.lost.push(frame.index),
        }
    }
    Ok(result)
}

// ========== 多目标并行 ==========

/// 单个目标的跟踪任务
#[derive(Clone, Copy, Debug)]
pub struct TrackJob<'a> {
    pub object_id: ObjectId,
    pub initial: BBox,
    pub frames: &'a [Frame],
}

/// 每个目标一个独立跟踪器, 在有界线程池上并行; 结果按输入顺序返回
pub fn track_batch(
    registry: &BackendRegistry,
    backend: BackendKind,
    jobs: &[TrackJob<'_>],
    workers: usize,
    cancel: &CancelToken,
) -> Vec<(ObjectId, Result<SparseTrack>)> {
    if jobs.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, jobs.len());
    let started = Instant::now();

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    for pos in 0..jobs.len() {
        let _ = job_tx.send(pos);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for pos in job_rx.iter() {
                    let job = &jobs[pos];
                    let t0 = Instant::now();
                    let result = registry
                        .create(backend)
                        .and_then(|mut tracker| {
                            track(job.frames, job.initial, tracker.as_mut(), cancel)
                        });
                    debug!(
                        "object {} tracked over {} frames in {:.1}ms",
                        job.object_id,
                        job.frames.len(),
                        t0.elapsed().as_secs_f64() * 1000.0
                    );
                    if result_tx.send((pos, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<Option<Result<SparseTrack>>> = jobs.iter().map(|_| None).collect();
    for (pos, result) in result_rx.try_iter() {
        results[pos] = Some(result);
    }
    debug!(
        "{} objects tracked with {} workers in {:.1}ms",
        jobs.len(),
        workers,
        started.elapsed().as_secs_f64() * 1000.0
    );

    jobs.iter()
        .zip(results)
        .map(|(job, result)| (job.object_id, result.unwrap_or(Err(TrackError::Cancelled))))
        .collect()
}
