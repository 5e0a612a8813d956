// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 后台跟踪任务队列
//! Submit tracking work, poll it, cancel it or wait with a deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::runner::CancelToken;
use crate::error::{Result, TrackError};
use crate::session::{BatchOutcome, RangeTrack, TrackingService};
use crate::tracker::BackendKind;
use crate::types::{BBox, ObjectId};

pub type JobId = u64;

/// 可提交的跟踪任务
#[derive(Clone, Debug)]
pub enum JobRequest {
    Range {
        object_id: ObjectId,
        frame_start: u32,
        frame_end: u32,
        initial: BBox,
        backend: BackendKind,
    },
    Normal {
        objects: Vec<(ObjectId, BBox)>,
        frame_start: u32,
        frames_to_track: u32,
    },
    Append {
        object_ids: Vec<ObjectId>,
        frames_to_track: u32,
    },
}

impl JobRequest {
    fn name(&self) -> &'static str {
        match self {
            JobRequest::Range { .. } => "range",
            JobRequest::Normal { .. } => "normal",
            JobRequest::Append { .. } => "append",
        }
    }
}

#[derive(Debug)]
pub enum JobOutput {
    Range(RangeTrack),
    Batch(BatchOutcome),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

struct QueuedJob {
    id: JobId,
    request: JobRequest,
    status: Arc<Mutex<JobStatus>>,
    cancel: CancelToken,
    result_tx: Sender<Result<JobOutput>>,
}

fn set_status(status: &Mutex<JobStatus>, next: JobStatus) {
    *status.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

// ========== 任务句柄 ==========

pub struct JobHandle {
    id: JobId,
    submitted_at: DateTime<Utc>,
    status: Arc<Mutex<JobStatus>>,
    cancel: CancelToken,
    result_rx: Receiver<Result<JobOutput>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 请求取消; 正在运行的任务在下一帧之前停止, 不写入会话
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn wait(self) -> Result<JobOutput> {
        self.result_rx.recv().unwrap_or(Err(TrackError::Cancelled))
    }

    /// 超时后取消任务并返回 `Timeout`
    pub fn wait_timeout(self, timeout: Duration) -> Result<JobOutput> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.cancel.cancel();
                warn!("job {} timed out after {timeout:?}, cancelled", self.id);
                Err(TrackError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(TrackError::Cancelled),
        }
    }

    /// 非阻塞地取结果; 未完成时返回 None
    pub fn try_result(&self) -> Option<Result<JobOutput>> {
        match self.result_rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TrackError::Cancelled)),
        }
    }
}

// ========== 任务队列 ==========

/// 后台线程按提交顺序执行任务
pub struct JobQueue {
    next_id: AtomicU64,
    tx: Option<Sender<QueuedJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    pub fn new(service: Arc<TrackingService>, workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<QueuedJob>();
        let workers = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    for job in rx.iter() {
                        run_job(&service, job);
                    }
                })
            })
            .collect();
        Self {
            next_id: AtomicU64::new(1),
            tx: Some(tx),
            workers,
        }
    }

    pub fn submit(&self, request: JobRequest) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(Mutex::new(JobStatus::Queued));
        let cancel = CancelToken::new();
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        debug!("job {id} ({}) queued", request.name());

        let job = QueuedJob {
            id,
            request,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            result_tx,
        };
        let sent = self.tx.as_ref().map(|tx| tx.send(job));
        if !matches!(sent, Some(Ok(()))) {
            set_status(&status, JobStatus::Cancelled);
        }

        JobHandle {
            id,
            submitted_at: Utc::now(),
            status,
            cancel,
            result_rx,
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        // 关闭通道, 等待剩余任务执行完
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_job(service: &TrackingService, job: QueuedJob) {
    let QueuedJob {
        id,
        request,
        status,
        cancel,
        result_tx,
    } = job;

    if cancel.is_cancelled() {
        set_status(&status, JobStatus::Cancelled);
        let _ = result_tx.send(Err(TrackError::Cancelled));
        return;
    }
    set_status(&status, JobStatus::Running);

    let result = match request {
        JobRequest::Range {
            object_id,
            frame_start,
            frame_end,
            initial,
            backend,
        } => service
            .track_range_with(object_id, frame_start, frame_end, initial, backend, &cancel)
            .map(JobOutput::Range),
        JobRequest::Normal {
            objects,
            frame_start,
            frames_to_track,
        } => service
            .track_all_normal_with(&objects, frame_start, frames_to_track, &cancel)
            .map(JobOutput::Batch),
        JobRequest::Append {
            object_ids,
            frames_to_track,
        } => service
            .track_all_append_with(&object_ids, frames_to_track, &cancel)
            .map(JobOutput::Batch),
    };

    let next = match &result {
        Ok(_) => JobStatus::Finished,
        Err(e) if matches!(e.root(), TrackError::Cancelled) => JobStatus::Cancelled,
        Err(_) => JobStatus::Failed,
    };
    set_status(&status, next);
    info!("job {id} {next:?}");
    let _ = result_tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::input::{MemoryFrameSource, Quality};
    use crate::session::SessionStore;
    use crate::test_util::textured_frames;

    fn queue() -> (Arc<TrackingService>, JobQueue) {
        let config = TrackerConfig {
            batch_backend: BackendKind::Local,
            frame_quality: Quality::Original,
            stride: 1,
            ..Default::default()
        };
        let service = Arc::new(
            TrackingService::new(
                config,
                Arc::new(MemoryFrameSource::new(textured_frames(80, 320, 240, (1, 0)))),
                Arc::new(SessionStore::new()),
            )
            .unwrap(),
        );
        let queue = JobQueue::new(Arc::clone(&service), 1);
        (service, queue)
    }

    fn normal(frames_to_track: u32) -> JobRequest {
        JobRequest::Normal {
            objects: vec![
                (1, BBox::new(40, 40, 120, 120).unwrap()),
                (2, BBox::new(160, 60, 240, 160).unwrap()),
            ],
            frame_start: 0,
            frames_to_track,
        }
    }

    #[test]
    fn test_job_runs_to_completion() {
        let (service, queue) = queue();
        let handle = queue.submit(normal(6));
        let id = handle.id();
        assert!(handle.submitted_at() <= Utc::now());

        match handle.wait().unwrap() {
            JobOutput::Batch(outcome) => assert_eq!(outcome.tracks.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(id, 1);
        assert!(service.trajectory(1).is_ok());

        let second = queue.submit(JobRequest::Append {
            object_ids: vec![1],
            frames_to_track: 3,
        });
        assert_eq!(second.id(), 2);
        assert!(second.wait().is_ok());
        assert_eq!(service.range().unwrap().frame_end, 9);
    }

    #[test]
    fn test_cancel_queued_job() {
        let (service, queue) = queue();
        let first = queue.submit(normal(60));
        let second = queue.submit(normal(4));
        second.cancel();

        assert!(first.wait().is_ok());
        assert!(matches!(second.wait(), Err(TrackError::Cancelled)));
        // the cancelled job never replaced the first run
        assert_eq!(service.range().unwrap().frame_end, 60);
    }

    #[test]
    fn test_wait_timeout_cancels() {
        let (_service, queue) = queue();
        let handle = queue.submit(normal(60));
        assert!(matches!(
            handle.wait_timeout(Duration::ZERO),
            Err(TrackError::Timeout(d)) if d == Duration::ZERO
        ));
    }

    #[test]
    fn test_failed_job_status() {
        let (_service, queue) = queue();
        let handle = queue.submit(JobRequest::Range {
            object_id: 1,
            frame_start: 0,
            frame_end: 4,
            initial: BBox::new(300, 200, 400, 300).unwrap(),
            backend: BackendKind::Local,
        });
        let result = loop {
            if let Some(result) = handle.try_result() {
                break result;
            }
            thread::sleep(Duration::from_millis(2));
        };
        assert!(matches!(result, Err(TrackError::InvalidArgument(_))));
        assert_eq!(handle.status(), JobStatus::Failed);
    }
}
