// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 跟踪流水线 (Tracking Pipeline)
///
/// - runner: 单目标逐帧跟踪 + 多目标并行批处理
/// - jobs:   后台任务队列 (提交 / 轮询 / 取消 / 超时)
pub mod jobs;
pub mod runner;

pub use jobs::{JobHandle, JobId, JobOutput, JobQueue, JobRequest, JobStatus};
pub use runner::{track, track_batch, CancelToken, SparseTrack, TrackJob};
