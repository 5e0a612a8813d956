// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 跟踪配置参数
pub mod error; // 错误类型
pub mod input; // 帧输入系统
pub mod pipeline; // 批量跟踪与任务队列
pub mod session; // 会话存储与跟踪服务
pub mod tracker; // 单目标跟踪器
pub mod types; // 边界框等基础类型

#[cfg(test)]
mod test_util;

pub use crate::config::TrackerConfig;
pub use crate::error::{Result, TrackError};
pub use crate::input::{DirectoryFrameSource, EncodedFrame, Frame, FrameSource, MemoryFrameSource, Quality};
pub use crate::pipeline::{CancelToken, JobHandle, JobQueue, JobRequest, JobStatus, SparseTrack};
pub use crate::session::{BatchOutcome, RangeTrack, SessionStore, Trajectory, TrackingService};
pub use crate::tracker::{BackendKind, BackendRegistry, Tracker};
pub use crate::types::{BBox, ObjectId, RectF};

/// 时间戳字符串, 用于输出文件命名
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
