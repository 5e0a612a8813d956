// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误类型
//! Error taxonomy for the tracking core

use std::time::Duration;

use thiserror::Error;

use crate::types::ObjectId;

pub type Result<T, E = TrackError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TrackError {
    /// 参数错误 (坐标、索引、限制)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown tracker backend `{0}`")]
    UnknownBackend(String),

    /// `update` 在 `init` 之前被调用
    #[error("tracker used before init")]
    NotInitialized,

    #[error("object {object_id} has no trajectory ({operation})")]
    NoExistingTrajectory {
        object_id: ObjectId,
        operation: &'static str,
    },

    #[error("backend `{backend}` unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("frame source failed at frame {index}: {reason}")]
    FrameSource { index: u32, reason: String },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("tracking job cancelled")]
    Cancelled,

    #[error("tracking job timed out after {0:?}")]
    Timeout(Duration),

    /// 单个目标的失败, 附带上下文
    #[error("{operation} failed for object {object_id}: {source}")]
    Object {
        object_id: ObjectId,
        operation: &'static str,
        #[source]
        source: Box<TrackError>,
    },
}

impl TrackError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        TrackError::InvalidArgument(msg.into())
    }

    pub fn frame_source(index: u32, reason: impl ToString) -> Self {
        TrackError::FrameSource {
            index,
            reason: reason.to_string(),
        }
    }

    /// Attach the object and operation a failure belongs to.
    pub fn for_object(self, object_id: ObjectId, operation: &'static str) -> Self {
        match self {
            // already carries its own context
            e @ (TrackError::Object { .. } | TrackError::NoExistingTrajectory { .. }) => e,
            e => TrackError::Object {
                object_id,
                operation,
                source: Box::new(e),
            },
        }
    }

    /// The innermost error, looking through `Object` wrappers.
    pub fn root(&self) -> &TrackError {
        match self {
            TrackError::Object { source, .. } => source.root(),
            e => e,
        }
    }
}
