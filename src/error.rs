//! 错误分类 (Error taxonomy)
//!
//! 只有 `SourceUnavailable` 和 `ModelLoad` 在启动时是致命的,
//! 其余错误都在会话或帧级别被恢复.

use thiserror::Error;

/// 推流流水线错误
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 视频源无法打开 (设备/流/文件)
    #[error("video source unavailable: {source_desc}: {reason}")]
    SourceUnavailable { source_desc: String, reason: String },

    /// 模型文件缺失/损坏/与任务不匹配
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    /// 客户端断开 (会话级, 可恢复)
    #[error("connection closed")]
    ConnectionClosed,

    /// 单帧推理异常 (丢弃该帧)
    #[error("inference failed on frame {frame_index}: {reason}")]
    Inference { frame_index: u64, reason: String },
}

/// 单次读取的失败结果
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// 源已耗尽或解码器已退出
    #[error("end of stream")]
    EndOfStream,

    /// 暂时读不到帧 (网络抖动等), 调用方应等待后重试
    #[error("transient read failure: {0}")]
    Transient(String),
}
