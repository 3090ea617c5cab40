/// 视频输入系统 (Video Input System)
///
/// - FrameSource:  按需读取一帧 (阻塞, 带超时)
/// - SourceOpener: 打开视频源, 每个会话一个独立句柄
/// - Decoder:      FFmpeg 实现 (RTSP / 本地摄像头 / 文件, 可选硬件解码)
/// - Filter:       解码帧过滤与 YUV → RGB 转换
pub mod decode_filter;
pub mod decoder;

pub use decode_filter::{DecodeFilter, HandOff};
pub use decoder::{get_camera_devices, FfmpegOpener, FfmpegSource};

use crate::error::{PipelineError, ReadError};
use crate::types::Frame;

/// 已打开的视频源
///
/// 句柄持有系统资源(设备/套接字/解码线程), drop 时必须确定性释放.
pub trait FrameSource: Send {
    /// 读取下一帧
    ///
    /// - `Err(ReadError::Transient)`: 暂时没有帧, 调用方等待后重试
    /// - `Err(ReadError::EndOfStream)`: 源已结束
    fn read(&mut self) -> Result<Frame, ReadError>;
}

/// 视频源工厂
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, PipelineError>;

    /// 用于日志的源描述
    fn describe(&self) -> String;
}

/// 视频源类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// 本地摄像头序号
    Camera(usize),
    /// 网络流 (rtsp/rtmp/http/udp...)
    Stream(String),
    /// 本地文件
    File(String),
}

impl SourceDescriptor {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = s.parse() {
                return SourceDescriptor::Camera(index);
            }
        }
        if s.contains("://") {
            SourceDescriptor::Stream(s.to_string())
        } else {
            SourceDescriptor::File(s.to_string())
        }
    }

    /// 实时源: 摄像头和网络流只保留最新帧, 文件逐帧交付
    pub fn is_live(&self) -> bool {
        !matches!(self, SourceDescriptor::File(_))
    }

    pub fn is_rtsp(&self) -> bool {
        matches!(
            self,
            SourceDescriptor::Stream(url) if url.to_ascii_lowercase().starts_with("rtsp")
        )
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::Camera(i) => write!(f, "camera #{}", i),
            SourceDescriptor::Stream(url) => write!(f, "{}", url),
            SourceDescriptor::File(path) => write!(f, "file {}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(SourceDescriptor::parse("0"), SourceDescriptor::Camera(0));
        assert_eq!(SourceDescriptor::parse(" 2 "), SourceDescriptor::Camera(2));
        assert_eq!(
            SourceDescriptor::parse("rtsp://10.0.0.75:8554/stream"),
            SourceDescriptor::Stream("rtsp://10.0.0.75:8554/stream".into())
        );
        assert_eq!(
            SourceDescriptor::parse("test_video.mp4"),
            SourceDescriptor::File("test_video.mp4".into())
        );
        assert_eq!(
            SourceDescriptor::parse("/data/2024.mp4"),
            SourceDescriptor::File("/data/2024.mp4".into())
        );
    }

    #[test]
    fn test_live_and_rtsp() {
        assert!(SourceDescriptor::parse("RTSP://cam/1").is_rtsp());
        assert!(!SourceDescriptor::parse("http://cam/1").is_rtsp());
        assert!(SourceDescriptor::parse("http://cam/1").is_live());
        assert!(SourceDescriptor::parse("1").is_live());
        assert!(!SourceDescriptor::parse("a.mp4").is_live());
    }
}
