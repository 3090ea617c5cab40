// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 启动参数与运行配置
pub mod error; // 错误分类
pub mod input; // 视频输入系统
pub mod models; // 姿态模型接口与具体实现
pub mod ort_backend; // ONNX Runtime 会话
pub mod pipeline; // 读帧 → 推理 → 发送 会话循环
pub mod server; // WebSocket 推送服务
pub mod types; // 帧与推送结果

pub use crate::config::{Args, ExtractorKind, ModelConfig, ServerConfig, SourceConfig};
pub use crate::error::{PipelineError, ReadError};
pub use crate::input::{FfmpegOpener, FrameSource, SourceDescriptor, SourceOpener};
pub use crate::models::{PoseModel, SharedModel};
pub use crate::ort_backend::{cached_engines, OrtBackend, OrtConfig, OrtEP, YOLOTask};
pub use crate::pipeline::{DeliverySink, ResultSink, Session, SessionEnd, SessionState};
pub use crate::server::PoseServer;
pub use crate::types::{Bbox, Frame, Landmark, Point2, PoseResult};

/// 非极大值抑制: 按置信度降序, 与已保留框 IoU 超过阈值的丢弃
pub fn non_max_suppression(xs: &mut Vec<(Bbox, Vec<Point2>)>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.0.confidence().total_cmp(&b1.0.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].0.iou(&xs[index].0);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
