/// 姿态模型统一接口与实现
///
/// # 架构说明
///
/// 每个实现 = `OrtBackend` (会话) + 纯函数解码器 (后处理):
/// - **YoloPose**: YOLOv8/YOLO11 pose, 17个COCO关键点, 2D
///   - 文件: `yolo_pose.rs`
/// - **LandmarkTracker**: BlazePose 风格关键点回归, 33个关键点, 带深度
///   - 文件: `landmark.rs`
///
/// 解码器与会话分离, 可以脱离 ONNX Runtime 单独测试.
///
/// ## 核心流程
/// ```text
/// Frame(RGB) → preprocess → ndarray张量 → OrtBackend::run → decode → PoseResult
/// ```
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::info;

use crate::config::{ExtractorKind, ModelConfig};
use crate::error::PipelineError;
use crate::ort_backend::{OrtBackend, OrtConfig, YOLOTask};
use crate::types::{Frame, PoseResult};

pub mod landmark;
pub mod yolo_pose;

pub use landmark::{LandmarkDecoder, LandmarkTracker};
pub use yolo_pose::{YoloPose, YoloPoseDecoder};

/// 姿态提取接口
///
/// `infer` 是同步阻塞调用(几十毫秒), 同一实例不可并发调用.
pub trait PoseModel: Send {
    /// 单帧推理; 没有人时返回 `found: false`, 只有意外错误才返回 Err
    fn infer(&mut self, frame: &Frame) -> Result<PoseResult>;

    /// 每个结果中的关键点数量 (固定)
    fn num_keypoints(&self) -> usize;

    /// 打印模型信息
    fn summary(&self);
}

/// 多会话共享的模型实例, 调用按锁串行
pub type SharedModel = Arc<Mutex<Box<dyn PoseModel>>>;

pub fn shared(model: Box<dyn PoseModel>) -> SharedModel {
    Arc::new(Mutex::new(model))
}

/// 加载模型: `load(path, task_kind)`
///
/// 加载后立即做一次预热推理并校验输出布局, 不匹配即视为加载失败.
pub fn load(config: &ModelConfig) -> Result<Box<dyn PoseModel>, PipelineError> {
    let fail = |reason: String| PipelineError::ModelLoad {
        path: config.path.clone(),
        reason,
    };

    if config.task != YOLOTask::Pose {
        return Err(fail(format!(
            "task {:?} is not supported, only pose models can be streamed",
            config.task
        )));
    }

    let engine = OrtBackend::build(OrtConfig {
        f: config.path.clone(),
        ep: config.ep,
        task: config.task,
        trt_fp16: config.trt_fp16,
        trt_cache: config.trt_cache.clone(),
        strict_ep: config.strict_ep,
        image_size: (config.input_size, config.input_size),
    })
    .map_err(|e| fail(format!("{:#}", e)))?;

    let mut model: Box<dyn PoseModel> = match config.kind {
        ExtractorKind::Yolo => Box::new(YoloPose::new(engine, config)),
        ExtractorKind::Landmark => Box::new(LandmarkTracker::new(engine, config)),
    };

    // 预热: 首次推理会触发 TensorRT 引擎构建, 同时校验输出维度
    let t = std::time::Instant::now();
    let warmup = Frame::filled(0, config.input_size, config.input_size, 114);
    model
        .infer(&warmup)
        .map_err(|e| fail(format!("warm-up inference failed: {:#}", e)))?;
    info!("🔥 模型预热完成: {:?}", t.elapsed());

    model.summary();
    Ok(model)
}

/// Sigmoid
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
