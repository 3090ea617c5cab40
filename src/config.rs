/// 启动参数与运行配置
///
/// 命令行/环境变量只在启动时读取一次, 之后以显式配置结构传入各模块
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::ort_backend::{OrtEP, YOLOTask};

/// 姿态提取器实现 (每次部署必须明确指定)
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExtractorKind {
    /// YOLO pose 检测器, 17个COCO关键点, 无深度
    Yolo,
    /// BlazePose 风格关键点跟踪, 33个关键点, 带深度
    Landmark,
}

impl ExtractorKind {
    pub fn default_num_keypoints(&self) -> usize {
        match self {
            ExtractorKind::Yolo => 17,
            ExtractorKind::Landmark => 33,
        }
    }

    pub fn default_input_size(&self) -> u32 {
        match self {
            ExtractorKind::Yolo => 640,
            ExtractorKind::Landmark => 256,
        }
    }
}

/// 姿态推流服务参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "RTSP → 姿态估计 → WebSocket 实时推送", long_about = None)]
pub struct Args {
    /// 视频源: RTSP/HTTP地址, 本地文件, 或摄像头序号
    #[arg(short, long, env = "POSE_SOURCE", default_value = "rtsp://127.0.0.1:8554/stream")]
    pub source: String,

    /// 硬件解码器 (cuda/qsv/vaapi/videotoolbox...), 失败时回退软解
    #[arg(long, env = "POSE_HWACCEL")]
    pub hwaccel: Option<String>,

    /// 附加 FFmpeg 滤镜链 (原样传入, 不解析)
    #[arg(long, env = "POSE_PIPELINE")]
    pub pipeline: Option<String>,

    /// 监听地址
    #[arg(long, env = "POSE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// 监听端口
    #[arg(short, long, env = "POSE_PORT", default_value_t = 8765)]
    pub port: u16,

    /// ONNX 模型路径
    #[arg(short, long, env = "POSE_MODEL", default_value = "models/yolo11n-pose.onnx")]
    pub model: String,

    /// 姿态提取器类型
    #[arg(
        short,
        long,
        value_enum,
        env = "POSE_EXTRACTOR",
        default_value_t = ExtractorKind::Yolo
    )]
    pub extractor: ExtractorKind,

    /// GPU 设备号
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// 使用 CUDA 推理
    #[arg(long)]
    pub cuda: bool,

    /// 使用 TensorRT 推理 (优先于 --cuda)
    #[arg(long)]
    pub trt: bool,

    /// TensorRT FP16
    #[arg(long)]
    pub fp16: bool,

    /// TensorRT 引擎缓存目录
    #[arg(long, env = "POSE_TRT_CACHE")]
    pub trt_cache: Option<PathBuf>,

    /// 模型输入尺寸 (默认: yolo 640, landmark 256)
    #[arg(long)]
    pub imgsz: Option<u32>,

    /// 关键点数量 (默认: yolo 17, landmark 33)
    #[arg(long)]
    pub nk: Option<usize>,

    /// 人体置信度阈值
    #[arg(long, default_value_t = 0.25)]
    pub conf: f32,

    /// 关键点置信度阈值
    #[arg(long, default_value_t = 0.5)]
    pub kconf: f32,

    /// NMS IoU 阈值
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// 读帧失败后的重试间隔(ms)
    #[arg(long, default_value_t = 100)]
    pub retry_delay_ms: u64,

    /// 单次读帧超时(ms), 超时视为暂时失败
    #[arg(long, default_value_t = 2000)]
    pub read_timeout_ms: u64,

    /// 最大并发客户端数
    #[arg(long, default_value_t = 4)]
    pub max_clients: usize,

    /// 源结束(文件读完)后退出整个服务
    #[arg(long)]
    pub exit_on_eos: bool,
}

/// 视频源配置
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub descriptor: String,
    pub hwaccel: Option<String>,
    pub pipeline: Option<String>,
    pub read_timeout: Duration,
}

impl SourceConfig {
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            hwaccel: None,
            pipeline: None,
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// 模型配置
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub path: String,
    pub kind: ExtractorKind,
    pub task: YOLOTask,
    pub ep: OrtEP,
    pub trt_fp16: bool,
    pub trt_cache: Option<PathBuf>,
    /// 执行器不可用时直接失败, 不回退
    pub strict_ep: bool,
    pub input_size: u32,
    pub nk: usize,
    pub conf: f32,
    pub kconf: f32,
    pub iou: f32,
}

/// 推流服务配置
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub retry_delay: Duration,
    pub max_clients: usize,
    pub exit_on_eos: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8765)),
            retry_delay: Duration::from_millis(100),
            max_clients: 4,
            exit_on_eos: false,
        }
    }
}

impl Args {
    /// execution provider: TensorRT > CUDA > CPU
    pub fn ep(&self) -> OrtEP {
        if self.trt {
            OrtEP::Trt(self.device_id)
        } else if self.cuda {
            OrtEP::CUDA(self.device_id)
        } else {
            OrtEP::CPU
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            descriptor: self.source.clone(),
            hwaccel: self.hwaccel.clone(),
            pipeline: self.pipeline.clone(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            path: self.model.clone(),
            kind: self.extractor,
            task: YOLOTask::Pose,
            ep: self.ep(),
            trt_fp16: self.fp16,
            trt_cache: self.trt_cache.clone(),
            strict_ep: false,
            input_size: self
                .imgsz
                .unwrap_or_else(|| self.extractor.default_input_size()),
            nk: self
                .nk
                .unwrap_or_else(|| self.extractor.default_num_keypoints()),
            conf: self.conf,
            kconf: self.kconf,
            iou: self.iou,
        }
    }

    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let listen: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!("invalid listen address {}:{}: {}", self.host, self.port, e)
            })?;
        Ok(ServerConfig {
            listen,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_clients: self.max_clients.max(1),
            exit_on_eos: self.exit_on_eos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_extractor() {
        let args = Args::parse_from(["pose-server", "--extractor", "landmark"]);
        let m = args.model_config();
        assert_eq!(m.kind, ExtractorKind::Landmark);
        assert_eq!(m.nk, 33);
        assert_eq!(m.input_size, 256);
        assert_eq!(m.ep, OrtEP::CPU);

        let args = Args::parse_from(["pose-server", "--trt", "--cuda", "--device-id", "1"]);
        let m = args.model_config();
        assert_eq!(m.nk, 17);
        assert_eq!(m.input_size, 640);
        assert_eq!(m.ep, OrtEP::Trt(1));
    }

    #[test]
    fn test_server_config() {
        let args = Args::parse_from(["pose-server", "--host", "127.0.0.1", "-p", "9001"]);
        let s = args.server_config().unwrap();
        assert_eq!(s.listen, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(s.retry_delay, Duration::from_millis(100));

        let args = Args::parse_from(["pose-server", "--host", "not an ip"]);
        assert!(args.server_config().is_err());
    }
}
