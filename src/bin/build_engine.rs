/// 预构建 TensorRT 引擎: ONNX 姿态模型 → 引擎缓存 (默认 FP16)
///
/// 只用 TensorRT 执行器, 不可用即失败; 结束时缓存目录里必须有引擎文件.
/// 推流服务使用相同的 --trt-cache 目录即可跳过首帧编译.
/// 直接运行: cargo run --bin build-engine --release -- -m models/yolov8n-pose.onnx
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{ArgAction, Parser};
use mimalloc::MiMalloc;
use pose_stream::{cached_engines, models, ExtractorKind, ModelConfig, OrtEP, YOLOTask};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "构建并缓存 TensorRT 引擎", long_about = None)]
struct Args {
    /// ONNX 模型路径
    #[arg(short, long, default_value = "models/yolov8n-pose.onnx")]
    model: String,

    /// 姿态提取器类型
    #[arg(short, long, value_enum, default_value_t = ExtractorKind::Yolo)]
    extractor: ExtractorKind,

    /// GPU 设备号
    #[arg(long, default_value_t = 0)]
    device_id: i32,

    /// FP16 半精度
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    fp16: bool,

    /// 引擎缓存目录
    #[arg(long, default_value = "trt_cache")]
    trt_cache: PathBuf,

    /// 模型输入尺寸
    #[arg(long)]
    imgsz: Option<u32>,

    /// 关键点数量
    #[arg(long)]
    nk: Option<usize>,
}

/// 引擎构建只用 TensorRT, 不允许回退
fn engine_config(args: &Args) -> ModelConfig {
    ModelConfig {
        path: args.model.clone(),
        kind: args.extractor,
        task: YOLOTask::Pose,
        ep: OrtEP::Trt(args.device_id),
        trt_fp16: args.fp16,
        trt_cache: Some(args.trt_cache.clone()),
        strict_ep: true,
        input_size: args
            .imgsz
            .unwrap_or_else(|| args.extractor.default_input_size()),
        nk: args
            .nk
            .unwrap_or_else(|| args.extractor.default_num_keypoints()),
        conf: 0.25,
        kconf: 0.5,
        iou: 0.45,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = engine_config(&args);

    info!(
        "🔧 构建引擎: {} | GPU {} | FP16 {} | 缓存 {}",
        config.path,
        args.device_id,
        args.fp16,
        args.trt_cache.display()
    );

    // 首次推理触发引擎编译并写入缓存
    let t = Instant::now();
    if let Err(e) = models::load(&config) {
        error!("❌ {}", e);
        return ExitCode::FAILURE;
    }

    match cached_engines(&args.trt_cache) {
        Ok(engines) if !engines.is_empty() => {
            for engine in &engines {
                info!("💾 {}", engine.display());
            }
            info!(
                "✅ 引擎已就绪 ({:.1}s), 推流服务请使用: --trt --trt-cache {}{}",
                t.elapsed().as_secs_f64(),
                args.trt_cache.display(),
                if args.fp16 { " --fp16" } else { "" }
            );
            ExitCode::SUCCESS
        }
        Ok(_) => {
            error!("❌ 缓存目录 {} 中没有生成引擎文件", args.trt_cache.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("❌ 无法读取缓存目录 {}: {}", args.trt_cache.display(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_is_strict_trt() {
        let args = Args::try_parse_from(["build-engine", "--device-id", "1"]).unwrap();
        let config = engine_config(&args);
        assert_eq!(config.ep, OrtEP::Trt(1));
        assert!(config.strict_ep);
        assert!(config.trt_fp16);
        assert_eq!(config.trt_cache, Some(PathBuf::from("trt_cache")));
    }
}
