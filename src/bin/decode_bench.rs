/// 解码吞吐测试: 只解码不推理, 统计总帧数与平均帧率
///
/// 直接运行: cargo run --bin decode-bench --release -- -s test_video.mp4 --hwaccel cuda
/// 软解基线: 去掉 --hwaccel
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use mimalloc::MiMalloc;
use pose_stream::{FfmpegOpener, ReadError, SourceConfig, SourceOpener};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "硬件解码吞吐测试", long_about = None)]
struct Args {
    /// 视频源: 文件, RTSP地址, 或摄像头序号
    #[arg(short, long, default_value = "test_video.mp4")]
    source: String,

    /// 硬件解码器 (cuda/qsv/vaapi/videotoolbox...), 失败时回退软解; 不指定则纯软件解码
    #[arg(long)]
    hwaccel: Option<String>,

    /// 附加 FFmpeg 滤镜链
    #[arg(long)]
    pipeline: Option<String>,

    /// 最多解码帧数 (实时源没有结尾)
    #[arg(long)]
    max_frames: Option<u64>,

    /// 单次读帧超时(ms)
    #[arg(long, default_value_t = 2000)]
    read_timeout_ms: u64,

    /// 连续超时多少次后放弃
    #[arg(long, default_value_t = 5)]
    max_timeouts: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SourceConfig {
        descriptor: args.source.clone(),
        hwaccel: args.hwaccel.clone(),
        pipeline: args.pipeline.clone(),
        read_timeout: Duration::from_millis(args.read_timeout_ms),
    };

    let opener = FfmpegOpener::new(config);
    let mut source = match opener.open() {
        Ok(source) => source,
        Err(e) => {
            error!("❌ 无法打开视频, 请检查路径或解码器: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut frames: u64 = 0;
    let mut timeouts = 0;
    let start = Instant::now();

    loop {
        if args.max_frames.is_some_and(|max| frames >= max) {
            break;
        }
        match source.read() {
            Ok(_) => {
                frames += 1;
                timeouts = 0;
                if frames % 30 == 0 {
                    info!("已解码 {} 帧", frames);
                }
            }
            Err(ReadError::EndOfStream) => break,
            Err(ReadError::Transient(reason)) => {
                timeouts += 1;
                warn!("⚠️ {} ({}/{})", reason, timeouts, args.max_timeouts);
                if timeouts >= args.max_timeouts {
                    break;
                }
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    drop(source);

    let avg_fps = if elapsed > 0.0 {
        frames as f64 / elapsed
    } else {
        0.0
    };
    info!(
        "✅ 测试结束: {} 帧, 耗时 {:.2}s, 平均帧率 {:.2} FPS",
        frames, elapsed, avg_fps
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hwaccel_is_opt_in() {
        let args = Args::try_parse_from(["decode-bench", "-s", "clip.mp4"]).unwrap();
        assert_eq!(args.hwaccel, None);

        let args =
            Args::try_parse_from(["decode-bench", "-s", "clip.mp4", "--hwaccel", "cuda"]).unwrap();
        assert_eq!(args.hwaccel.as_deref(), Some("cuda"));
    }
}
