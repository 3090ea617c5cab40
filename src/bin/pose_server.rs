/// 姿态推流服务: 视频源 → 姿态估计 → WebSocket JSON
///
/// 主程序入口 - 直接运行: cargo run --bin pose-server --release -- -s rtsp://... --trt
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use pose_stream::server::shutdown_signal;
use pose_stream::{models, Args, FfmpegOpener, PoseServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let server_config = args.server_config()?;
    let model_config = args.model_config();
    let opener = Arc::new(FfmpegOpener::new(args.source_config()));

    info!("📦 模型: {} ({:?}, {:?})", model_config.path, model_config.kind, model_config.ep);

    // 模型加载较慢 (TensorRT 首次构建引擎), 放到阻塞线程
    let model = tokio::task::spawn_blocking(move || models::load(&model_config)).await??;
    info!("🦴 每帧推送 {} 个关键点", model.num_keypoints());
    let server = PoseServer::new(server_config, opener, models::shared(model));

    // 启动检查: 源不可用直接退出
    server.check_source()?;

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("🛑 正在关闭...");
        cancel.cancel();
    });

    server.run().await
}
