/// FFmpeg 视频源: RTSP / 网络流 / 本地摄像头 / 文件
///
/// 解码在 ez-ffmpeg 调度线程中进行, 通过 `DecodeFilter` 把 RGB 帧交给读取方.
/// 句柄 drop 时中止调度器, 释放设备和网络连接.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::core::scheduler::ffmpeg_scheduler::{FfmpegScheduler, Running};
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{info, warn};

use super::decode_filter::{DecodeFilter, HandOff};
use super::{FrameSource, SourceDescriptor, SourceOpener};
use crate::config::SourceConfig;
use crate::error::{PipelineError, ReadError};
use crate::types::Frame;

/// 解码输出像素格式, 由 `DecodeFilter` 转为 RGB24
const DECODE_FORMAT: &str = "format=yuv420p";

/// 一次运行中的解码: 调度器 + 帧接收端
struct DecodeLink {
    rx: Receiver<Frame>,
    scheduler: Option<FfmpegScheduler<Running>>,
    closed: Arc<AtomicBool>,
}

impl DecodeLink {
    /// 通知解码线程退出并中止调度器
    fn release(self) {
        self.closed.store(true, Ordering::Release);
        drop(self.rx);
        if let Some(sch) = self.scheduler {
            sch.abort();
        }
    }
}

/// 重建解码 (仅实时源)
type Reconnect = Box<dyn Fn() -> Result<DecodeLink, String> + Send>;

/// 打开的 FFmpeg 视频源
///
/// 实时源 (摄像头/网络流) 的解码线程退出视为网络抖动: 重建解码并返回暂时失败,
/// 只有文件读完才是 `EndOfStream`.
pub struct FfmpegSource {
    link: Option<DecodeLink>,
    reconnect: Option<Reconnect>,
    read_timeout: Duration,
    name: String,
    next_index: u64, // 跨重连保持单调
    reconnects: u64,
}

impl FfmpegSource {
    fn restart(&mut self) -> Result<Frame, ReadError> {
        let Some(reconnect) = &self.reconnect else {
            return Err(ReadError::EndOfStream);
        };
        self.reconnects += 1;
        warn!("🔄 视频源中断, 第{}次重连: {}", self.reconnects, self.name);
        match reconnect() {
            Ok(link) => {
                self.link = Some(link);
                info!("✅ 视频源已重连: {}", self.name);
                Err(ReadError::Transient(format!("{} reconnected", self.name)))
            }
            Err(e) => Err(ReadError::Transient(format!(
                "{} reconnect failed: {}",
                self.name, e
            ))),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<Frame, ReadError> {
        let Some(link) = &self.link else {
            return self.restart();
        };
        match link.rx.recv_timeout(self.read_timeout) {
            Ok(mut frame) => {
                frame.index = self.next_index;
                self.next_index += 1;
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => Err(ReadError::Transient(format!(
                "no frame from {} within {:?}",
                self.name, self.read_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(link) = self.link.take() {
                    link.release();
                }
                self.restart()
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.release();
        }
        info!("🔌 视频源已释放: {}", self.name);
    }
}

/// FFmpeg 视频源工厂
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    config: SourceConfig,
    descriptor: SourceDescriptor,
}

impl FfmpegOpener {
    pub fn new(config: SourceConfig) -> Self {
        let descriptor = SourceDescriptor::parse(&config.descriptor);
        Self { config, descriptor }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// 加速配置 (硬件解码或自定义滤镜) 是否存在
    fn has_tuning(&self) -> bool {
        self.config.hwaccel.is_some() || self.config.pipeline.is_some()
    }

    fn filter_desc(&self, tuned: bool) -> String {
        match (&self.config.pipeline, tuned) {
            (Some(p), true) if !p.trim().is_empty() => format!("{},{}", p.trim(), DECODE_FORMAT),
            _ => DECODE_FORMAT.to_string(),
        }
    }

    fn build_input(&self, tuned: bool) -> Input {
        let input = match &self.descriptor {
            SourceDescriptor::Camera(index) => {
                let url = format_camera_url(*index);
                info!("🔍 摄像头格式: {}, 输入: {}", CAMERA_FORMAT, url);
                Input::new(url).set_format(CAMERA_FORMAT)
            }
            SourceDescriptor::Stream(url) if self.descriptor.is_rtsp() => Input::new(url.as_str())
                .set_input_opts(
                    [
                        ("rtsp_transport", "tcp"),
                        ("buffer_size", "67108864"),
                        ("rtsp_flags", "prefer_tcp"),
                    ]
                    .into(),
                ),
            SourceDescriptor::Stream(url) => Input::new(url.as_str()),
            SourceDescriptor::File(path) => Input::new(path.as_str()),
        };
        match (&self.config.hwaccel, tuned) {
            (Some(accel), true) => input.set_hwaccel(accel.as_str()),
            _ => input,
        }
    }

    /// 构建并启动一次解码
    fn start(&self, tuned: bool) -> Result<DecodeLink, String> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let closed = Arc::new(AtomicBool::new(false));
        let handoff = if self.descriptor.is_live() {
            HandOff::Latest
        } else {
            HandOff::Every
        };

        let mut filter = DecodeFilter::new(tx, &rx, handoff, closed.clone());
        filter.decoder_name = match (&self.config.hwaccel, tuned) {
            (Some(accel), true) => format!("硬件解码 {}", accel),
            _ => "CPU软件解码".to_string(),
        };

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("decode", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let filter_desc = self.filter_desc(tuned);
        let ctx = FfmpegContext::builder()
            .input(self.build_input(tuned))
            .filter_descs([filter_desc.as_str()].into())
            .output(out)
            .build()
            .map_err(|e| format!("构建失败: {}", e))?;

        let sch = ctx.start().map_err(|e| format!("启动失败: {}", e))?;

        Ok(DecodeLink {
            rx,
            scheduler: Some(sch),
            closed,
        })
    }

    /// 启动解码, 加速配置失败时退回纯软件解码
    fn connect(&self) -> Result<DecodeLink, String> {
        if self.has_tuning() {
            match self.start(true) {
                Ok(link) => {
                    info!("✅ 视频源已连接 (加速配置)");
                    return Ok(link);
                }
                Err(e) => warn!("⚠️ 加速配置打开失败, 改用普通解码: {}", e),
            }
        }
        let link = self.start(false)?;
        info!("✅ 视频源已连接");
        Ok(link)
    }
}

impl SourceOpener for FfmpegOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, PipelineError> {
        info!("🎬 打开视频源: {}", self.descriptor);
        let link = self
            .connect()
            .map_err(|reason| PipelineError::SourceUnavailable {
                source_desc: self.descriptor.to_string(),
                reason,
            })?;

        let reconnect: Option<Reconnect> = if self.descriptor.is_live() {
            let opener = self.clone();
            Some(Box::new(move || opener.connect()))
        } else {
            None
        };

        Ok(Box::new(FfmpegSource {
            link: Some(link),
            reconnect,
            read_timeout: self.config.read_timeout,
            name: self.descriptor.to_string(),
            next_index: 0,
            reconnects: 0,
        }))
    }

    fn describe(&self) -> String {
        self.descriptor.to_string()
    }
}

#[cfg(target_os = "windows")]
const CAMERA_FORMAT: &str = "dshow";
#[cfg(target_os = "macos")]
const CAMERA_FORMAT: &str = "avfoundation";
#[cfg(target_os = "linux")]
const CAMERA_FORMAT: &str = "v4l2";
#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
const CAMERA_FORMAT: &str = "video4linux2";

/// 摄像头序号 → 平台输入地址
fn format_camera_url(index: usize) -> String {
    #[cfg(target_os = "windows")]
    {
        // DirectShow 需要设备名
        let name = get_camera_devices()
            .into_iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name)
            .unwrap_or_else(|| index.to_string());
        format!("video={}", name)
    }
    #[cfg(target_os = "linux")]
    {
        format!("/dev/video{}", index)
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        format!("{}", index)
    }
}

/// 获取可用的摄像头设备列表
pub fn get_camera_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            warn!("⚠️ 获取摄像头列表失败: {}", e);
            vec![]
        }
    }
}
