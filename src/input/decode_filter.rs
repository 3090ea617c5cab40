/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame as AvFrame};
use tracing::{debug, info, warn};

use crate::types::Frame;

/// 最大允许分辨率
const MAX_DIMENSION: u32 = 8192;

/// 解码线程 → 读取方 的交付策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOff {
    /// 逐帧交付, 读取方跟不上时阻塞解码 (文件)
    Every,
    /// 只保留最新一帧, 旧帧未被读取即被替换 (实时源)
    Latest,
}

/// FFmpeg解码过滤器: 视频流 → RGB24帧
pub struct DecodeFilter {
    tx: Option<Sender<Frame>>,
    drain: Option<Receiver<Frame>>, // 仅 Latest 模式: 用于挤掉旧帧
    closed: Arc<AtomicBool>,        // 读取方已释放
    pub decoder_name: String,
    next_index: u64,
    count: usize,
    last: Instant,
    pub dropped_frames: usize, // 损坏/非法帧
    pub stale_frames: usize,   // 被新帧替换的旧帧
    pub total_frames: usize,
}

impl DecodeFilter {
    pub fn new(
        tx: Sender<Frame>,
        rx: &Receiver<Frame>,
        handoff: HandOff,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tx: Some(tx),
            drain: match handoff {
                HandOff::Every => None,
                HandOff::Latest => Some(rx.clone()),
            },
            closed,
            decoder_name: String::from("Unknown"),
            next_index: 0,
            count: 0,
            last: Instant::now(),
            dropped_frames: 0,
            stale_frames: 0,
            total_frames: 0,
        }
    }

    /// 交付一帧; 读取方已释放时返回 Err 以停止解码
    fn deliver(&mut self, frame: Frame) -> Result<(), String> {
        let Some(tx) = &self.tx else {
            return Err("decoder already finished".to_string());
        };
        match &self.drain {
            None => tx.send(frame).map_err(|_| "frame reader closed".to_string()),
            Some(drain) => {
                let mut frame = frame;
                loop {
                    match tx.try_send(frame) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(f)) => {
                            if drain.try_recv().is_ok() {
                                self.stale_frames += 1;
                            }
                            frame = f;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            return Err("frame reader closed".to_string())
                        }
                    }
                }
            }
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("✅ 解码线程启动 ({})", self.decoder_name);
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        if self.closed.load(Ordering::Acquire) {
            return Err("frame reader closed".to_string());
        }

        self.total_frames += 1;

        // 空帧或损坏帧
        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            self.dropped_frames += 1;
            if self.total_frames <= 10 {
                warn!("⚠️ 丢弃帧 #{}: 空帧/损坏帧", self.total_frames);
            }
            return Ok(None);
        }

        let rgb = unsafe {
            let av = &*frame.as_ptr();
            let w = av.width.max(0) as u32;
            let h = av.height.max(0) as u32;

            // 检查分辨率合法性
            if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
                self.dropped_frames += 1;
                if self.total_frames <= 10 {
                    warn!("⚠️ 丢弃帧 #{}: 非法分辨率 {}x{}", self.total_frames, w, h);
                }
                return Ok(None);
            }

            // 解码错误 (INVALID_BITSTREAM | MISSING_REFERENCE)
            if av.decode_error_flags & 0x03 != 0 {
                self.dropped_frames += 1;
                if self.total_frames <= 10 {
                    warn!(
                        "⚠️ 丢弃帧 #{}: 解码错误 flags={:#x}",
                        self.total_frames, av.decode_error_flags
                    );
                }
                return Ok(None);
            }

            let y_stride = av.linesize[0].max(0) as usize;
            let uv_stride = av.linesize[1].max(0) as usize;
            if av.data[0].is_null()
                || av.data[1].is_null()
                || av.data[2].is_null()
                || y_stride < w as usize
                || uv_stride < (w as usize).div_ceil(2)
            {
                self.dropped_frames += 1;
                if self.total_frames <= 10 {
                    warn!(
                        "⚠️ 丢弃帧 #{}: YUV平面异常 y_stride={} uv_stride={}",
                        self.total_frames, y_stride, uv_stride
                    );
                }
                return Ok(None);
            }

            let chroma_h = (h as usize).div_ceil(2);
            let y_plane = std::slice::from_raw_parts(av.data[0], y_stride * h as usize);
            let u_plane = std::slice::from_raw_parts(av.data[1], uv_stride * chroma_h);
            let v_plane = std::slice::from_raw_parts(av.data[2], uv_stride * chroma_h);
            let data = yuv420p_to_rgb(y_plane, u_plane, v_plane, y_stride, uv_stride, w, h);
            Frame::new(self.next_index, w, h, data)
        };

        self.next_index += 1;
        self.count += 1;

        // 每秒一次解码统计
        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
            debug!(
                "📺 解码统计: {:.1}fps | 总帧{} | 丢弃{} | 被替换{}",
                fps, self.total_frames, self.dropped_frames, self.stale_frames
            );
            self.last = Instant::now();
            self.count = 0;
        }

        self.deliver(rgb)?;
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        // 释放发送端, 读取方随即收到 EndOfStream
        self.tx.take();
        self.drain.take();
        info!(
            "✅ 解码线程退出: 共{}帧, 丢弃{}, 被替换{}",
            self.total_frames, self.dropped_frames, self.stale_frames
        );
    }
}

/// YUV420P → 紧凑 RGB24 (BT.601, 定点运算)
pub fn yuv420p_to_rgb(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    y_stride: usize,
    uv_stride: usize,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let (width, height) = (width as usize, height as usize);
    let mut buffer = vec![0u8; width * height * 3];
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = y_plane[y_row + x] as i32;
            let u_val = u_plane[uv_row + (x >> 1)] as i32 - 128;
            let v_val = v_plane[uv_row + (x >> 1)] as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }
    buffer
}
