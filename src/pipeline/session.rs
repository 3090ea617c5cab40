/// 会话主循环 (Session)
/// 职责: 读帧 → 推理 → 发送, 直到断开/源结束/服务关闭
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ResultSink, SessionEnd};
use crate::error::{PipelineError, ReadError};
use crate::input::FrameSource;
use crate::models::SharedModel;

/// 会话统计
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub published: u64,  // 已发送结果
    pub detections: u64, // 其中检测到人的
    pub dropped: u64,    // 推理/发送失败丢弃的帧
    pub retries: u64,    // 暂时读失败次数
    pub infer_ms: f64,   // 最近一帧推理耗时
    started: Instant,
    count: u64,
    last: Instant,
    current_fps: f64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            published: 0,
            detections: 0,
            dropped: 0,
            retries: 0,
            infer_ms: 0.0,
            started: Instant::now(),
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }
}

impl SessionStats {
    /// 每秒一次
    fn tick(&mut self, id: u64) {
        self.count += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.current_fps = self.count as f64 / elapsed;
            debug!(
                "📊 会话#{} | {:.1}fps | 推理{:.1}ms | 发送{} | 检测{} | 丢弃{} | 重试{}",
                id,
                self.current_fps,
                self.infer_ms,
                self.published,
                self.detections,
                self.dropped,
                self.retries
            );
            self.count = 0;
            self.last = Instant::now();
        }
    }

    pub fn average_fps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.published as f64 / secs
        } else {
            0.0
        }
    }
}

/// 单连接会话
pub struct Session {
    id: u64,
    model: SharedModel,
    retry_delay: Duration,
    cancel: CancellationToken,
    pub stats: SessionStats,
}

impl Session {
    pub fn new(
        id: u64,
        model: SharedModel,
        retry_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            model,
            retry_delay,
            cancel,
            stats: SessionStats::default(),
        }
    }

    /// 运行到会话结束; 视频源由调用方在返回后释放
    pub fn run(&mut self, source: &mut dyn FrameSource, sink: &mut dyn ResultSink) -> SessionEnd {
        info!("▶️ 会话#{} 开始推流", self.id);
        let end = self.stream(source, sink);
        info!(
            "⏹️ 会话#{} 结束: {:?} | 发送{} | 检测{} | 丢弃{} | 重试{} | 平均{:.1}fps",
            self.id,
            end,
            self.stats.published,
            self.stats.detections,
            self.stats.dropped,
            self.stats.retries,
            self.stats.average_fps()
        );
        end
    }

    fn stream(&mut self, source: &mut dyn FrameSource, sink: &mut dyn ResultSink) -> SessionEnd {
        loop {
            if self.cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }

            // 1. 读帧
            let frame = match source.read() {
                Ok(frame) => frame,
                Err(ReadError::EndOfStream) => return SessionEnd::EndOfStream,
                Err(ReadError::Transient(reason)) => {
                    self.stats.retries += 1;
                    debug!("⏳ 会话#{} 暂时读不到帧: {}", self.id, reason);
                    std::thread::sleep(self.retry_delay);
                    continue;
                }
            };

            // 2. 推理 (锁只在推理期间持有)
            let t = Instant::now();
            let result = self.model.lock().infer(&frame);
            self.stats.infer_ms = t.elapsed().as_secs_f64() * 1000.0;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    let err = PipelineError::Inference {
                        frame_index: frame.index,
                        reason: format!("{:#}", e),
                    };
                    warn!(
                        "⚠️ 会话#{} {} (采集于 {})",
                        self.id,
                        err,
                        frame.captured_at.to_rfc3339()
                    );
                    self.stats.dropped += 1;
                    continue;
                }
            };

            // 3. 发送
            let found = result.found;
            match sink.publish(result) {
                Ok(()) => {
                    self.stats.published += 1;
                    if found {
                        self.stats.detections += 1;
                    }
                }
                Err(PipelineError::ConnectionClosed) => return SessionEnd::Disconnected,
                Err(e) => {
                    warn!(
                        "⚠️ 会话#{} 发送帧{}失败 (采集于 {}): {}",
                        self.id,
                        frame.index,
                        frame.captured_at.to_rfc3339(),
                        e
                    );
                    self.stats.dropped += 1;
                    continue;
                }
            }

            self.stats.tick(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::models::{shared, PoseModel};
    use crate::types::{Frame, Landmark, PoseResult};

    /// 按脚本返回读取结果, 脚本耗尽即源结束
    struct ScriptedSource(VecDeque<Result<Frame, ReadError>>);

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame, ReadError> {
            self.0.pop_front().unwrap_or(Err(ReadError::EndOfStream))
        }
    }

    fn frames(n: u64) -> ScriptedSource {
        ScriptedSource((0..n).map(|i| Ok(Frame::filled(i, 4, 4, 0))).collect())
    }

    /// 没有人; 指定帧号推理失败
    struct EmptyScene {
        fail_on: Option<u64>,
    }

    impl PoseModel for EmptyScene {
        fn infer(&mut self, frame: &Frame) -> anyhow::Result<PoseResult> {
            if Some(frame.index) == self.fail_on {
                anyhow::bail!("corrupted tensor");
            }
            Ok(PoseResult::not_found())
        }
        fn num_keypoints(&self) -> usize {
            17
        }
        fn summary(&self) {}
    }

    /// 每帧一个人, 关键点 x 编码帧号
    struct OnePerson;

    impl PoseModel for OnePerson {
        fn infer(&mut self, frame: &Frame) -> anyhow::Result<PoseResult> {
            let x = (frame.index + 1) as f32 / 100.0;
            Ok(PoseResult::with_landmarks(vec![Landmark::new(x, 0.5, 0.0, 1.0); 17]))
        }
        fn num_keypoints(&self) -> usize {
            17
        }
        fn summary(&self) {}
    }

    /// 发送 n 条之后断开
    struct ClosingSink {
        remaining: usize,
        sent: Vec<PoseResult>,
    }

    impl ResultSink for ClosingSink {
        fn publish(&mut self, result: PoseResult) -> Result<(), PipelineError> {
            if self.remaining == 0 {
                return Err(PipelineError::ConnectionClosed);
            }
            self.remaining -= 1;
            self.sent.push(result);
            Ok(())
        }
    }

    fn session(model: Box<dyn PoseModel>) -> Session {
        Session::new(1, shared(model), Duration::from_millis(1), CancellationToken::new())
    }

    #[test]
    fn test_no_body_frames_publish_not_found() {
        let mut s = session(Box::new(EmptyScene { fail_on: None }));
        let mut sink: Vec<PoseResult> = vec![];
        let end = s.run(&mut frames(5), &mut sink);

        assert_eq!(end, SessionEnd::EndOfStream);
        assert_eq!(sink.len(), 5);
        for r in &sink {
            assert_eq!(r.to_json().unwrap(), r#"{"found":false}"#);
        }
        assert_eq!(s.stats.detections, 0);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let mut source = ScriptedSource(VecDeque::from(vec![
            Err(ReadError::Transient("timeout".into())),
            Ok(Frame::filled(0, 4, 4, 0)),
        ]));
        let mut s = session(Box::new(EmptyScene { fail_on: None }));
        let mut sink: Vec<PoseResult> = vec![];

        assert_eq!(s.run(&mut source, &mut sink), SessionEnd::EndOfStream);
        assert_eq!(sink.len(), 1);
        assert_eq!(s.stats.retries, 1);
    }

    #[test]
    fn test_inference_error_drops_only_that_frame() {
        let mut s = session(Box::new(EmptyScene { fail_on: Some(1) }));
        let mut sink: Vec<PoseResult> = vec![];
        s.run(&mut frames(4), &mut sink);

        assert_eq!(sink.len(), 3);
        assert_eq!(s.stats.dropped, 1);
        assert_eq!(s.stats.published, 3);
    }

    #[test]
    fn test_disconnect_ends_session() {
        let mut s = session(Box::new(OnePerson));
        let mut sink = ClosingSink {
            remaining: 2,
            sent: vec![],
        };
        assert_eq!(s.run(&mut frames(10), &mut sink), SessionEnd::Disconnected);
        assert_eq!(sink.sent.len(), 2);

        // 顺序与帧号一致
        let xs: Vec<f32> = sink
            .sent
            .iter()
            .map(|r| r.landmarks.as_ref().unwrap()[0].x)
            .collect();
        assert_eq!(xs, vec![0.01, 0.02]);
        assert_eq!(s.stats.detections, 2);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut s = Session::new(
            2,
            shared(Box::new(OnePerson)),
            Duration::from_millis(1),
            cancel,
        );
        let mut sink: Vec<PoseResult> = vec![];
        assert_eq!(s.run(&mut frames(3), &mut sink), SessionEnd::Cancelled);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_end_state() {
        use crate::pipeline::SessionState;
        assert_eq!(SessionEnd::Disconnected.state(), SessionState::Disconnected);
        assert_eq!(SessionEnd::EndOfStream.state(), SessionState::Fatal);
        assert_eq!(SessionEnd::SourceUnavailable.state(), SessionState::Fatal);
    }
}
