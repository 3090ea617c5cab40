/// 推流会话流水线 (Session Pipeline)
///
/// 每个客户端连接一个会话, 在独立线程里顺序执行:
/// - read:    从视频源取一帧 (暂时失败则等待重试)
/// - infer:   共享模型推理 (按锁串行)
/// - publish: 结果交给连接的发送端
///
/// 状态: AwaitingConnection → Streaming → (Disconnected | Fatal)
pub mod session;

pub use session::{Session, SessionStats};

use tokio::sync::{mpsc, oneshot};

use crate::error::PipelineError;
use crate::types::PoseResult;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConnection,
    Streaming,
    /// 客户端断开, 服务继续接受连接
    Disconnected,
    /// 源结束或不可用, 会话关闭
    Fatal,
}

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 客户端断开
    Disconnected,
    /// 视频源读完
    EndOfStream,
    /// 视频源打开失败
    SourceUnavailable,
    /// 服务关闭
    Cancelled,
}

impl SessionEnd {
    pub fn state(&self) -> SessionState {
        match self {
            SessionEnd::Disconnected | SessionEnd::Cancelled => SessionState::Disconnected,
            SessionEnd::EndOfStream | SessionEnd::SourceUnavailable => SessionState::Fatal,
        }
    }
}

/// 结果发送端
///
/// 唯一需要会话处理的错误是 `PipelineError::ConnectionClosed`.
pub trait ResultSink {
    fn publish(&mut self, result: PoseResult) -> Result<(), PipelineError>;
}

/// 内存收集 (基准测试/离线运行)
impl ResultSink for Vec<PoseResult> {
    fn publish(&mut self, result: PoseResult) -> Result<(), PipelineError> {
        self.push(result);
        Ok(())
    }
}

/// 待发送结果 + 发送完成确认 (true: 已写入连接)
pub type Delivery = (PoseResult, oneshot::Sender<bool>);

/// 会合式发送端: 阻塞到结果真正写入连接才返回
///
/// 任何时刻最多一个结果在途, 发送期间会话不读帧也不推理.
/// 必须在阻塞线程中调用.
pub struct DeliverySink {
    tx: mpsc::Sender<Delivery>,
}

impl DeliverySink {
    pub fn new(tx: mpsc::Sender<Delivery>) -> Self {
        Self { tx }
    }
}

impl ResultSink for DeliverySink {
    fn publish(&mut self, result: PoseResult) -> Result<(), PipelineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .blocking_send((result, ack_tx))
            .map_err(|_| PipelineError::ConnectionClosed)?;
        match ack_rx.blocking_recv() {
            Ok(true) => Ok(()),
            // 发送失败或连接端已释放
            Ok(false) | Err(_) => Err(PipelineError::ConnectionClosed),
        }
    }
}
