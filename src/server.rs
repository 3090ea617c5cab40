//! WebSocket 姿态推送服务
//!
//! 每个连接:
//! - 阻塞线程: 打开视频源 → `Session::run` → 释放视频源
//! - 异步任务: 取结果 → JSON 文本帧发送 → 回复确认, 同时监听客户端关闭
//!
//! 会话线程在确认前阻塞, 同一连接任何时刻最多一个结果在途.
//!
//! Ctrl-C / SIGTERM 触发取消, 等待所有会话发送 Close 后退出.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::PipelineError;
use crate::input::SourceOpener;
use crate::models::SharedModel;
use crate::pipeline::{Delivery, DeliverySink, Session, SessionEnd, SessionState};

/// 姿态推送服务
pub struct PoseServer {
    config: ServerConfig,
    opener: Arc<dyn SourceOpener>,
    model: SharedModel,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// 单个会话需要的共享状态
#[derive(Clone)]
struct SessionContext {
    config: ServerConfig,
    opener: Arc<dyn SourceOpener>,
    model: SharedModel,
    cancel: CancellationToken,
}

impl PoseServer {
    pub fn new(config: ServerConfig, opener: Arc<dyn SourceOpener>, model: SharedModel) -> Self {
        Self {
            config,
            opener,
            model,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// 取消令牌: 触发后停止接受连接并关闭所有会话
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 启动检查: 打开一次视频源后立即释放
    pub fn check_source(&self) -> Result<(), PipelineError> {
        info!("🔍 检查视频源: {}", self.opener.describe());
        let source = self.opener.open()?;
        drop(source);
        info!("✅ 视频源可用");
        Ok(())
    }

    /// 绑定监听地址并运行到取消
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))?;
        self.serve(listener).await
    }

    /// 在已绑定的监听器上运行到取消
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("🚀 WebSocket 服务已启动: ws://{}", addr);
        info!("📹 视频源: {}", self.opener.describe());
        info!("👥 最大并发客户端: {}", self.config.max_clients);

        let ctx = SessionContext {
            config: self.config.clone(),
            opener: self.opener.clone(),
            model: self.model.clone(),
            cancel: self.cancel.clone(),
        };
        let limit = Arc::new(Semaphore::new(self.config.max_clients.max(1)));
        let mut next_id: u64 = 0;

        loop {
            debug!("状态: {:?}", SessionState::AwaitingConnection);

            // 名额已满时不 accept, 新连接留在 backlog 中等待
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = limit.clone().acquire_owned() => permit?,
            };

            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("⚠️ accept 失败: {}", e);
                        continue;
                    }
                },
            };

            next_id += 1;
            let ctx = ctx.clone();
            let id = next_id;
            self.tracker.spawn(async move {
                handle_connection(ctx, id, stream, peer).await;
                drop(permit);
            });
        }

        info!("🛑 停止接受连接, 等待 {} 个会话结束", self.tracker.len());
        self.tracker.close();
        self.tracker.wait().await;
        info!("👋 服务已退出");
        Ok(())
    }
}

/// 处理一个客户端连接直到会话结束
async fn handle_connection(ctx: SessionContext, id: u64, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("⚠️ 客户端 {} WebSocket 握手失败: {}", peer, e);
            return;
        }
    };
    info!("🔗 会话#{} 客户端已连接: {}", id, peer);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Delivery>(1);
    let session_cancel = ctx.cancel.child_token();

    // 阻塞线程: 视频源的生命周期 = 会话
    let worker = {
        let opener = ctx.opener.clone();
        let model = ctx.model.clone();
        let retry_delay = ctx.config.retry_delay;
        let cancel = session_cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut source = match opener.open() {
                Ok(source) => source,
                Err(e) => {
                    error!("❌ 会话#{} {}", id, e);
                    return SessionEnd::SourceUnavailable;
                }
            };
            debug!("会话#{} 状态: {:?}", id, SessionState::Streaming);
            let mut sink = DeliverySink::new(tx);
            let mut session = Session::new(id, model, retry_delay, cancel);
            let end = session.run(source.as_mut(), &mut sink);
            drop(source);
            end
        })
    };

    let mut client_gone = false;
    loop {
        tokio::select! {
            delivery = rx.recv() => match delivery {
                Some((result, ack)) => {
                    let text = match result.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("⚠️ 会话#{} 结果序列化失败: {}", id, e);
                            let _ = ack.send(true);
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        debug!("会话#{} 发送失败: {}", id, e);
                        let _ = ack.send(false);
                        client_gone = true;
                        break;
                    }
                    let _ = ack.send(true);
                }
                // 会话线程已结束, 剩余结果已发完
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    client_gone = true;
                    break;
                }
                Some(Err(e)) => {
                    debug!("会话#{} 读取失败: {}", id, e);
                    client_gone = true;
                    break;
                }
                // 客户端消息忽略, Ping 由协议层应答
                Some(Ok(_)) => {}
            },
            _ = session_cancel.cancelled() => break,
        }
    }

    // 释放接收端让会话线程的发送失败, 同时打断重试等待
    drop(rx);
    session_cancel.cancel();
    let end = match worker.await {
        Ok(end) => end,
        Err(e) => {
            error!("❌ 会话#{} 线程异常: {}", id, e);
            SessionEnd::SourceUnavailable
        }
    };
    let end = if client_gone {
        SessionEnd::Disconnected
    } else {
        end
    };

    if !client_gone {
        let (code, reason) = match end {
            SessionEnd::EndOfStream => (CloseCode::Normal, "end of stream"),
            SessionEnd::Cancelled | SessionEnd::Disconnected => {
                (CloseCode::Away, "server shutdown")
            }
            SessionEnd::SourceUnavailable => (CloseCode::Error, "video source unavailable"),
        };
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
            debug!("会话#{} 发送 Close 失败: {}", id, e);
        }
        let _ = ws_tx.close().await;
    }

    info!("🔌 会话#{} 结束: {:?} → {:?}", id, end, end.state());

    if end == SessionEnd::EndOfStream && ctx.config.exit_on_eos {
        info!("📼 视频源已结束, 服务退出");
        ctx.cancel.cancel();
    }
}

/// 等待 Ctrl-C 或 SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ 无法监听 Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("❌ 无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl-C"),
        _ = terminate => info!("收到 SIGTERM"),
    }
}
