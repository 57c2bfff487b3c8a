use std::sync::Arc;
use std::time::Duration;

use application::{ApplicationError, CloseReason, Connection, ConnectionState, Outbox};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::ClientCommand;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// 读任务交给写任务的控制帧缓冲（Pong 等）
const CONTROL_BUFFER: usize = 8;

/// 单条 WebSocket 连接的生命周期
///
/// 读任务解析入站帧并交给聊天服务；写任务是出站队列的唯一消费者。
/// 无论以何种原因结束，最后都会从中枢注销并向所在房间发送离开通知。
pub struct ConnectionLifecycle {
    state: AppState,
    connection: Connection,
    phase: ConnectionState,
    idle_timeout: Duration,
    close_grace: Duration,
}

impl ConnectionLifecycle {
    /// `connection` 必须已经在中枢注册
    pub fn new(state: AppState, connection: Connection) -> Self {
        let idle_timeout = state.hub_config.idle_timeout();
        let close_grace = state.hub_config.close_grace();
        Self {
            state,
            connection,
            phase: ConnectionState::Connecting,
            idle_timeout,
            close_grace,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        match self.phase.transition(next) {
            Ok(phase) => self.phase = phase,
            Err(err) => tracing::error!(
                connection_id = %self.connection.id(),
                error = %err,
                "illegal connection state transition"
            ),
        }
    }

    pub async fn run(mut self, socket: WebSocket) {
        let connection_id = self.connection.id();
        self.advance(ConnectionState::Open);
        tracing::info!(
            connection_id = %connection_id,
            user_id = %self.connection.user_id(),
            "WebSocket 连接已建立"
        );

        let (sink, mut stream) = socket.split();
        let (control_tx, control_rx) = mpsc::channel::<WsMessage>(CONTROL_BUFFER);
        let mut writer = tokio::spawn(write_loop(
            sink,
            self.connection.outbox().clone(),
            control_rx,
        ));

        let mut writer_finished = false;
        let reason = tokio::select! {
            reason = self.read_loop(&mut stream, &control_tx) => reason,
            result = &mut writer => {
                writer_finished = true;
                match result {
                    // 出站队列被关闭：溢出拆除、清理或停机
                    Ok(Ok(())) => CloseReason::Cancelled,
                    Ok(Err(err)) => {
                        tracing::warn!(connection_id = %connection_id, error = %err, "WebSocket 写入失败");
                        CloseReason::WriteFailed
                    }
                    Err(err) => {
                        tracing::warn!(connection_id = %connection_id, error = %err, "WebSocket 写任务异常退出");
                        CloseReason::WriteFailed
                    }
                }
            }
        };

        self.advance(ConnectionState::Closing);
        tracing::info!(connection_id = %connection_id, reason = %reason, "WebSocket 连接关闭中");

        // 停止接收新投递，让写任务在宽限期内排空已排队的帧
        self.connection.outbox().close();
        drop(control_tx);
        if !writer_finished {
            match tokio::time::timeout(self.close_grace, &mut writer).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::info!(connection_id = %connection_id, "关闭宽限期已过，放弃未发送的帧");
                    writer.abort();
                }
            }
        }

        self.advance(ConnectionState::Closed);
        self.state.chat_service.disconnect(connection_id);
    }

    async fn read_loop(
        &self,
        stream: &mut SplitStream<WebSocket>,
        control: &mpsc::Sender<WsMessage>,
    ) -> CloseReason {
        let shutdown = self.connection.shutdown_token();

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return CloseReason::Cancelled,
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => return CloseReason::IdleTimeout,
                Ok(None) => return CloseReason::PeerClosed,
                Ok(Some(Err(err))) => {
                    tracing::warn!(connection_id = %self.connection.id(), error = %err, "WebSocket 读取失败");
                    return CloseReason::ReadFailed;
                }
                Ok(Some(Ok(message))) => message,
            };

            self.state.hub().touch(self.connection.id());

            match message {
                WsMessage::Text(text) => self.handle_text(text.as_str()),
                WsMessage::Binary(_) => {
                    tracing::warn!(connection_id = %self.connection.id(), "收到二进制帧，忽略");
                    self.reject(
                        None,
                        &ApplicationError::Domain(domain::DomainError::malformed_frame(
                            "binary frames are not supported",
                        )),
                    );
                }
                WsMessage::Ping(data) => {
                    if control.try_send(WsMessage::Pong(data)).is_err() {
                        tracing::debug!(connection_id = %self.connection.id(), "控制帧缓冲已满，跳过 pong");
                    }
                }
                WsMessage::Pong(_) => {
                    tracing::debug!("收到pong消息");
                }
                WsMessage::Close(_) => {
                    tracing::info!(connection_id = %self.connection.id(), "WebSocket收到关闭消息");
                    return CloseReason::PeerClosed;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let command = match ClientCommand::parse(text) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(connection_id = %self.connection.id(), error = %err, "无法解析的入站帧");
                self.reject(None, &err.into());
                return;
            }
        };

        let room_id = command.room_id().clone();
        if let Err(err) = self.state.chat_service.handle_command(
            self.connection.id(),
            self.connection.user_id(),
            command,
        ) {
            tracing::debug!(
                connection_id = %self.connection.id(),
                room_id = %room_id,
                error = %err,
                "入站命令被拒绝"
            );
            self.reject(Some(room_id), &err);
        }
    }

    fn reject(&self, room_id: Option<domain::RoomId>, error: &ApplicationError) {
        self.state
            .chat_service
            .reply_rejection(self.connection.id(), room_id, error);
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        tracing::debug!(
            connection_id = %self.connection.id(),
            phase = ?self.phase,
            "ConnectionLifecycle 被销毁"
        );
    }
}

/// 写任务：优先发送控制帧，其次按顺序发送出站信封；队列关闭并排空后发送 Close 帧
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    outbox: Arc<Outbox>,
    mut control: mpsc::Receiver<WsMessage>,
) -> Result<(), axum::Error> {
    loop {
        tokio::select! {
            biased;
            Some(frame) = control.recv() => sink.send(frame).await?,
            next = outbox.recv() => match next {
                Some(envelope) => match envelope.to_json() {
                    Ok(text) => sink.send(WsMessage::Text(text.into())).await?,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to serialize websocket payload");
                    }
                },
                None => break,
            },
        }
    }

    sink.send(WsMessage::Close(None)).await?;
    sink.close().await
}
