//! 发送端
//!
//! 每个 `Sender` 只发起一次传输：
//!
//! ```text
//! IDLE → SEND_REQUEST → SEND → SEND_DONE
//!             ↘ REJECTED   ↘
//!             ↘ FAILED  ←───┘
//! ```

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::protocol::{Message, SendRequest, expect_message, write_message};
use super::{TransferOptions, lock};
use crate::error::{Result, TransferError};
use crate::manifest::{Manifest, ManifestFile};
use crate::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderState {
    Idle,
    /// 已连接，等待接收端决定
    SendRequest,
    Send,
    SendDone,
    Rejected,
    Failed,
}

impl SenderState {
    pub fn name(&self) -> &'static str {
        match self {
            SenderState::Idle => "IDLE",
            SenderState::SendRequest => "SEND_REQUEST",
            SenderState::Send => "SEND",
            SenderState::SendDone => "SEND_DONE",
            SenderState::Rejected => "REJECTED",
            SenderState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SenderState::SendDone | SenderState::Rejected | SenderState::Failed
        )
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 发送端状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderStatus {
    pub state: SenderState,
    /// 接收端 ID，收到应答后才有
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub speed: Option<f64>,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

struct Shared {
    state: SenderState,
    peer_id: Option<String>,
    progress: Option<Progress>,
    error: Option<String>,
}

impl Shared {
    /// 进入终态；已经是终态时保持不变
    fn finish(&mut self, state: SenderState, error: Option<String>) {
        if !self.state.is_terminal() {
            self.state = state;
            self.error = error;
        }
    }
}

/// 发送端
pub struct Sender {
    id: String,
    options: TransferOptions,
    runtime: Handle,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
}

impl Sender {
    pub fn new(id: &str, options: TransferOptions, runtime: Handle) -> Self {
        Self {
            id: id.to_string(),
            options,
            runtime,
            shared: Arc::new(Mutex::new(Shared {
                state: SenderState::Idle,
                peer_id: None,
                progress: None,
                error: None,
            })),
            cancel: CancellationToken::new(),
        }
    }

    /// 向 `addr` 发起传输，立即返回
    ///
    /// 只能在 `IDLE` 调用一次；之后通过 [`Sender::get_state`] 观察进度。
    pub fn send(&self, manifest: Manifest, addr: SocketAddr) -> Result<()> {
        {
            let mut shared = lock(&self.shared);
            if shared.state != SenderState::Idle {
                return Err(TransferError::invalid_state("send", shared.state));
            }
            shared.state = SenderState::SendRequest;
        }

        info!(
            "Sending {} files ({} bytes) to {}",
            manifest.file_count(),
            manifest.total_size(),
            addr
        );
        let task = Task {
            request: SendRequest::new(&self.id, manifest),
            addr,
            options: self.options.clone(),
            shared: self.shared.clone(),
        };
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            let shared = task.shared.clone();
            let result = tokio::select! {
                () = cancel.cancelled() => Err(TransferError::Cancelled),
                result = task.run() => result,
            };

            let mut shared = lock(&shared);
            match result {
                Ok(()) => shared.finish(SenderState::SendDone, None),
                Err(TransferError::Rejected(reason)) => {
                    info!("Transfer rejected by receiver: {}", reason);
                    let message = TransferError::Rejected(reason).to_string();
                    shared.finish(SenderState::Rejected, Some(message));
                }
                Err(e) => {
                    warn!("Transfer to {} failed: {}", addr, e);
                    shared.finish(SenderState::Failed, Some(e.to_string()));
                }
            }
        });
        Ok(())
    }

    /// 中止传输，进入 `FAILED`
    pub fn cancel(&self) {
        lock(&self.shared).finish(SenderState::Failed, Some(TransferError::Cancelled.to_string()));
        self.cancel.cancel();
    }

    pub fn get_state(&self) -> SenderState {
        lock(&self.shared).state
    }

    /// 当前速度（字节/秒），只在 `SEND` 时有值
    pub fn get_speed(&self) -> Option<f64> {
        let mut shared = lock(&self.shared);
        if shared.state != SenderState::Send {
            return None;
        }
        shared.progress.as_mut().map(Progress::sample_speed)
    }

    pub fn status(&self) -> SenderStatus {
        let mut shared = lock(&self.shared);
        let state = shared.state;
        let speed = if state == SenderState::Send {
            shared.progress.as_mut().map(Progress::sample_speed)
        } else {
            None
        };
        let (bytes_transferred, bytes_total) = shared
            .progress
            .as_ref()
            .map_or((0, 0), |p| (p.bytes_transferred, p.bytes_total));

        SenderStatus {
            state,
            peer_id: shared.peer_id.clone(),
            speed,
            bytes_transferred,
            bytes_total,
            error: shared.error.clone(),
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Task {
    request: SendRequest,
    addr: SocketAddr,
    options: TransferOptions,
    shared: Arc<Mutex<Shared>>,
}

impl Task {
    async fn run(self) -> Result<()> {
        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| TransferError::Timeout("connecting"))?
            .map_err(|source| TransferError::Connect {
                addr: self.addr,
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::with_capacity(self.options.chunk_size.max(1), writer);

        write_message(&mut writer, &Message::SendRequest(self.request.clone())).await?;
        debug!("Request {} sent, waiting for decision", self.request.transfer_id);

        match expect_message(&mut reader, "accept").await? {
            Message::Accept { peer_id } => {
                info!("Transfer {} accepted by '{}'", self.request.transfer_id, peer_id);
                let mut shared = lock(&self.shared);
                if shared.state == SenderState::SendRequest {
                    shared.state = SenderState::Send;
                    shared.peer_id = Some(peer_id);
                    shared.progress = Some(Progress::new(self.request.manifest.total_size()));
                }
            }
            Message::Reject { peer_id, reason } => {
                lock(&self.shared).peer_id = Some(peer_id);
                return Err(TransferError::Rejected(reason.to_string()));
            }
            other => return Err(other.unexpected("accept")),
        }

        for file in self.request.manifest.files() {
            self.send_file(&mut writer, &file).await?;
        }

        write_message(&mut writer, &Message::Done).await?;
        match expect_message(&mut reader, "complete").await? {
            Message::Complete => {
                info!("Transfer {} complete", self.request.transfer_id);
                Ok(())
            }
            other => Err(other.unexpected("complete")),
        }
    }

    async fn send_file<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        file: &ManifestFile<'_>,
    ) -> Result<()> {
        let mut source = File::open(file.source)
            .await
            .map_err(|e| TransferError::io(file.source, e))?;

        debug!("Sending {} ({} bytes)", file.relative, file.size);
        write_message(
            writer,
            &Message::File {
                path: file.relative.clone(),
                size: file.size,
            },
        )
        .await?;

        let mut buffer = vec![0u8; self.options.chunk_size.max(1)];
        let mut remaining = file.size;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));
            let read = source
                .read(&mut buffer[..want])
                .await
                .map_err(|e| TransferError::io(file.source, e))?;
            if read == 0 {
                // 快照之后文件被截断，接收端无法再对齐帧边界
                return Err(TransferError::io(
                    file.source,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("file shrank with {remaining} bytes outstanding"),
                    ),
                ));
            }
            writer.write_all(&buffer[..read]).await?;
            remaining -= read as u64;

            if let Some(progress) = lock(&self.shared).progress.as_mut() {
                progress.add(read as u64);
            }
        }
        writer.flush().await?;
        Ok(())
    }
}
