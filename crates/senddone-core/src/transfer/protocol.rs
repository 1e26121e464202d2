//! SendDone 传输协议
//!
//! 每条控制消息是一帧：`u32` 大端长度 + 该长度的 UTF-8 JSON。
//! `file` 帧之后紧跟恰好 `size` 字节的原始文件内容，接收端据此确定文件
//! 边界，不依赖连接关闭。
//!
//! ```text
//! Sender                         Receiver
//!   | sendRequest{peerId,manifest} |
//!   |----------------------------->|  RECV_WAIT
//!   |        accept / reject       |
//!   |<-----------------------------|
//!   | file{path,size} + bytes ...  |  RECV
//!   |----------------------------->|
//!   | done                         |
//!   |----------------------------->|
//!   |          complete            |  RECV_DONE
//!   |<-----------------------------|
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransferError};
use crate::manifest::Manifest;

pub const PROTOCOL_VERSION: u32 = 1;

/// 单帧 JSON 的上限，足以容纳数十万个条目的清单
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// 发送请求载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub version: u32,
    /// 本次传输的 ID，只用于日志关联
    pub transfer_id: String,
    pub peer_id: String,
    pub manifest: Manifest,
}

impl SendRequest {
    pub fn new(peer_id: &str, manifest: Manifest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            transfer_id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            manifest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    /// 控制层拒绝
    Declined,
    /// 接收端正忙（正在协商另一个传输或本机正在发送）
    Busy,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Declined => write!(f, "declined"),
            RejectReason::Busy => write!(f, "busy"),
        }
    }
}

/// 线上消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    SendRequest(SendRequest),
    #[serde(rename_all = "camelCase")]
    Accept {
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Reject {
        peer_id: String,
        reason: RejectReason,
    },
    /// 文件头，后接 `size` 字节内容
    File {
        path: String,
        size: u64,
    },
    Done,
    Complete,
}

impl Message {
    /// 消息名，用于日志和错误信息
    pub fn name(&self) -> &'static str {
        match self {
            Message::SendRequest(_) => "sendRequest",
            Message::Accept { .. } => "accept",
            Message::Reject { .. } => "reject",
            Message::File { .. } => "file",
            Message::Done => "done",
            Message::Complete => "complete",
        }
    }

    /// 期望收到 `expected` 却收到其它消息时的错误
    pub fn unexpected(&self, expected: &str) -> TransferError {
        TransferError::Protocol(format!("expected {expected}, got {}", self.name()))
    }
}

/// 写出一帧
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = serde_json::to_vec(message)
        .map_err(|e| TransferError::Protocol(format!("failed to encode {}: {e}", message.name())))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            TransferError::Protocol(format!("{} frame of {} bytes is too large", message.name(), body.len()))
        })?;

    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧
///
/// 帧开始前连接关闭时返回 `Ok(None)`；帧中途断开是网络错误。
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[first..]).await?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TransferError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| TransferError::Protocol(format!("malformed frame: {e}")))
}

/// 读取一帧，连接关闭视为协议错误
pub async fn expect_message<R: AsyncRead + Unpin>(reader: &mut R, expected: &str) -> Result<Message> {
    read_message(reader).await?.ok_or_else(|| {
        TransferError::Protocol(format!("connection closed while waiting for {expected}"))
    })
}
