//! 守护进程与 CLI 之间的 IPC 消息
//!
//! Unix Domain Socket 上每行一个 JSON 对象，请求与响应一一对应。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::manifest::Manifest;
use crate::network::NetworkInterface;
use crate::transfer::{ReceiverStatus, SenderStatus};

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("senddone.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpcRequest {
    /// 列出可监听的本机地址
    Networks,
    /// 为路径生成清单（不发送）
    Snapshot { paths: Vec<PathBuf> },
    OpenServerSocket { address: String },
    CloseServerSocket,
    IsServerSocketOpen,
    SetId { id: String },
    /// 快照 `paths` 并发送到 `address`
    Send {
        address: String,
        paths: Vec<PathBuf>,
    },
    SendState,
    FinishSend,
    RecvState,
    AcceptRecv {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PathBuf>,
    },
    RejectRecv,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpcResponse {
    Ok { message: String },
    /// `kind` 取自 `TransferError::kind`
    Error { kind: String, message: String },
    Networks { networks: Vec<NetworkInterface> },
    Manifest { manifest: Manifest },
    Flag { value: bool },
    SendState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<SenderStatus>,
    },
    RecvState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ReceiverStatus>,
    },
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: message.into(),
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl From<crate::error::TransferError> for IpcResponse {
    fn from(e: crate::error::TransferError) -> Self {
        IpcResponse::error(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::transfer::{SenderState, SenderStatus};

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&IpcRequest::OpenServerSocket {
            address: "192.168.1.2".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"openServerSocket","address":"192.168.1.2"}"#);

        let request: IpcRequest = serde_json::from_str(r#"{"type":"acceptRecv"}"#).unwrap();
        assert_eq!(request, IpcRequest::AcceptRecv { destination: None });

        let request: IpcRequest =
            serde_json::from_str(r#"{"type":"send","address":"10.0.0.2","paths":["/a","/b"]}"#)
                .unwrap();
        assert!(matches!(request, IpcRequest::Send { paths, .. } if paths.len() == 2));
    }

    #[test]
    fn test_unknown_request_fails_to_parse() {
        assert!(serde_json::from_str::<IpcRequest>(r#"{"type":"selfDestruct"}"#).is_err());
    }

    #[test]
    fn test_error_response_from_transfer_error() {
        let response: IpcResponse = TransferError::invalid_state("reject_recv", "IDLE").into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "invalid_state");
    }

    #[test]
    fn test_status_response_round_trip() {
        let response = IpcResponse::SendState {
            status: Some(SenderStatus {
                state: SenderState::Send,
                peer_id: Some("desk".into()),
                speed: Some(1024.0),
                bytes_transferred: 10,
                bytes_total: 20,
                error: None,
            }),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""state":"SEND""#));
        assert_eq!(serde_json::from_str::<IpcResponse>(&json).unwrap(), response);

        let empty = serde_json::to_string(&IpcResponse::RecvState { status: None }).unwrap();
        assert_eq!(empty, r#"{"type":"recvState"}"#);
    }
}
