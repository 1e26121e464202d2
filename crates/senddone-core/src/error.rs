//! 传输引擎错误类型
//!
//! `PartialSkip` 只在快照阶段产生，记录日志后丢弃；其它错误通过状态机的
//! 失败状态或控制调用的返回值交给控制层。

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// 监听地址不可用（被占用、不属于本机等）
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 对端不可达或拒绝连接
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 握手或帧格式错误
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 当前状态下不允许的操作
    #[error("`{op}` is not allowed in state {state}")]
    InvalidState { op: &'static str, state: String },

    /// 传输过程中的文件系统读写失败
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 套接字读写失败（连接中断等）
    #[error("connection error: {0}")]
    Network(#[from] io::Error),

    /// 快照时跳过的条目（非致命）
    #[error("skipped {}: {source}", path.display())]
    PartialSkip {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transfer rejected by peer: {0}")]
    Rejected(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),
}

impl TransferError {
    pub(crate) fn invalid_state(op: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            op,
            state: state.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// 稳定的错误类别名，用于 IPC 响应
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Bind { .. } => "bind",
            TransferError::Connect { .. } => "connect",
            TransferError::Protocol(_) => "protocol",
            TransferError::InvalidState { .. } => "invalid_state",
            TransferError::Io { .. } => "io",
            TransferError::Network(_) => "network",
            TransferError::PartialSkip { .. } => "partial_skip",
            TransferError::Rejected(_) => "rejected",
            TransferError::Cancelled => "cancelled",
            TransferError::InvalidAddress(_) => "invalid_address",
            TransferError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = TransferError::invalid_state("accept_recv", "LISTENING");
        assert_eq!(err.kind(), "invalid_state");
        assert_eq!(
            err.to_string(),
            "`accept_recv` is not allowed in state LISTENING"
        );
    }

    #[test]
    fn test_io_error_converts_to_network() {
        let err: TransferError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err.kind(), "network");
    }
}
