//! 文件传输模块
//!
//! 包含:
//! - 线上协议 (长度前缀 JSON 帧 + 原始文件字节)
//! - 接收端 (监听套接字 + 接收状态机)
//! - 发送端 (主动连接 + 发送状态机)

pub mod protocol;
pub mod receiver;
pub mod sender;

pub use protocol::{Message, RejectReason, SendRequest};
pub use receiver::{Receiver, ReceiverState, ReceiverStatus};
pub use sender::{Sender, SenderState, SenderStatus};

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// 发送端建立 TCP 连接的超时
    pub connect_timeout: Duration,
    /// 接收端等待 `sendRequest` 的超时
    pub handshake_timeout: Duration,
    /// 单次读写的缓冲区大小
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            chunk_size: 64 * 1024,
        }
    }
}

/// 状态锁被毒化时仍然取回数据，状态本身总是完整赋值的
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
