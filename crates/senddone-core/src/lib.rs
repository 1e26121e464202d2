//! SendDone Core Library
//!
//! 局域网点对点文件/目录传输引擎
//!
//! # 模块
//!
//! - **manifest**: 文件系统快照，生成传输清单
//! - **network**: 本机网络接口枚举
//! - **transfer**: 线上协议、接收端与发送端状态机
//! - **session**: 单进程内的会话管理
//! - **ipc**: 守护进程与 CLI 的消息定义
//!
//! # 使用示例
//!
//! ## 接收
//!
//! ```ignore
//! use senddone_core::{Receiver, ReceiverState, TransferOptions};
//!
//! let receiver = Receiver::open(addr, "desk", TransferOptions::default(), &Handle::current())?;
//! // 轮询直到收到请求
//! if receiver.get_state() == ReceiverState::RecvWait {
//!     let manifest = receiver.pending_manifest();
//!     receiver.accept_recv("/home/me/Downloads")?;
//! }
//! ```
//!
//! ## 发送
//!
//! ```ignore
//! use senddone_core::{Sender, TransferOptions, snapshot};
//!
//! let manifest = snapshot(&["/home/me/photos"]);
//! let sender = Sender::new("laptop", TransferOptions::default(), Handle::current());
//! sender.send(manifest, "192.168.1.20:47823".parse()?)?;
//! while !sender.get_state().is_terminal() {
//!     println!("{:?} B/s", sender.get_speed());
//! }
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod manifest;
pub mod network;
pub mod progress;
pub mod session;
pub mod transfer;

pub use config::{AppSettings, DEFAULT_PORT};
pub use error::{Result, TransferError};
pub use ipc::{IpcRequest, IpcResponse};
pub use logging::LogLevel;
pub use manifest::{Manifest, ManifestNode, NodeKind, snapshot};
pub use network::{NetworkInterface, list_networks, parse_peer_addr};
pub use progress::Progress;
pub use session::SessionManager;

// Transfer re-exports
pub use transfer::{
    Receiver, ReceiverState, ReceiverStatus, Sender, SenderState, SenderStatus, TransferOptions,
};
