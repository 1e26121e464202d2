//! 会话管理
//!
//! 每个进程最多持有一个接收端和一个发送端。控制层（守护进程的 IPC
//! 处理器）只和 [`SessionManager`] 打交道。

use log::{debug, info};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::runtime::Handle;

use crate::config::{AppSettings, default_peer_id};
use crate::error::{Result, TransferError};
use crate::manifest::{self, Manifest};
use crate::network::{self, NetworkInterface};
use crate::transfer::{Receiver, ReceiverState, ReceiverStatus, Sender, SenderStatus};

pub struct SessionManager {
    runtime: Handle,
    settings: AppSettings,
    peer_id: String,
    receiver: Option<Receiver>,
    sender: Option<Sender>,
    /// 从 `send` 到 `finish_send` 期间接收端保持 `BUSY`
    sending: bool,
}

impl SessionManager {
    pub fn new(settings: AppSettings, runtime: Handle) -> Self {
        let peer_id = if settings.peer_id.trim().is_empty() {
            default_peer_id()
        } else {
            settings.peer_id.clone()
        };
        Self {
            runtime,
            settings,
            peer_id,
            receiver: None,
            sender: None,
            sending: false,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// 修改本机 ID，空字符串恢复为主机名
    ///
    /// 只影响之后打开的接收端和发起的发送。
    pub fn set_id(&mut self, id: &str) {
        let id = id.trim();
        self.peer_id = if id.is_empty() {
            default_peer_id()
        } else {
            id.to_string()
        };
        info!("Peer id set to '{}'", self.peer_id);
    }

    pub fn list_networks(&self) -> Vec<NetworkInterface> {
        network::list_networks(self.settings.include_ipv6)
    }

    /// 同步遍历文件系统，在异步上下文中请放到 `spawn_blocking`
    pub fn snapshot<P: AsRef<Path>>(paths: &[P]) -> Manifest {
        manifest::snapshot(paths)
    }

    /// 在 `address` 上打开接收端，先关闭已有的接收端
    pub async fn open_server_socket(&mut self, address: &str) -> Result<SocketAddr> {
        let addr = network::parse_peer_addr(address, self.settings.port)?;
        if let Some(previous) = self.receiver.take() {
            debug!("Closing previous receiver on {}", previous.local_addr());
            previous.shutdown().await;
        }

        let receiver = Receiver::open(
            addr,
            &self.peer_id,
            self.settings.transfer_options(),
            &self.runtime,
        )?;
        if self.sending {
            receiver.set_state_busy();
        }
        let local = receiver.local_addr();
        self.receiver = Some(receiver);
        Ok(local)
    }

    /// 关闭接收端，返回之前是否打开
    pub async fn close_server_socket(&mut self) -> bool {
        match self.receiver.take() {
            Some(receiver) => {
                receiver.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn is_server_socket_open(&self) -> bool {
        self.receiver.as_ref().is_some_and(Receiver::is_exposed)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.as_ref().map(Receiver::local_addr)
    }

    /// 向 `address` 发送 `manifest`
    ///
    /// 已有未结束的发送，或接收端正在协商/接收时拒绝；成功后接收端进入
    /// `BUSY`，直到 [`SessionManager::finish_send`]。
    pub fn send(&mut self, manifest: Manifest, address: &str) -> Result<()> {
        let addr = network::parse_peer_addr(address, self.settings.port)?;

        if let Some(sender) = &self.sender {
            let state = sender.get_state();
            if !state.is_terminal() {
                return Err(TransferError::invalid_state("send", state));
            }
        }
        if let Some(receiver) = &self.receiver {
            let state = receiver.get_state();
            if state.in_session() {
                return Err(TransferError::invalid_state("send", state));
            }
        }

        let sender = Sender::new(
            &self.peer_id,
            self.settings.transfer_options(),
            self.runtime.clone(),
        );
        sender.send(manifest, addr)?;
        // 未确认的 RECV_DONE / FAILED 保持不变，在 recv_state 确认后进入 BUSY
        if let Some(receiver) = &self.receiver {
            receiver.set_state_busy();
        }
        self.sender = Some(sender);
        self.sending = true;
        Ok(())
    }

    /// 发送端状态；终态只返回一次，随后释放发送端
    pub fn send_state(&mut self) -> Option<SenderStatus> {
        let status = self.sender.as_ref()?.status();
        if status.state.is_terminal() {
            debug!("Sender reached {}, releasing", status.state);
            self.sender = None;
        }
        Some(status)
    }

    /// 发送结束后让接收端恢复监听
    pub fn finish_send(&mut self) {
        if let Some(sender) = &self.sender
            && !sender.get_state().is_terminal()
        {
            sender.cancel();
        }
        self.sender = None;
        self.sending = false;
        if let Some(receiver) = &self.receiver
            && receiver.get_state() == ReceiverState::Busy
        {
            receiver.set_state_idle();
        }
    }

    /// 接收端状态；`RECV_DONE` / `FAILED` 只返回一次，随后回到 `LISTENING`
    /// （发送进行中时回到 `BUSY`）
    pub fn recv_state(&mut self) -> Option<ReceiverStatus> {
        let receiver = self.receiver.as_ref()?;
        let status = receiver.status();
        if matches!(
            status.state,
            ReceiverState::RecvDone | ReceiverState::Failed
        ) {
            if self.sending {
                receiver.acknowledge_busy();
            } else {
                receiver.set_state_idle();
            }
        }
        Some(status)
    }

    pub fn pending_manifest(&self) -> Option<Manifest> {
        self.receiver.as_ref()?.pending_manifest()
    }

    /// 接受待定传输，未指定目录时使用配置的下载目录
    pub fn accept_recv(&self, destination: Option<PathBuf>) -> Result<PathBuf> {
        let receiver = self.require_receiver("accept_recv")?;
        let destination = destination.unwrap_or_else(|| self.settings.download_dir.clone());
        receiver.accept_recv(destination.clone())?;
        Ok(destination)
    }

    pub fn reject_recv(&self) -> Result<()> {
        self.require_receiver("reject_recv")?.reject_recv()
    }

    /// 中止所有会话并释放套接字
    pub async fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.cancel();
        }
        self.sending = false;
        self.close_server_socket().await;
    }

    fn require_receiver(&self, op: &'static str) -> Result<&Receiver> {
        self.receiver
            .as_ref()
            .ok_or_else(|| TransferError::invalid_state(op, ReceiverState::Idle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let settings = AppSettings {
            peer_id: "test-peer".to_string(),
            ..Default::default()
        };
        SessionManager::new(settings, Handle::current())
    }

    #[tokio::test]
    async fn test_set_id_falls_back_to_hostname() {
        let mut manager = manager();
        assert_eq!(manager.peer_id(), "test-peer");
        manager.set_id("  laptop ");
        assert_eq!(manager.peer_id(), "laptop");
        manager.set_id("");
        assert_eq!(manager.peer_id(), default_peer_id());
    }

    #[tokio::test]
    async fn test_decisions_without_receiver() {
        let mut manager = manager();
        assert_eq!(
            manager.accept_recv(None).unwrap_err().kind(),
            "invalid_state"
        );
        assert!(manager.reject_recv().is_err());
        assert!(manager.recv_state().is_none());
        assert!(manager.send_state().is_none());
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let mut manager = manager();
        let addr = manager.open_server_socket("127.0.0.1:0").await.unwrap();
        assert!(manager.is_server_socket_open());
        assert_eq!(manager.local_addr(), Some(addr));

        // 重新打开同一端口
        let again = manager
            .open_server_socket(&addr.to_string())
            .await
            .unwrap();
        assert_eq!(again, addr);

        assert!(manager.close_server_socket().await);
        assert!(!manager.is_server_socket_open());
        assert!(!manager.close_server_socket().await);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_unacknowledged_receive_stays_busy_while_sending() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let doc = src.path().join("doc.txt");
        std::fs::write(&doc, b"hello").unwrap();

        let mut alice = manager();
        let mut bob = manager();
        let alice_addr = alice.open_server_socket("127.0.0.1:0").await.unwrap();
        let bob_addr = bob.open_server_socket("127.0.0.1:0").await.unwrap();

        bob.send(SessionManager::snapshot(&[&doc]), &alice_addr.to_string())
            .unwrap();
        assert!(wait_for(|| alice.pending_manifest().is_some()).await);
        alice.accept_recv(Some(dest.path().to_path_buf())).unwrap();
        let alice_receiver_done = || {
            alice
                .receiver
                .as_ref()
                .is_some_and(|r| r.get_state() == ReceiverState::RecvDone)
        };
        assert!(wait_for(alice_receiver_done).await);
        bob.finish_send();

        // 终态尚未被轮询时开始发送
        alice
            .send(SessionManager::snapshot(&[&doc]), &bob_addr.to_string())
            .unwrap();
        assert_eq!(
            alice.recv_state().map(|s| s.state),
            Some(ReceiverState::RecvDone)
        );
        assert_eq!(
            alice.recv_state().map(|s| s.state),
            Some(ReceiverState::Busy)
        );

        alice.finish_send();
        assert_eq!(
            alice.recv_state().map(|s| s.state),
            Some(ReceiverState::Listening)
        );

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_rejects_bad_address() {
        let mut manager = manager();
        let err = manager.open_server_socket("nowhere").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_address");
        assert!(!manager.is_server_socket_open());
    }
}
