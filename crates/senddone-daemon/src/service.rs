//! Core Service - 把 IPC 请求分派给会话管理器

use std::path::PathBuf;
use std::sync::Arc;

use senddone_core::{AppSettings, IpcRequest, IpcResponse, Manifest, SessionManager};
use tokio::runtime::Handle;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Service {
    manager: Arc<Mutex<SessionManager>>,
}

impl Service {
    pub fn new(settings: AppSettings, runtime: Handle) -> Self {
        Self {
            manager: Arc::new(Mutex::new(SessionManager::new(settings, runtime))),
        }
    }

    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Networks => IpcResponse::Networks {
                networks: self.manager.lock().await.list_networks(),
            },
            IpcRequest::Snapshot { paths } => match snapshot(paths).await {
                Ok(manifest) => IpcResponse::Manifest { manifest },
                Err(response) => response,
            },
            IpcRequest::OpenServerSocket { address } => {
                match self.manager.lock().await.open_server_socket(&address).await {
                    Ok(addr) => {
                        tracing::info!("Receiver open on {}", addr);
                        IpcResponse::ok(format!("正在监听 {addr}"))
                    }
                    Err(e) => e.into(),
                }
            }
            IpcRequest::CloseServerSocket => IpcResponse::Flag {
                value: self.manager.lock().await.close_server_socket().await,
            },
            IpcRequest::IsServerSocketOpen => IpcResponse::Flag {
                value: self.manager.lock().await.is_server_socket_open(),
            },
            IpcRequest::SetId { id } => {
                let mut manager = self.manager.lock().await;
                manager.set_id(&id);
                IpcResponse::ok(format!("本机 ID: {}", manager.peer_id()))
            }
            IpcRequest::Send { address, paths } => {
                // 遍历文件系统时不持有会话锁
                let manifest = match snapshot(paths).await {
                    Ok(manifest) => manifest,
                    Err(response) => return response,
                };
                if manifest.is_empty() {
                    return IpcResponse::error("partial_skip", "没有可发送的文件或目录");
                }
                let summary = format!(
                    "发送任务已启动: {} 个文件, {} 字节",
                    manifest.file_count(),
                    manifest.total_size()
                );
                match self.manager.lock().await.send(manifest, &address) {
                    Ok(()) => IpcResponse::ok(summary),
                    Err(e) => e.into(),
                }
            }
            IpcRequest::SendState => IpcResponse::SendState {
                status: self.manager.lock().await.send_state(),
            },
            IpcRequest::FinishSend => {
                self.manager.lock().await.finish_send();
                IpcResponse::ok("发送会话已结束")
            }
            IpcRequest::RecvState => IpcResponse::RecvState {
                status: self.manager.lock().await.recv_state(),
            },
            IpcRequest::AcceptRecv { destination } => {
                match self.manager.lock().await.accept_recv(destination) {
                    Ok(dir) => IpcResponse::ok(format!("已接受，保存到 {}", dir.display())),
                    Err(e) => e.into(),
                }
            }
            IpcRequest::RejectRecv => match self.manager.lock().await.reject_recv() {
                Ok(()) => IpcResponse::ok("已拒绝"),
                Err(e) => e.into(),
            },
        }
    }

    pub async fn shutdown(&self) {
        self.manager.lock().await.shutdown().await;
    }
}

async fn snapshot(paths: Vec<PathBuf>) -> Result<Manifest, IpcResponse> {
    tokio::task::spawn_blocking(move || SessionManager::snapshot(&paths))
        .await
        .map_err(|e| IpcResponse::error("internal", format!("snapshot task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Service {
        let settings = AppSettings {
            peer_id: "daemon-test".to_string(),
            ..Default::default()
        };
        Service::new(settings, Handle::current())
    }

    #[tokio::test]
    async fn test_decisions_without_receiver_are_errors() {
        let service = service();
        let response = service
            .handle(IpcRequest::AcceptRecv { destination: None })
            .await;
        assert!(matches!(response, IpcResponse::Error { ref kind, .. } if kind == "invalid_state"));

        let response = service.handle(IpcRequest::RejectRecv).await;
        assert!(matches!(response, IpcResponse::Error { .. }));
        assert_eq!(
            service.handle(IpcRequest::RecvState).await,
            IpcResponse::RecvState { status: None }
        );
    }

    #[tokio::test]
    async fn test_open_query_close() {
        let service = service();
        let response = service
            .handle(IpcRequest::OpenServerSocket {
                address: "127.0.0.1:0".to_string(),
            })
            .await;
        assert!(matches!(response, IpcResponse::Ok { .. }), "{response:?}");
        assert_eq!(
            service.handle(IpcRequest::IsServerSocketOpen).await,
            IpcResponse::Flag { value: true }
        );
        assert_eq!(
            service.handle(IpcRequest::CloseServerSocket).await,
            IpcResponse::Flag { value: true }
        );
        assert_eq!(
            service.handle(IpcRequest::IsServerSocketOpen).await,
            IpcResponse::Flag { value: false }
        );
    }

    #[tokio::test]
    async fn test_snapshot_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let response = service()
            .handle(IpcRequest::Snapshot {
                paths: vec![dir.path().join("a.txt"), dir.path().join("missing")],
            })
            .await;
        let IpcResponse::Manifest { manifest } = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.total_size(), 5);
    }

    #[tokio::test]
    async fn test_send_with_nothing_readable() {
        let dir = tempfile::tempdir().unwrap();
        let response = service()
            .handle(IpcRequest::Send {
                address: "127.0.0.1".to_string(),
                paths: vec![dir.path().join("missing")],
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { ref kind, .. } if kind == "partial_skip"));
    }

    #[tokio::test]
    async fn test_send_to_bad_address() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let response = service()
            .handle(IpcRequest::Send {
                address: "not-an-address".to_string(),
                paths: vec![dir.path().join("a.txt")],
            })
            .await;
        assert!(matches!(response, IpcResponse::Error { ref kind, .. } if kind == "invalid_address"));
    }
}
