//! SendDone Daemon
//!
//! 后台守护进程，负责：
//! - 持有接收端/发送端会话
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use senddone_core::AppSettings;
use tracing_subscriber::EnvFilter;

use crate::service::Service;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AppSettings::load();

    // 桥接 log crate（senddone-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.directive())),
        )
        .try_init();

    tracing::info!("SendDone Daemon starting as '{}'...", settings.peer_id);
    tracing::debug!("Settings: {:?}", settings);

    let service = Service::new(settings, tokio::runtime::Handle::current());
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(service.clone()));

    // 等待 IPC 服务器退出或收到 Ctrl-C
    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
        }
    }

    service.shutdown().await;
    let _ = std::fs::remove_file(senddone_core::ipc::socket_path());
    Ok(())
}
