//! IPC Server - Unix Domain Socket 通信

use anyhow::Result;
use senddone_core::ipc::socket_path;
use senddone_core::{IpcRequest, IpcResponse};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::service::Service;

pub async fn run_ipc_server(service: Service) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC server listening on {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, service).await {
                        tracing::debug!("IPC client error: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept IPC connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, service: Service) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(line.trim()) {
            Ok(request) => {
                tracing::debug!("IPC request: {:?}", request);
                service.handle(request).await
            }
            Err(e) => IpcResponse::error("protocol", format!("Invalid request: {e}")),
        };

        write_response(&mut writer, &response).await?;
        line.clear();
    }

    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &IpcResponse) -> Result<()> {
    writer
        .write_all(serde_json::to_string(response)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}
