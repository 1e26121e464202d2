//! IPC Client - 与守护进程通信

use anyhow::Result;
use senddone_core::ipc::socket_path;
use senddone_core::{IpcRequest, IpcResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// 发送一个请求并读取响应，`ok` / `error` 响应会直接打印
pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let response = request_quiet(request).await?;

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { kind, message } => eprintln!("❌ [{}] {}", kind, message),
        _ => {}
    }

    Ok(response)
}

/// 轮询用，不打印 `ok` 响应
pub async fn request_quiet(request: IpcRequest) -> Result<IpcResponse> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程: {}", e);
            eprintln!("   请确保 senddone-daemon 正在运行");
            eprintln!("   运行: cargo xtask dev");
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送请求
    let json = serde_json::to_string(&request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    // 读取响应
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        anyhow::bail!("daemon closed the connection without a response");
    }

    Ok(serde_json::from_str(&line)?)
}
