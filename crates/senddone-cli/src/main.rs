//! SendDone CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use senddone_core::manifest::Manifest;
use senddone_core::{IpcRequest, IpcResponse, ReceiverState, ReceiverStatus, SenderStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "senddone", version, about = "SendDone - 局域网文件传输工具")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出本机可监听的地址
    Networks,
    /// 在指定地址上开始接收
    Listen {
        /// 本机地址，可带端口 (例如 192.168.1.5 或 192.168.1.5:47823)
        address: String,
    },
    /// 停止接收
    Close,
    /// 设置本机 ID (空字符串恢复为主机名)
    Id { id: String },
    /// 发送文件或目录
    Send {
        /// 接收端地址
        address: String,
        /// 要发送的路径
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// 发起后立即返回，不等待完成
        #[arg(long)]
        no_watch: bool,
    },
    /// 查看当前状态
    Status,
    /// 接受待定的传输
    Accept {
        /// 保存目录 (默认: 配置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 拒绝待定的传输
    Reject,
    /// 持续显示接收状态直到传输结束
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Networks => {
            let resp = client::send_request(IpcRequest::Networks).await?;
            if let IpcResponse::Networks { networks } = resp {
                if networks.is_empty() {
                    println!("   未发现可用地址");
                } else {
                    for (i, net) in networks.iter().enumerate() {
                        println!("   [{}] {} ({})", i, net.address, net.name);
                    }
                }
            }
        }
        Commands::Listen { address } => {
            println!("📥 接收模式: {}", address);
            client::send_request(IpcRequest::OpenServerSocket { address }).await?;
        }
        Commands::Close => {
            let resp = client::send_request(IpcRequest::CloseServerSocket).await?;
            if let IpcResponse::Flag { value } = resp {
                println!("{}", if value { "⏹️  已停止接收" } else { "   接收端未打开" });
            }
        }
        Commands::Id { id } => {
            client::send_request(IpcRequest::SetId { id }).await?;
        }
        Commands::Send {
            address,
            paths,
            no_watch,
        } => {
            println!("📤 发送到 {}", address);
            for path in &paths {
                println!("   {}", path.display());
            }
            let resp = client::send_request(IpcRequest::Send { address, paths }).await?;
            if matches!(resp, IpcResponse::Ok { .. }) && !no_watch {
                watch_send().await?;
            }
        }
        Commands::Status => {
            let resp = client::request_quiet(IpcRequest::IsServerSocketOpen).await?;
            if let IpcResponse::Flag { value } = resp {
                println!("接收端: {}", if value { "已打开" } else { "未打开" });
            }
            if let IpcResponse::RecvState { status: Some(status) } =
                client::request_quiet(IpcRequest::RecvState).await?
            {
                println!("接收: {}", describe_recv(&status));
            }
            if let IpcResponse::SendState { status: Some(status) } =
                client::request_quiet(IpcRequest::SendState).await?
            {
                println!("发送: {}", describe_send(&status));
            }
        }
        Commands::Accept { output } => {
            client::send_request(IpcRequest::AcceptRecv {
                destination: output,
            })
            .await?;
        }
        Commands::Reject => {
            client::send_request(IpcRequest::RejectRecv).await?;
        }
        Commands::Watch => watch_recv().await?,
    }

    Ok(())
}

/// 轮询发送状态直到终态，然后结束发送会话
async fn watch_send() -> Result<()> {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        match client::request_quiet(IpcRequest::SendState).await? {
            IpcResponse::SendState { status: Some(status) } => {
                println!("   {}", describe_send(&status));
                if status.state.is_terminal() {
                    break;
                }
            }
            IpcResponse::SendState { status: None } => break,
            IpcResponse::Error { message, .. } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }
    client::request_quiet(IpcRequest::FinishSend).await?;
    Ok(())
}

/// 轮询接收状态；等待决定时提示一次，传输结束后退出
async fn watch_recv() -> Result<()> {
    let mut announced = None;
    loop {
        match client::request_quiet(IpcRequest::RecvState).await? {
            IpcResponse::RecvState { status: Some(status) } => {
                if status.state == ReceiverState::RecvWait {
                    if announced != status.transfer_id {
                        announced.clone_from(&status.transfer_id);
                        announce(&status);
                    }
                } else {
                    println!("   {}", describe_recv(&status));
                }
                if matches!(status.state, ReceiverState::RecvDone | ReceiverState::Failed) {
                    break;
                }
            }
            IpcResponse::RecvState { status: None } => {
                println!("   接收端未打开，先运行 `senddone listen <地址>`");
                break;
            }
            IpcResponse::Error { message, .. } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

fn announce(status: &ReceiverStatus) {
    let from = status.peer_id.as_deref().unwrap_or("?");
    println!("📨 来自 {} 的传输请求:", from);
    if let Some(manifest) = &status.manifest {
        print_manifest(manifest);
    }
    println!("   运行 `senddone accept [-o 目录]` 接受，或 `senddone reject` 拒绝");
}

fn print_manifest(manifest: &Manifest) {
    for entry in manifest.entries() {
        let kind = if entry.is_dir() { "📁" } else { "📄" };
        println!("   {} {}", kind, entry.name);
    }
    println!(
        "   共 {} 个文件, {}",
        manifest.file_count(),
        format_bytes(manifest.total_size())
    );
}

fn describe_recv(status: &ReceiverStatus) -> String {
    describe(
        status.state.name(),
        status.bytes_transferred,
        status.bytes_total,
        status.speed,
        status.error.as_deref(),
    )
}

fn describe_send(status: &SenderStatus) -> String {
    describe(
        status.state.name(),
        status.bytes_transferred,
        status.bytes_total,
        status.speed,
        status.error.as_deref(),
    )
}

fn describe(state: &str, transferred: u64, total: u64, speed: Option<f64>, error: Option<&str>) -> String {
    let mut line = state.to_string();
    if total > 0 {
        line.push_str(&format!(" {} / {}", format_bytes(transferred), format_bytes(total)));
    }
    if let Some(speed) = speed {
        line.push_str(&format!(" ({})", format_speed(speed)));
    }
    if let Some(error) = error {
        line.push_str(&format!(": {error}"));
    }
    line
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_speed(bytes_per_sec: f64) -> String {
    // 速度总是非负，截断到整字节即可
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}
