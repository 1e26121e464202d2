//! 接收端
//!
//! 在选定的本地地址上监听，一次只接受一个传输协商。
//!
//! # 状态机
//!
//! ```text
//! IDLE → LISTENING → RECV_WAIT → RECV → RECV_DONE → LISTENING
//!          ↕  BUSY        ↘        ↘
//!                          FAILED ← ┘  (set_state_idle 后回到 LISTENING)
//! ```
//!
//! 状态放在 `std::sync::Mutex` 中，控制调用都是同步的，可以在任意线程
//! 轮询；只有连接任务里的套接字和文件 I/O 会挂起。

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, create_dir_all};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    Message, PROTOCOL_VERSION, RejectReason, SendRequest, expect_message, write_message,
};
use super::{TransferOptions, lock};
use crate::error::{Result, TransferError};
use crate::manifest::{Manifest, destination_path};
use crate::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverState {
    /// 未绑定套接字
    Idle,
    /// 已绑定，等待发送端
    Listening,
    /// 本机正在发送，暂不接收
    Busy,
    /// 收到请求，等待控制层决定
    RecvWait,
    Recv,
    RecvDone,
    /// 协商或传输失败，`error` 中给出原因
    Failed,
}

impl ReceiverState {
    pub fn name(&self) -> &'static str {
        match self {
            ReceiverState::Idle => "IDLE",
            ReceiverState::Listening => "LISTENING",
            ReceiverState::Busy => "BUSY",
            ReceiverState::RecvWait => "RECV_WAIT",
            ReceiverState::Recv => "RECV",
            ReceiverState::RecvDone => "RECV_DONE",
            ReceiverState::Failed => "FAILED",
        }
    }

    /// 是否有传输协商在进行
    pub fn in_session(&self) -> bool {
        matches!(self, ReceiverState::RecvWait | ReceiverState::Recv)
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 接收端状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    pub state: ReceiverState,
    /// 发送端 ID
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transfer_id: Option<String>,
    /// 只在 `RECV_WAIT` 时给出
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub manifest: Option<Manifest>,
    /// 只在 `RECV` 时给出，字节/秒
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub speed: Option<f64>,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

enum Decision {
    Accept(PathBuf),
    Reject,
}

struct Shared {
    state: ReceiverState,
    closed: bool,
    peer_id: Option<String>,
    transfer_id: Option<String>,
    manifest: Option<Manifest>,
    decision: Option<oneshot::Sender<Decision>>,
    destination: Option<PathBuf>,
    progress: Option<Progress>,
    error: Option<String>,
}

impl Shared {
    fn listening() -> Self {
        Self {
            state: ReceiverState::Listening,
            closed: false,
            peer_id: None,
            transfer_id: None,
            manifest: None,
            decision: None,
            destination: None,
            progress: None,
            error: None,
        }
    }

    /// 清空会话数据并进入 `state`
    fn reset(&mut self, state: ReceiverState) {
        self.state = state;
        self.peer_id = None;
        self.transfer_id = None;
        self.manifest = None;
        self.decision = None;
        self.destination = None;
        self.progress = None;
        self.error = None;
    }

    /// 进行中的会话失败；已经结束的会话不受影响
    fn fail(&mut self, error: &TransferError) {
        if self.state.in_session() {
            self.state = ReceiverState::Failed;
            self.manifest = None;
            self.decision = None;
            self.error = Some(error.to_string());
        }
    }

    /// 只在 `transfer_id` 仍是当前会话时失败
    fn fail_transfer(&mut self, transfer_id: &str, error: &TransferError) {
        if self.is_current(transfer_id) {
            self.fail(error);
        }
    }

    fn is_current(&self, transfer_id: &str) -> bool {
        self.transfer_id.as_deref() == Some(transfer_id)
    }
}

struct Context {
    id: String,
    options: TransferOptions,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
}

/// 接收端
pub struct Receiver {
    local_addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    acceptor: Option<JoinHandle<()>>,
}

impl Receiver {
    /// 绑定 `addr` 并开始监听，`id` 会在应答中发给发送端
    ///
    /// 端口为 0 时由系统分配，通过 [`Receiver::local_addr`] 获取。
    pub fn open(
        addr: SocketAddr,
        id: &str,
        options: TransferOptions,
        runtime: &Handle,
    ) -> Result<Self> {
        let bind_error = |source| TransferError::Bind { addr, source };

        let listener = {
            let _guard = runtime.enter();
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(bind_error)?;
            #[cfg(unix)]
            socket.set_reuseaddr(true).map_err(bind_error)?;
            socket.bind(addr).map_err(bind_error)?;
            socket.listen(16).map_err(bind_error)?
        };
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let shared = Arc::new(Mutex::new(Shared::listening()));
        let cancel = CancellationToken::new();
        let context = Arc::new(Context {
            id: id.to_string(),
            options,
            shared: shared.clone(),
            cancel: cancel.clone(),
        });

        let acceptor = runtime.spawn(accept_loop(listener, context));
        info!("Receiver listening on {} as '{}'", local_addr, id);

        Ok(Self {
            local_addr,
            shared,
            cancel,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止监听并中止进行中的协商
    ///
    /// 有会话进行时进入 `FAILED`（未完成的目标文件会被删除），否则回到
    /// `IDLE`。重复调用无副作用。
    pub fn close_server_socket(&self) {
        {
            let mut shared = lock(&self.shared);
            if !shared.closed {
                shared.closed = true;
                if shared.state.in_session() {
                    shared.fail(&TransferError::Cancelled);
                } else {
                    shared.reset(ReceiverState::Idle);
                }
            }
        }
        self.cancel.cancel();
        debug!("Receiver on {} closed", self.local_addr);
    }

    /// 关闭并等待监听套接字真正释放
    pub async fn shutdown(mut self) {
        self.close_server_socket();
        if let Some(acceptor) = self.acceptor.take()
            && let Err(e) = acceptor.await
        {
            warn!("Receiver acceptor ended abnormally: {}", e);
        }
    }

    /// 是否仍绑定着套接字
    pub fn is_exposed(&self) -> bool {
        !lock(&self.shared).closed
    }

    /// 暂停接收（只在 `LISTENING` 时生效）
    pub fn set_state_busy(&self) {
        let mut shared = lock(&self.shared);
        if shared.state == ReceiverState::Listening {
            shared.state = ReceiverState::Busy;
        }
    }

    /// 恢复接收，同时确认 `RECV_DONE` / `FAILED` 的终态
    pub fn set_state_idle(&self) {
        let mut shared = lock(&self.shared);
        if matches!(
            shared.state,
            ReceiverState::Busy | ReceiverState::RecvDone | ReceiverState::Failed
        ) {
            let next = if shared.closed {
                ReceiverState::Idle
            } else {
                ReceiverState::Listening
            };
            shared.reset(next);
        }
    }

    /// 确认 `RECV_DONE` / `FAILED` 并直接进入 `BUSY`
    ///
    /// 本机发送进行中时使用，确认和暂停之间不会接受新的请求。
    pub fn acknowledge_busy(&self) {
        let mut shared = lock(&self.shared);
        if matches!(
            shared.state,
            ReceiverState::RecvDone | ReceiverState::Failed
        ) {
            let next = if shared.closed {
                ReceiverState::Idle
            } else {
                ReceiverState::Busy
            };
            shared.reset(next);
        }
    }

    /// 接受待定的传输，文件写入 `destination`
    pub fn accept_recv(&self, destination: impl Into<PathBuf>) -> Result<()> {
        let mut shared = lock(&self.shared);
        let decision = take_decision(&mut shared, "accept_recv")?;
        let destination = destination.into();
        let total = shared.manifest.as_ref().map_or(0, Manifest::total_size);

        shared.state = ReceiverState::Recv;
        shared.destination = Some(destination.clone());
        shared.progress = Some(Progress::new(total));
        shared.manifest = None;
        drop(shared);

        let _ = decision.send(Decision::Accept(destination));
        Ok(())
    }

    /// 拒绝待定的传输并回到 `LISTENING`
    pub fn reject_recv(&self) -> Result<()> {
        let mut shared = lock(&self.shared);
        let decision = take_decision(&mut shared, "reject_recv")?;
        shared.reset(ReceiverState::Listening);
        drop(shared);

        let _ = decision.send(Decision::Reject);
        Ok(())
    }

    pub fn get_state(&self) -> ReceiverState {
        lock(&self.shared).state
    }

    /// 当前速度（字节/秒），只在 `RECV` 时有值
    pub fn get_speed(&self) -> Option<f64> {
        let mut shared = lock(&self.shared);
        if shared.state != ReceiverState::Recv {
            return None;
        }
        shared.progress.as_mut().map(Progress::sample_speed)
    }

    /// 待决定的清单，只在 `RECV_WAIT` 时有值
    pub fn pending_manifest(&self) -> Option<Manifest> {
        let shared = lock(&self.shared);
        if shared.state != ReceiverState::RecvWait {
            return None;
        }
        shared.manifest.clone()
    }

    pub fn status(&self) -> ReceiverStatus {
        let mut shared = lock(&self.shared);
        let state = shared.state;
        let manifest = if state == ReceiverState::RecvWait {
            shared.manifest.clone()
        } else {
            None
        };
        let speed = if state == ReceiverState::Recv {
            shared.progress.as_mut().map(Progress::sample_speed)
        } else {
            None
        };
        let (bytes_transferred, bytes_total) = shared
            .progress
            .as_ref()
            .map_or((0, 0), |p| (p.bytes_transferred, p.bytes_total));

        ReceiverStatus {
            state,
            peer_id: shared.peer_id.clone(),
            transfer_id: shared.transfer_id.clone(),
            manifest,
            speed,
            bytes_transferred,
            bytes_total,
            destination: shared.destination.clone(),
            error: shared.error.clone(),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn take_decision(shared: &mut Shared, op: &'static str) -> Result<oneshot::Sender<Decision>> {
    if shared.state != ReceiverState::RecvWait {
        return Err(TransferError::invalid_state(op, shared.state));
    }
    shared
        .decision
        .take()
        .ok_or_else(|| TransferError::invalid_state(op, shared.state))
}

async fn accept_loop(listener: TcpListener, context: Arc<Context>) {
    loop {
        let accepted = tokio::select! {
            () = context.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Inbound connection from {}", peer);
                tokio::spawn(handle_connection(stream, peer, context.clone()));
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                // 文件描述符耗尽等错误会立即重复，稍等再试
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Acceptor stopped");
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, context: Arc<Context>) {
    let request = tokio::select! {
        () = context.cancel.cancelled() => return,
        request = read_request(&mut stream, &context.options) => request,
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer, e);
            return;
        }
    };

    let Some(decision) = claim(&context, &request) else {
        info!(
            "Rejecting transfer {} from '{}': receiver busy",
            request.transfer_id, request.peer_id
        );
        let reply = Message::Reject {
            peer_id: context.id.clone(),
            reason: RejectReason::Busy,
        };
        if let Err(e) = write_message(&mut stream, &reply).await {
            debug!("Failed to send busy reply to {}: {}", peer, e);
        }
        return;
    };

    let result = tokio::select! {
        () = context.cancel.cancelled() => Err(TransferError::Cancelled),
        result = run_session(&mut stream, &request, decision, &context) => result,
    };

    if let Err(e) = result {
        warn!("Transfer {} from {} failed: {}", request.transfer_id, peer, e);
        lock(&context.shared).fail_transfer(&request.transfer_id, &e);
    }
}

async fn read_request(stream: &mut TcpStream, options: &TransferOptions) -> Result<SendRequest> {
    let message = tokio::time::timeout(
        options.handshake_timeout,
        expect_message(stream, "sendRequest"),
    )
    .await
    .map_err(|_| TransferError::Timeout("waiting for sendRequest"))??;

    let Message::SendRequest(request) = message else {
        return Err(message.unexpected("sendRequest"));
    };
    if request.version != PROTOCOL_VERSION {
        return Err(TransferError::Protocol(format!(
            "unsupported protocol version {} (expected {})",
            request.version, PROTOCOL_VERSION
        )));
    }
    request.manifest.validate()?;
    Ok(request)
}

/// 只有 `LISTENING` 的接收端才能进入 `RECV_WAIT`
fn claim(context: &Context, request: &SendRequest) -> Option<oneshot::Receiver<Decision>> {
    let mut shared = lock(&context.shared);
    if shared.closed || shared.state != ReceiverState::Listening {
        return None;
    }

    let (tx, rx) = oneshot::channel();
    shared.reset(ReceiverState::RecvWait);
    shared.peer_id = Some(request.peer_id.clone());
    shared.transfer_id = Some(request.transfer_id.clone());
    shared.manifest = Some(request.manifest.clone());
    shared.decision = Some(tx);

    info!(
        "Transfer {} from '{}' waiting for decision: {} files, {} bytes",
        request.transfer_id,
        request.peer_id,
        request.manifest.file_count(),
        request.manifest.total_size()
    );
    Some(rx)
}

async fn run_session(
    stream: &mut TcpStream,
    request: &SendRequest,
    decision: oneshot::Receiver<Decision>,
    context: &Context,
) -> Result<()> {
    let mut probe = [0u8; 1];
    let decision = tokio::select! {
        decision = decision => decision.map_err(|_| TransferError::Cancelled)?,
        read = stream.read(&mut probe) => {
            return Err(match read {
                Ok(0) => TransferError::Protocol("sender disconnected before a decision was made".into()),
                Ok(_) => TransferError::Protocol("sender sent data before the request was accepted".into()),
                Err(e) => e.into(),
            });
        }
    };

    let destination = match decision {
        Decision::Reject => {
            info!("Transfer {} rejected", request.transfer_id);
            let reply = Message::Reject {
                peer_id: context.id.clone(),
                reason: RejectReason::Declined,
            };
            // 状态已经回到 LISTENING，回复失败只记录日志
            if let Err(e) = write_message(stream, &reply).await {
                debug!("Failed to deliver reject: {}", e);
            }
            return Ok(());
        }
        Decision::Accept(destination) => destination,
    };

    info!(
        "Transfer {} accepted, writing into {:?}",
        request.transfer_id, destination
    );
    write_message(
        stream,
        &Message::Accept {
            peer_id: context.id.clone(),
        },
    )
    .await?;

    receive_tree(
        stream,
        &request.manifest,
        &destination,
        &request.transfer_id,
        context,
    )
    .await?;

    match expect_message(stream, "done").await? {
        Message::Done => {}
        other => return Err(other.unexpected("done")),
    }
    write_message(stream, &Message::Complete).await?;

    let mut shared = lock(&context.shared);
    if shared.state == ReceiverState::Recv && shared.is_current(&request.transfer_id) {
        shared.state = ReceiverState::RecvDone;
        info!("Transfer {} complete", request.transfer_id);
    }
    Ok(())
}

/// 按清单重建目录并依序写入文件
async fn receive_tree(
    stream: &mut TcpStream,
    manifest: &Manifest,
    destination: &Path,
    transfer_id: &str,
    context: &Context,
) -> Result<()> {
    create_dir_all(destination)
        .await
        .map_err(|e| TransferError::io(destination, e))?;
    for dir in manifest.directories() {
        let path = destination_path(destination, &dir);
        create_dir_all(&path)
            .await
            .map_err(|e| TransferError::io(&path, e))?;
    }

    for file in manifest.files() {
        let (path, size) = match expect_message(stream, "file").await? {
            Message::File { path, size } => (path, size),
            other => return Err(other.unexpected("file")),
        };
        if path != file.relative || size != file.size {
            return Err(TransferError::Protocol(format!(
                "expected file `{}` ({} bytes), got `{}` ({} bytes)",
                file.relative, file.size, path, size
            )));
        }

        let target = destination_path(destination, &file.relative);
        debug!("Receiving {:?} ({} bytes)", target, size);
        receive_file(stream, &target, size, transfer_id, context).await?;
    }
    Ok(())
}

/// 未完成时在析构中删除的目标文件
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn commit(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed incomplete file {:?}", path),
                Err(e) => warn!("Failed to remove incomplete file {:?}: {}", path, e),
            }
        }
    }
}

async fn receive_file(
    stream: &mut TcpStream,
    target: &Path,
    size: u64,
    transfer_id: &str,
    context: &Context,
) -> Result<()> {
    // guard 先于 file 声明，析构时文件句柄先关闭
    let mut guard = PartialFile {
        path: Some(target.to_path_buf()),
    };
    let mut file = File::create(target)
        .await
        .map_err(|e| TransferError::io(target, e))?;

    let mut buffer = vec![0u8; context.options.chunk_size.max(1)];
    let mut remaining = size;
    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));
        let read = stream.read(&mut buffer[..want]).await?;
        if read == 0 {
            return Err(TransferError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed with {remaining} bytes of {target:?} outstanding"),
            )));
        }
        file.write_all(&buffer[..read])
            .await
            .map_err(|e| TransferError::io(target, e))?;
        remaining -= read as u64;

        let mut shared = lock(&context.shared);
        if shared.is_current(transfer_id)
            && let Some(progress) = shared.progress.as_mut()
        {
            progress.add(read as u64);
        }
        drop(shared);
    }

    file.flush().await.map_err(|e| TransferError::io(target, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::io(target, e))?;
    drop(file);
    guard.commit();
    Ok(())
}
