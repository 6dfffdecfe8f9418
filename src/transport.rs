use crate::{BatchError, Command, Frame};

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 协调器对连接的全部要求。
///
/// 发送与回复之间严格保持 FIFO 顺序：第 *i* 个被发送的命令对应第 *i* 个回复。
/// 连接的建立、重连和认证不在这里处理。
///
/// 实现需要把自身的失败映射为 `BatchError`：连接关闭、I/O 错误或超时映射为
/// `ConnectionLost`，无法解析的帧映射为 `ProtocolDesync`。
pub trait Transport: Send + 'static {
    /// 将命令写入发送缓冲区。
    fn send(&mut self, cmd: &Command) -> impl Future<Output = Result<(), BatchError>> + Send;

    /// 把已缓冲的命令写入网络。
    fn flush(&mut self) -> impl Future<Output = Result<(), BatchError>> + Send;

    /// 按顺序读取下一个回复。服务器返回的错误回复是一个普通的 `Frame::Error`。
    fn next_reply(&mut self) -> impl Future<Output = Result<Frame, BatchError>> + Send;

    fn is_closed(&self) -> bool;
}

/// 发送单个命令并等待它的回复。错误回复被转换为 `BatchError::Command`。
pub(crate) async fn round_trip<T: Transport>(conn: &mut T, cmd: &Command) -> Result<Frame, BatchError> {
    conn.send(cmd).await?;
    conn.flush().await?;

    match conn.next_reply().await? {
        Frame::Error(msg) => Err(BatchError::Command(msg)),
        frame => Ok(frame),
    }
}

/// 独占共享连接完成一次往返。
///
/// 往返在独立任务中进行：调用者在写出命令之后放弃等待，回复仍然会被读走，
/// 下一个使用连接的调用者不会收到它。
pub(crate) async fn exclusive_round_trip<T: Transport>(
    shared: Arc<Mutex<T>>,
    cmd: Command,
) -> Result<Frame, BatchError> {
    detached(async move {
        let mut conn = shared.lock().await;
        round_trip(&mut *conn, &cmd).await
    })
    .await
}

/// 在独立任务中运行一段持有连接的工作并等待它完成。
///
/// 一旦开始，工作总会运行到结束，与调用者是否还在等待无关。
pub(crate) async fn detached<F, R>(work: F) -> Result<R, BatchError>
where
    F: Future<Output = Result<R, BatchError>> + Send + 'static,
    R: Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(res) => res,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // 运行时正在关闭，任务持有的槽位已经随任务一起被丢弃。
        Err(_) => Err(BatchError::ConnectionLost),
    }
}
