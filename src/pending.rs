use crate::{BatchError, Frame};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// 单个命令的结果：回复帧或错误。
pub type Reply = Result<Frame, BatchError>;

/// 一个只会被写入一次的结果槽。
///
/// 命令入队时创建，由协调器在核对回复时写入。`PendingResult` 本身是一个 future，
/// 等待它即可得到该命令的结果。
///
/// 调用者可以随时丢弃 `PendingResult`，协调器仍然会读取并丢弃对应的回复，
/// 之后的回复不会因此错位。
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<Reply>,
}

/// `PendingResult` 的写入端，只由协调器持有。
///
/// `resolve` 消耗 `self`，因此每个槽位最多被写入一次。如果写入端在写入之前被丢弃
/// （例如刷新任务被运行时终止），等待方会得到 `ConnectionLost`，而不是永远挂起。
#[derive(Debug)]
pub(crate) struct Resolver {
    tx: oneshot::Sender<Reply>,
}

pub(crate) fn pending() -> (Resolver, PendingResult) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, PendingResult { rx })
}

impl Resolver {
    pub(crate) fn resolve(self, reply: Reply) {
        // 接收方已被丢弃说明调用者不再关心结果。
        let _ = self.tx.send(reply);
    }
}

impl Future for PendingResult {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BatchError::ConnectionLost)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_value() {
        let (resolver, pending) = pending();
        resolver.resolve(Ok(Frame::Integer(7)));
        assert_eq!(pending.await, Ok(Frame::Integer(7)));
    }

    #[tokio::test]
    async fn dropped_resolver_is_connection_lost() {
        let (resolver, pending) = pending();
        drop(resolver);
        assert_eq!(pending.await, Err(BatchError::ConnectionLost));
    }

    #[test]
    fn resolving_abandoned_slot_is_silent() {
        let (resolver, pending) = pending();
        drop(pending);
        resolver.resolve(Ok(Frame::Null));
    }
}
