use crate::{BatchError, Command};

use std::future::Future;

/// 可以接收命令的对象。
///
/// 由实时的 `Client`（立即执行并返回回复帧）以及 `Pipeline` 和 `Transaction`
/// （入队并返回 `PendingResult`）共同实现，因此同一段调用代码可以面向其中任意一种。
///
/// ```no_run
/// use mini_redis_batch::{BatchError, CommandSink};
///
/// async fn record_visit<S: CommandSink>(sink: &S) -> Result<S::Output, BatchError> {
///     sink.incr("visits").await
/// }
/// ```
pub trait CommandSink {
    /// `submit` 为每个命令产生的值。
    type Output;

    fn submit(&self, cmd: Command) -> impl Future<Output = Result<Self::Output, BatchError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<Self::Output, BatchError>> + Send {
        self.submit(Command::new("PING"))
    }

    fn get(&self, key: &str) -> impl Future<Output = Result<Self::Output, BatchError>> + Send {
        self.submit(Command::new("GET").arg(key))
    }

    fn set(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
    ) -> impl Future<Output = Result<Self::Output, BatchError>> + Send {
        self.submit(Command::new("SET").arg(key).arg(value))
    }

    fn incr(&self, key: &str) -> impl Future<Output = Result<Self::Output, BatchError>> + Send {
        self.submit(Command::new("INCR").arg(key))
    }

    fn del(&self, key: &str) -> impl Future<Output = Result<Self::Output, BatchError>> + Send {
        self.submit(Command::new("DEL").arg(key))
    }
}
