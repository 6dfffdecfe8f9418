use crate::buffer::{self, CommandBuffer, Queued};
use crate::transport::{self, Transport};
use crate::{BatchError, Command, CommandSink, Connection, Failure, Frame, PendingResult, Reply};

use std::future::{self, Future};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// 一批相互独立的命令，作为一次突发写入发送，按顺序收集回复。
///
/// 命令通过 `enqueue` 加入缓冲区，此时不做任何 I/O。`execute` 封存缓冲区，
/// 独占连接，把所有命令一次写出，然后把第 *i* 个回复交给第 *i* 个 `PendingResult`。
///
/// 流水线只能执行一次。
///
/// ```no_run
/// use mini_redis_batch::{Client, Command};
///
/// # async fn dox() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let client = Client::connect("127.0.0.1:6379").await?;
/// let pipeline = client.pipeline();
///
/// let set = pipeline.enqueue(Command::new("SET").arg("k").arg("v"))?;
/// let get = pipeline.enqueue(Command::new("GET").arg("k"))?;
///
/// let replies = pipeline.execute(false).await?;
/// assert_eq!(replies.len(), 2);
/// assert_eq!(get.await?, "v");
/// # drop(set);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Pipeline<T = Connection> {
    conn: Arc<Mutex<T>>,
    buffer: CommandBuffer,
    lifecycle: Lifecycle,
}

/// 协调器的阶段。`Open → Flushing` 只发生一次，`Done` 是终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Open,
    Flushing,
    Done,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    phase: std::sync::Mutex<Phase>,
}

impl Lifecycle {
    pub(crate) fn new() -> Lifecycle {
        Lifecycle {
            phase: std::sync::Mutex::new(Phase::Open),
        }
    }

    /// `Open → Flushing`。重复执行返回 `AlreadyExecuted`。
    pub(crate) fn begin(&self) -> Result<(), BatchError> {
        let mut phase = self.phase.lock().unwrap();

        if *phase != Phase::Open {
            return Err(BatchError::AlreadyExecuted);
        }

        *phase = Phase::Flushing;
        Ok(())
    }

    pub(crate) fn finish(&self) {
        *self.phase.lock().unwrap() = Phase::Done;
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.phase.lock().unwrap() == Phase::Open
    }
}

impl<T: Transport> Pipeline<T> {
    pub(crate) fn new(conn: Arc<Mutex<T>>) -> Pipeline<T> {
        Pipeline {
            conn,
            buffer: CommandBuffer::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// 追加一个命令，立即返回它的 `PendingResult`。
    ///
    /// 从不等待网络。流水线执行之后再入队返回 `AlreadyFlushed`。
    pub fn enqueue(&self, cmd: Command) -> Result<PendingResult, BatchError> {
        self.buffer.enqueue(cmd)
    }

    /// 已入队但尚未发送的命令数量。
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 发送所有已入队的命令并按顺序返回每个命令的结果。
    ///
    /// 单个命令的错误回复只影响它自己的槽位。当 `suppress_errors` 为 `false` 时，
    /// 只要有命令失败，整个调用就返回列出全部失败命令的 `BatchError::Failed`；
    /// 为 `true` 时调用成功，失败只出现在对应的结果中。
    ///
    /// 连接丢失或协议失步会终止整个流水线：所有尚未得到回复的槽位都会收到该错误，
    /// 无论 `suppress_errors` 取何值，调用本身也返回该错误。
    ///
    /// 刷新在独立的任务中进行。即使调用者放弃了这个 future，已经开始的刷新也会读完
    /// 所有回复，连接上不会残留未读的回复。
    #[instrument(skip(self), fields(commands = self.len()))]
    pub async fn execute(&self, suppress_errors: bool) -> Result<Vec<Reply>, BatchError> {
        self.lifecycle.begin()?;
        let entries = self.buffer.seal()?;

        if entries.is_empty() {
            self.lifecycle.finish();
            return Ok(vec![]);
        }

        let res = transport::detached(flush(self.conn.clone(), entries, suppress_errors)).await;
        self.lifecycle.finish();
        res
    }
}

impl<T: Transport> CommandSink for Pipeline<T> {
    type Output = PendingResult;

    fn submit(&self, cmd: Command) -> impl Future<Output = Result<PendingResult, BatchError>> + Send {
        future::ready(self.enqueue(cmd))
    }
}

async fn flush<T: Transport>(
    shared: Arc<Mutex<T>>,
    entries: Vec<Queued>,
    suppress_errors: bool,
) -> Result<Vec<Reply>, BatchError> {
    let mut conn = shared.lock().await;

    if conn.is_closed() {
        return Err(buffer::fail_all(entries, BatchError::ConnectionLost));
    }

    debug!(commands = entries.len(), "flushing pipeline");

    if let Err(err) = write_all(&mut *conn, &entries).await {
        return Err(buffer::fail_all(entries, err));
    }

    let mut replies = Vec::with_capacity(entries.len());
    let mut failures = vec![];
    let mut entries = entries.into_iter().enumerate();

    while let Some((index, queued)) = entries.next() {
        let reply = match conn.next_reply().await {
            Ok(Frame::Error(msg)) => {
                let err = BatchError::Command(msg);
                failures.push(Failure {
                    index,
                    error: err.clone(),
                });
                Err(err)
            }
            Ok(frame) => Ok(frame),
            Err(fatal) => {
                warn!(index, cause = %fatal, "pipeline interrupted");
                queued.resolver.resolve(Err(fatal.clone()));
                return Err(buffer::fail_all(entries.map(|(_, rest)| rest), fatal));
            }
        };

        queued.resolver.resolve(reply.clone());
        replies.push(reply);
    }

    if !failures.is_empty() && !suppress_errors {
        debug!(failed = failures.len(), "pipeline completed with errors");
        return Err(BatchError::Failed(failures));
    }

    Ok(replies)
}

/// 按顺序写出所有命令并只刷新一次。
pub(crate) async fn write_all<T: Transport>(conn: &mut T, entries: &[Queued]) -> Result<(), BatchError> {
    for queued in entries {
        conn.send(&queued.command).await?;
    }

    conn.flush().await
}
