use crate::buffer::{self, CommandBuffer, Queued};
use crate::pipeline::Lifecycle;
use crate::transport::{self, Transport};
use crate::{BatchError, Command, CommandSink, Connection, Failure, Frame, PendingResult, Reply};

use std::future::{self, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// 用 `MULTI`/`EXEC` 包装的一批命令，在服务器端原子地执行。
///
/// 对外的形状与 `Pipeline` 相同：`enqueue` 返回 `PendingResult`，`execute`
/// 返回按顺序排列的结果。不同之处在于：
///
/// * 每个命令发送后，服务器先回复 `QUEUED` 确认；这些确认按发送顺序逐个对应到缓冲区中的槽位。
/// * 任何命令没有被接受进队列时，整个事务注定失败。
/// * 事务被放弃（`WATCH` 的键被修改，或者服务器返回 `EXECABORT`）时，每个槽位都会收到
///   `TransactionAborted`，因为没有任何命令真正执行过。
///
/// 所有命令先缓冲，执行时才发送。事务只能执行一次。
///
/// ```no_run
/// use mini_redis_batch::{Client, Command};
///
/// # async fn dox() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let client = Client::connect("127.0.0.1:6379").await?;
/// let tx = client.transaction();
///
/// tx.watch(["balance"]).await?;
/// let balance = tx.enqueue(Command::new("INCR").arg("balance"))?;
/// tx.execute(false).await?;
///
/// println!("balance = {}", balance.await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Transaction<T = Connection> {
    conn: Arc<Mutex<T>>,
    buffer: CommandBuffer,
    lifecycle: Lifecycle,

    // 在连接上 `WATCH` 过键，且尚未被 `EXEC` 或 `UNWATCH` 释放。
    watching: AtomicBool,
}

/// 核对表中的一项：服务器对某个命令的排队确认。
#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueAck {
    Queued,

    /// 服务器用错误回复拒绝了命令。
    Rejected(String),

    /// 既不是 `QUEUED` 也不是错误。无法确定服务器是否排队了该命令，事务注定失败。
    Unexpected(String),
}

impl<T: Transport> Transaction<T> {
    pub(crate) fn new(conn: Arc<Mutex<T>>) -> Transaction<T> {
        Transaction {
            conn,
            buffer: CommandBuffer::new(),
            lifecycle: Lifecycle::new(),
            watching: AtomicBool::new(false),
        }
    }

    /// 在共享连接上 `WATCH` 给定的键。必须在 `execute` 之前调用。
    ///
    /// 如果这些键在 `EXEC` 之前被其他客户端修改，事务会被放弃。
    pub async fn watch<I, K>(&self, keys: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        if !self.lifecycle.is_open() {
            return Err(BatchError::AlreadyExecuted);
        }

        // 先置位：即使调用者中途放弃，`WATCH` 也可能已经生效，空事务需要释放它。
        self.watching.store(true, Ordering::SeqCst);

        let cmd = Command::watch(keys);
        if let Err(err) = transport::exclusive_round_trip(self.conn.clone(), cmd).await {
            self.watching.store(false, Ordering::SeqCst);
            return Err(err);
        }

        Ok(())
    }

    /// 释放此连接上所有被 `WATCH` 的键。
    pub async fn unwatch(&self) -> Result<(), BatchError> {
        if !self.lifecycle.is_open() {
            return Err(BatchError::AlreadyExecuted);
        }

        transport::exclusive_round_trip(self.conn.clone(), Command::unwatch()).await?;

        self.watching.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// 缓冲一个命令，立即返回它的 `PendingResult`。执行之后再入队返回 `AlreadyFlushed`。
    pub fn enqueue(&self, cmd: Command) -> Result<PendingResult, BatchError> {
        self.buffer.enqueue(cmd)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 以 `MULTI`/`EXEC` 执行所有缓冲的命令，返回按顺序排列的结果。
    ///
    /// `suppress_errors` 只影响 `EXEC` 结果中单个命令的错误。事务被放弃、命令没有被
    /// 接受进队列、连接丢失以及协议失步时，调用总是失败。
    ///
    /// 没有缓冲任何命令时不发送 `MULTI`/`EXEC`；如果之前 `WATCH` 过键，只发送
    /// `UNWATCH` 释放它们。
    #[instrument(skip(self), fields(commands = self.len()))]
    pub async fn execute(&self, suppress_errors: bool) -> Result<Vec<Reply>, BatchError> {
        self.lifecycle.begin()?;
        let entries = self.buffer.seal()?;

        let res = if entries.is_empty() {
            self.release_watch().await
        } else {
            transport::detached(run(self.conn.clone(), entries, suppress_errors)).await
        };

        // `EXEC` 总是会清除连接上的 `WATCH`。
        self.watching.store(false, Ordering::SeqCst);
        self.lifecycle.finish();
        res
    }

    async fn release_watch(&self) -> Result<Vec<Reply>, BatchError> {
        if self.watching.load(Ordering::SeqCst) {
            transport::exclusive_round_trip(self.conn.clone(), Command::unwatch()).await?;
        }

        Ok(vec![])
    }
}

impl<T: Transport> CommandSink for Transaction<T> {
    type Output = PendingResult;

    fn submit(&self, cmd: Command) -> impl Future<Output = Result<PendingResult, BatchError>> + Send {
        future::ready(self.enqueue(cmd))
    }
}

async fn run<T: Transport>(
    shared: Arc<Mutex<T>>,
    entries: Vec<Queued>,
    suppress_errors: bool,
) -> Result<Vec<Reply>, BatchError> {
    let mut conn = shared.lock().await;

    if conn.is_closed() {
        return Err(buffer::fail_all(entries, BatchError::ConnectionLost));
    }

    // 在确认服务器进入事务模式之前不发送任何缓冲的命令，否则它们会被立即执行。
    match transport::round_trip(&mut *conn, &Command::multi()).await {
        Ok(frame) if frame == "OK" => {}
        Ok(frame) => {
            let err = BatchError::ProtocolDesync(format!("expected OK for MULTI, got `{}`", frame));
            return Err(buffer::fail_all(entries, err));
        }
        Err(BatchError::Command(msg)) => {
            warn!(%msg, "MULTI refused");
            return Err(buffer::fail_all(entries, BatchError::TransactionAborted));
        }
        Err(fatal) => return Err(buffer::fail_all(entries, fatal)),
    }

    debug!(commands = entries.len(), "MULTI accepted; queuing");

    if let Err(err) = queue_all(&mut *conn, &entries).await {
        return Err(buffer::fail_all(entries, err));
    }

    let table = match read_acks(&mut *conn, entries.len()).await {
        Ok(table) => table,
        Err(err) => return Err(buffer::fail_all(entries, err)),
    };

    let exec = match conn.next_reply().await {
        Ok(frame) => frame,
        Err(err) => return Err(buffer::fail_all(entries, err)),
    };

    debug!("EXEC reply received; reconciling");
    reconcile(entries, table, exec, suppress_errors)
}

/// 写出所有缓冲的命令以及 `EXEC`，只刷新一次。
///
/// 即使某个命令之后会被拒绝，`EXEC` 也一定会被发送，连接的协议状态因此保持一致。
async fn queue_all<T: Transport>(conn: &mut T, entries: &[Queued]) -> Result<(), BatchError> {
    for queued in entries {
        conn.send(&queued.command).await?;
    }

    conn.send(&Command::exec()).await?;
    conn.flush().await
}

/// 读取每个命令的排队确认，构建核对表。
///
/// 第 *i* 个确认总是属于第 *i* 个命令，从不根据回复的内容来判断归属。
/// 无论确认的内容如何，都会读满 `len` 个，`EXEC` 的回复因此总是下一个被读取的帧。
async fn read_acks<T: Transport>(conn: &mut T, len: usize) -> Result<Vec<QueueAck>, BatchError> {
    let mut table = Vec::with_capacity(len);

    for index in 0..len {
        match conn.next_reply().await? {
            Frame::Simple(ack) if ack == "QUEUED" => table.push(QueueAck::Queued),
            Frame::Error(msg) => {
                warn!(index, %msg, "command rejected by transaction queue");
                table.push(QueueAck::Rejected(msg));
            }
            other => {
                let msg = format!("expected QUEUED, got `{}`", other);
                warn!(index, %msg, "unexpected queue acknowledgement");
                table.push(QueueAck::Unexpected(msg));
            }
        }
    }

    Ok(table)
}

/// 将 `EXEC` 的回复与核对表逐项对应，写入每个槽位。
fn reconcile(
    entries: Vec<Queued>,
    table: Vec<QueueAck>,
    exec: Frame,
    suppress_errors: bool,
) -> Result<Vec<Reply>, BatchError> {
    debug_assert_eq!(entries.len(), table.len());

    let rejected: Vec<Failure> = table
        .iter()
        .enumerate()
        .filter_map(|(index, ack)| match ack {
            QueueAck::Rejected(msg) | QueueAck::Unexpected(msg) => Some(Failure {
                index,
                error: BatchError::UnexpectedQueueAck(msg.clone()),
            }),
            QueueAck::Queued => None,
        })
        .collect();

    // 无法知道哪些命令进入了服务器的队列，不去解读 `EXEC` 的回复。
    if table.iter().any(|ack| matches!(ack, QueueAck::Unexpected(_))) {
        warn!("transaction doomed by unexpected queue acknowledgement");
        return Err(abort(entries, rejected));
    }

    let items = match exec {
        Frame::Array(items) => items,
        Frame::Null => {
            debug!("transaction aborted; watched key modified");
            return Err(abort(entries, rejected));
        }
        Frame::Error(msg) => {
            warn!(%msg, "transaction aborted by server");
            return Err(abort(entries, rejected));
        }
        other => {
            let err = BatchError::ProtocolDesync(format!("unexpected EXEC reply `{}`", other));
            return Err(buffer::fail_all(entries, err));
        }
    };

    let expected = table.len() - rejected.len();

    if items.len() != expected {
        let err = BatchError::ProtocolDesync(format!(
            "EXEC returned {} replies for {} queued commands",
            items.len(),
            expected
        ));
        return Err(buffer::fail_all(entries, err));
    }

    let mut items = items.into_iter();
    let mut replies = Vec::with_capacity(entries.len());
    let mut failures = vec![];

    for ((index, queued), ack) in entries.into_iter().enumerate().zip(table) {
        let reply = match ack {
            QueueAck::Queued => match items.next() {
                Some(Frame::Error(msg)) => Err(BatchError::Command(msg)),
                Some(frame) => Ok(frame),
                None => Err(BatchError::ProtocolDesync("EXEC reply exhausted".into())),
            },
            QueueAck::Rejected(msg) | QueueAck::Unexpected(msg) => {
                Err(BatchError::UnexpectedQueueAck(msg))
            }
        };

        if let Err(err) = &reply {
            failures.push(Failure {
                index,
                error: err.clone(),
            });
        }

        queued.resolver.resolve(reply.clone());
        replies.push(reply);
    }

    // 排队阶段的拒绝总是让调用失败。
    if !rejected.is_empty() || (!failures.is_empty() && !suppress_errors) {
        return Err(BatchError::Failed(failures));
    }

    Ok(replies)
}

fn abort(entries: Vec<Queued>, rejected: Vec<Failure>) -> BatchError {
    let err = buffer::fail_all(entries, BatchError::TransactionAborted);

    if rejected.is_empty() {
        err
    } else {
        BatchError::Failed(rejected)
    }
}
