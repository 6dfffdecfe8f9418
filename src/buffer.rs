use crate::pending::{self, Resolver};
use crate::{BatchError, Command, PendingResult};

use std::mem;
use std::sync::Mutex;

/// 已入队但尚未发送的命令，以及写入其结果的句柄。
#[derive(Debug)]
pub(crate) struct Queued {
    pub(crate) command: Command,
    pub(crate) resolver: Resolver,
}

/// 有序、只追加的命令缓冲区。
///
/// 插入顺序就是写入连接的顺序，也就是期望的回复顺序。缓冲区在第一次刷新时被封存，
/// 之后不能再追加命令。
///
/// 多个生产者可以并发入队。这里使用 `std::sync::Mutex`，因为持有锁期间没有任何
/// `.await`，临界区也很小。
#[derive(Debug, Default)]
pub(crate) struct CommandBuffer {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Queued>,
    sealed: bool,
}

impl CommandBuffer {
    pub(crate) fn new() -> CommandBuffer {
        CommandBuffer::default()
    }

    /// 追加一个命令并立即返回它的 `PendingResult`。不做任何 I/O。
    pub(crate) fn enqueue(&self, command: Command) -> Result<PendingResult, BatchError> {
        let mut state = self.state.lock().unwrap();

        if state.sealed {
            return Err(BatchError::AlreadyFlushed);
        }

        let (resolver, pending) = pending::pending();
        state.entries.push(Queued { command, resolver });

        Ok(pending)
    }

    /// 封存缓冲区并按入队顺序取出全部命令。只能调用一次。
    pub(crate) fn seal(&self) -> Result<Vec<Queued>, BatchError> {
        let mut state = self.state.lock().unwrap();

        if state.sealed {
            return Err(BatchError::AlreadyFlushed);
        }

        state.sealed = true;
        Ok(mem::take(&mut state.entries))
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

/// 用同一个错误写入所有槽位，并返回该错误，便于 `return Err(fail_all(..))`。
pub(crate) fn fail_all<I>(entries: I, err: BatchError) -> BatchError
where
    I: IntoIterator<Item = Queued>,
{
    for queued in entries {
        queued.resolver.resolve(Err(err.clone()));
    }

    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_preserves_insertion_order() {
        let buffer = CommandBuffer::new();
        let _a = buffer.enqueue(Command::new("GET").arg("a")).unwrap();
        let _b = buffer.enqueue(Command::new("GET").arg("b")).unwrap();
        assert_eq!(buffer.len(), 2);

        let names: Vec<_> = buffer
            .seal()
            .unwrap()
            .into_iter()
            .map(|q| q.command.to_string())
            .collect();

        assert_eq!(names, vec!["GET a", "GET b"]);
    }

    #[test]
    fn sealed_buffer_rejects_enqueue_and_reseal() {
        let buffer = CommandBuffer::new();
        buffer.seal().unwrap();

        assert_eq!(
            buffer.enqueue(Command::new("PING")).unwrap_err(),
            BatchError::AlreadyFlushed
        );
        assert_eq!(buffer.seal().unwrap_err(), BatchError::AlreadyFlushed);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_slot() {
        let buffer = CommandBuffer::new();
        let a = buffer.enqueue(Command::new("PING")).unwrap();
        let b = buffer.enqueue(Command::new("PING")).unwrap();

        let err = fail_all(buffer.seal().unwrap(), BatchError::TransactionAborted);

        assert_eq!(err, BatchError::TransactionAborted);
        assert_eq!(a.await, Err(BatchError::TransactionAborted));
        assert_eq!(b.await, Err(BatchError::TransactionAborted));
    }
}
