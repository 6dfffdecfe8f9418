use std::fmt;

/// 流水线或事务执行过程中可能出现的错误。
///
/// 这个错误既会写入各个命令的 `PendingResult`，也会作为 `execute()` 本身的失败原因返回。
/// 同一个致命错误需要分发给多个槽位，因此该类型实现了 `Clone`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchError {
    /// 命令缓冲区已经被刷新，不能再追加命令。
    AlreadyFlushed,

    /// `execute()` 只能调用一次。
    AlreadyExecuted,

    /// 服务器对单个命令返回了错误回复。只影响这一个命令。
    Command(String),

    /// 在收到回复之前连接已关闭、发生 I/O 错误或读取超时。
    ConnectionLost,

    /// 事务被服务器放弃：被 `WATCH` 的键发生了变化，或者排队阶段出现了错误。
    /// 没有任何命令被执行。
    TransactionAborted,

    /// 回复的数量或帧格式与预期不符。连接已不可信，需要由调用者回收。
    ProtocolDesync(String),

    /// 命令没有被服务器接受进事务队列。
    UnexpectedQueueAck(String),

    /// 汇总的失败集合，按命令下标排序，包含每一个失败的命令。
    Failed(Vec<Failure>),
}

/// 批次中某一个命令的失败。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// 命令在批次中的位置，从 0 开始。
    pub index: usize,

    /// 该命令的错误。
    pub error: BatchError,
}

impl BatchError {
    /// 返回汇总错误中所有失败命令的下标。其他错误返回空列表。
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            BatchError::Failed(failures) => failures.iter().map(|f| f.index).collect(),
            _ => vec![],
        }
    }

    /// 连接级或协议级的错误，会终止整个协调器。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BatchError::ConnectionLost | BatchError::ProtocolDesync(_)
        )
    }
}

impl std::error::Error for BatchError {}

impl fmt::Display for BatchError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::AlreadyFlushed => "command buffer already flushed".fmt(fmt),
            BatchError::AlreadyExecuted => "batch already executed".fmt(fmt),
            BatchError::Command(msg) => write!(fmt, "command failed: {}", msg),
            BatchError::ConnectionLost => "connection lost before reply".fmt(fmt),
            BatchError::TransactionAborted => "transaction aborted".fmt(fmt),
            BatchError::ProtocolDesync(detail) => write!(fmt, "protocol desync; {}", detail),
            BatchError::UnexpectedQueueAck(msg) => {
                write!(fmt, "command not queued by server: {}", msg)
            }
            BatchError::Failed(failures) => {
                write!(fmt, "{} command(s) failed", failures.len())?;

                for failure in failures {
                    write!(fmt, "; [{}] {}", failure.index, failure.error)?;
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_failure() {
        let err = BatchError::Failed(vec![
            Failure {
                index: 1,
                error: BatchError::Command("ERR wrong type".into()),
            },
            Failure {
                index: 3,
                error: BatchError::Command("ERR not an integer".into()),
            },
        ]);

        assert_eq!(err.failed_indices(), vec![1, 3]);
        assert_eq!(
            err.to_string(),
            "2 command(s) failed; [1] command failed: ERR wrong type; [3] command failed: ERR not an integer"
        );
    }
}
