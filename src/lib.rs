//! 在单条 Redis 协议连接之上的命令流水线与事务协调。
//!
//! 调用者可以连续地把命令加入一个批次而不必等待每个回复，然后一次性发送整个批次，
//! 每个回复都会按顺序交还给发出对应命令的调用者。批次也可以用 `MULTI`/`EXEC`
//! 包装为一个原子事务。
//!
//! # 布局
//!
//! 主要组件有：
//!
//! * `client`：共享连接的句柄。保证同一时刻只有一个流水线或事务在使用连接。
//!
//! * `pipeline`：一批相互独立的命令，作为一次突发写入发送，按顺序核对回复。
//!
//! * `transaction`：用 `MULTI`/`EXEC` 包装的流水线，逐个核对服务器的 `QUEUED` 确认。
//!
//! * `cmd`：发送给服务器的单个命令。
//!
//! * `frame`：表示单个 Redis 协议帧，以及帧与字节之间的转换。
//!
//! * `connection`：在字节流上读写帧，实现协调器所需的 `Transport`。
//!
//! ```no_run
//! use mini_redis_batch::{Client, Command};
//!
//! #[tokio::main]
//! async fn main() -> mini_redis_batch::Result<()> {
//!     let client = Client::connect("127.0.0.1:6379").await?;
//!
//!     let pipeline = client.pipeline();
//!     let counter = pipeline.enqueue(Command::new("INCR").arg("counter"))?;
//!     pipeline.enqueue(Command::new("SET").arg("greeting").arg("hello"))?;
//!     pipeline.execute(false).await?;
//!
//!     println!("counter = {}", counter.await?);
//!     Ok(())
//! }
//! ```

mod buffer;

mod client;
pub use client::Client;

pub mod cmd;
pub use cmd::Command;

mod connection;
pub use connection::Connection;

mod error;
pub use error::{BatchError, Failure};

pub mod frame;
pub use frame::Frame;

mod pending;
pub use pending::{PendingResult, Reply};

mod pipeline;
pub use pipeline::Pipeline;

mod sink;
pub use sink::CommandSink;

mod transaction;
pub use transaction::Transaction;

mod transport;
pub use transport::Transport;

/// Redis 服务器监听的默认端口。
pub const DEFAULT_PORT: u16 = 6379;

/// 连接层函数返回的错误类型。
///
/// 帧解析和套接字 I/O 的错误被装箱为 `std::error::Error`。协调器对外只暴露
/// `BatchError`，`Transport` 实现负责完成两者之间的映射。
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// 用于连接层操作的专用 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
