use crate::transport::{self, Transport};
use crate::{BatchError, Command, CommandSink, Connection, Frame, Pipeline, Transaction};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::debug;

/// 单条逻辑连接的共享句柄。
///
/// 克隆 `Client` 是浅层的，所有克隆共享同一个连接。连接被一个 Tokio 互斥锁保护：
/// 协调器从第一次写入一直持有锁到读完最后一个回复，因此不同流水线或事务的命令
/// 在线路上永远不会交错。等待中的协调器按照到达顺序依次获得连接。
///
/// 这里使用 Tokio 互斥锁而不是 `std::sync::Mutex`，因为锁需要跨越 `.await` 持有。
pub struct Client<T = Connection> {
    conn: Arc<Mutex<T>>,
}

impl Client<Connection> {
    /// 与位于 `addr` 的 Redis 服务器建立连接。
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use mini_redis_batch::Client;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = match Client::connect("localhost:6379").await {
    ///         Ok(client) => client,
    ///         Err(_) => panic!("failed to establish connection"),
    ///     };
    /// # drop(client);
    /// }
    /// ```
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> crate::Result<Client> {
        Client::connect_with_timeout(addr, None).await
    }

    /// 与 `connect` 相同，但为每个回复设置读取超时。
    pub async fn connect_with_timeout<A: ToSocketAddrs>(
        addr: A,
        read_timeout: Option<Duration>,
    ) -> crate::Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;

        let mut connection = Connection::new(socket);
        connection.set_read_timeout(read_timeout);

        Ok(Client::new(connection))
    }
}

impl<T: Transport> Client<T> {
    /// 将已经建立好的连接包装为共享句柄。
    pub fn new(transport: T) -> Client<T> {
        Client {
            conn: Arc::new(Mutex::new(transport)),
        }
    }

    /// 立即执行单个命令并返回它的回复。
    ///
    /// 如果有流水线或事务正在刷新，会先等待它完成。命令一旦开始执行，放弃这个
    /// future 不会让它的回复残留在连接上。
    pub async fn execute(&self, cmd: Command) -> Result<Frame, BatchError> {
        debug!(%cmd, "execute");
        transport::exclusive_round_trip(self.conn.clone(), cmd).await
    }

    /// 创建一个共享此连接的流水线。
    pub fn pipeline(&self) -> Pipeline<T> {
        Pipeline::new(self.conn.clone())
    }

    /// 创建一个共享此连接的事务。
    pub fn transaction(&self) -> Transaction<T> {
        Transaction::new(self.conn.clone())
    }

    /// 连接是否已经关闭。如果协调器正在使用连接，会等待它完成。
    pub async fn is_closed(&self) -> bool {
        self.conn.lock().await.is_closed()
    }
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Client<T> {
        Client {
            conn: self.conn.clone(),
        }
    }
}

impl<T> fmt::Debug for Client<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Client").finish_non_exhaustive()
    }
}

impl<T: Transport> CommandSink for Client<T> {
    type Output = Frame;

    fn submit(&self, cmd: Command) -> impl std::future::Future<Output = Result<Frame, BatchError>> + Send {
        self.execute(cmd)
    }
}
