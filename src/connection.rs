use crate::frame::{self, Frame};
use crate::transport::Transport;
use crate::{BatchError, Command};

use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time;
use tracing::warn;

/// 在底层字节流上发送和接收 `Frame` 值。
///
/// 要读取帧，`Connection` 使用内部缓冲区，该缓冲区被填充直到有足够的字节来创建完整的帧为止。
///
/// 写入的帧先被编码到写缓冲区中，直到调用 `flush` 才真正写入套接字。这样流水线中的一批命令
/// 只需要一次刷新。
///
/// 在生产环境中 `S` 是 `TcpStream`，测试中可以是任意内存中的双工流。
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    // 带写缓冲的流。
    stream: BufWriter<S>,

    // 用于读取帧的缓冲区。
    buffer: BytesMut,

    // 对等方关闭了连接，或者读写失败。
    closed: bool,

    // 等待单个回复的最长时间。`None` 表示一直等待。
    read_timeout: Option<Duration>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 创建一个新的 `Connection`，由 `socket` 支持。初始化读取和写入缓冲区。
    pub fn new(socket: S) -> Connection<S> {
        Connection {
            stream: BufWriter::new(socket),
            // 默认使用 4KB 读取缓冲区。
            buffer: BytesMut::with_capacity(4 * 1024),
            closed: false,
            read_timeout: None,
        }
    }

    /// 设置等待回复的超时时间。超时被视为连接丢失。
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// 从底层流中读取单个 `Frame` 值。
    ///
    /// 该函数等待直到它已检索足够的数据来解析一帧。解析后剩余的数据保留在读缓冲区中，
    /// 供下一次调用使用。
    ///
    /// # 返回
    ///
    /// 成功时，返回接收到的帧。如果流在帧边界处关闭，则返回 `None`。否则，返回错误。
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            // 尝试从缓冲数据中解析一个帧。
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // 缓冲区中没有足够的数据来读取帧。从套接字读取更多数据，`0` 表示“流结束”。
            let read = self.stream.read_buf(&mut self.buffer);
            let n = match self.read_timeout {
                Some(limit) => time::timeout(limit, read).await??,
                None => read.await?,
            };

            if n == 0 {
                // 读缓冲区中仍有数据，说明对等体在发送帧时关闭了套接字。
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err("connection reset by peer".into());
                }
            }
        }
    }

    /// 尝试从缓冲区解析帧。如果尚未缓冲足够的数据，则返回 `Ok(None)`。
    /// 如果缓冲的数据不表示有效的帧，则返回 `Err`。
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        // 先检查是否缓冲了完整的帧，这比完整解析快得多。
        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;
                buf.set_position(0);

                let frame = Frame::parse(&mut buf)?;

                // 从读缓冲区中丢弃已解析的数据。
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            // 数据不足是预期的运行时条件，需要等待更多数据。
            Err(Incomplete) => Ok(None),
            // 帧编码无效，连接处于无效状态。
            Err(e) => Err(e.into()),
        }
    }

    /// 将单个 `Frame` 写入写缓冲区。调用 `flush` 后才会写入套接字。
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await
    }

    /// 将写缓冲区的剩余内容写入套接字。
    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    /// 对等方已关闭连接，或者之前的读写已经失败。
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn lost(&mut self, cause: &dyn std::fmt::Display) -> BatchError {
        if !self.closed {
            warn!(%cause, "connection lost");
        }

        self.closed = true;
        BatchError::ConnectionLost
    }
}

impl<S> Transport for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, cmd: &Command) -> Result<(), BatchError> {
        if self.closed {
            return Err(BatchError::ConnectionLost);
        }

        let frame = cmd.to_frame();
        match self.write_frame(&frame).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.lost(&err)),
        }
    }

    async fn flush(&mut self) -> Result<(), BatchError> {
        if self.closed {
            return Err(BatchError::ConnectionLost);
        }

        match Connection::flush(self).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.lost(&err)),
        }
    }

    async fn next_reply(&mut self) -> Result<Frame, BatchError> {
        if self.closed {
            return Err(BatchError::ConnectionLost);
        }

        match self.read_frame().await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(self.lost(&"closed by peer")),
            // 帧格式错误意味着无法再确定后续回复的边界。
            Err(err) if err.is::<frame::Error>() => Err(BatchError::ProtocolDesync(err.to_string())),
            Err(err) => Err(self.lost(&err)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
