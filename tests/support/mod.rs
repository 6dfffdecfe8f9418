//! 在内存双工管道上说 RESP 协议的进程内 Redis 替身。
//!
//! 支持的命令足以测试流水线和事务（`GET`、`SET`、`INCR`、`DEL`、`PING`、`MULTI`、
//! `EXEC`、`DISCARD`、`WATCH`、`UNWATCH`），并可以注入若干故障。
#![allow(dead_code)]

use mini_redis_batch::{Client, Connection, Frame};

use bytes::Bytes;
use std::collections::HashMap;
use std::future::{self, Future};
use std::mem;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;
use tokio::io::DuplexStream;

pub type TestClient = Client<Connection<DuplexStream>>;

/// 注入到服务器中的异常行为。
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// 写出这么多个回复之后关闭连接。
    pub close_after: Option<usize>,
    /// 去掉每个 `EXEC` 数组的最后一项。
    pub truncate_exec: bool,
    /// 用 `+OK` 而不是 `+QUEUED` 确认排队的命令。
    pub ack_with_ok: bool,
    /// 在下标为此值（从 0 开始）的回复之后紧跟一个格式错误的帧。
    pub garbage_after: Option<usize>,
    /// 读取命令但从不回复。
    pub silent: bool,
}

/// 服务器端的句柄：共享的键空间和线路记录。
#[derive(Clone, Debug, Default)]
pub struct Server {
    db: Arc<Mutex<Db>>,
    trace: Arc<Mutex<Vec<String>>>,
}

#[derive(Debug, Default)]
struct Db {
    entries: HashMap<String, Bytes>,
    // 每次写入都递增，`WATCH` 用它来比较。
    versions: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Session {
    queue: Option<Vec<Vec<String>>>,
    dirty: bool,
    watched: HashMap<String, u64>,
}

pub fn start() -> (TestClient, Server) {
    start_with(Faults::default())
}

pub fn start_with(faults: Faults) -> (TestClient, Server) {
    connect(faults, None)
}

/// 与 `start_with` 相同，但客户端一侧设置了读取超时。
pub fn start_with_timeout(faults: Faults, timeout: Duration) -> (TestClient, Server) {
    connect(faults, Some(timeout))
}

fn connect(faults: Faults, read_timeout: Option<Duration>) -> (TestClient, Server) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = Server::default();

    tokio::spawn(serve(Connection::new(server_io), server.clone(), faults));

    let mut conn = Connection::new(client_io);
    conn.set_read_timeout(read_timeout);

    (Client::new(conn), server)
}

/// 只轮询 `fut` 一次就丢弃它，模拟调用者中途放弃等待。返回它当时是否已经完成。
pub async fn abandon_after_first_poll<F: Future>(fut: F) -> bool {
    let mut fut = Box::pin(fut);
    future::poll_fn(|cx| Poll::Ready(fut.as_mut().poll(cx).is_ready())).await
}

impl Server {
    /// 按线路顺序收到的每个命令，格式为 `"NAME arg arg"`。
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    /// 模拟另一个客户端的写入。
    pub fn touch(&self, key: &str, value: &str) {
        self.db
            .lock()
            .unwrap()
            .write(key, Some(Bytes::copy_from_slice(value.as_bytes())));
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.db.lock().unwrap().entries.get(key).cloned()
    }

    fn run(&self, args: &[String]) -> Frame {
        let mut db = self.db.lock().unwrap();
        let name = args[0].to_ascii_uppercase();

        match (name.as_str(), args.len()) {
            ("PING", 1) => Frame::Simple("PONG".into()),
            ("GET", 2) => match db.entries.get(&args[1]) {
                Some(value) => Frame::Bulk(value.clone()),
                None => Frame::Null,
            },
            ("SET", 3) => {
                db.write(&args[1], Some(Bytes::copy_from_slice(args[2].as_bytes())));
                ok()
            }
            ("DEL", 2) => {
                let existed = db.entries.contains_key(&args[1]);
                db.write(&args[1], None);
                Frame::Integer(existed as i64)
            }
            ("INCR", 2) => {
                let current = match db.entries.get(&args[1]) {
                    Some(value) => match std::str::from_utf8(value).ok().and_then(|s| s.parse::<i64>().ok()) {
                        Some(n) => n,
                        None => return error("ERR value is not an integer or out of range"),
                    },
                    None => 0,
                };
                let next = current + 1;
                db.write(&args[1], Some(Bytes::from(next.to_string())));
                Frame::Integer(next)
            }
            (known, _) if is_known(known) => error(&format!(
                "ERR wrong number of arguments for '{}' command",
                known.to_ascii_lowercase()
            )),
            _ => error(&format!("ERR unknown command '{}'", args[0])),
        }
    }

    fn version(&self, key: &str) -> u64 {
        self.db.lock().unwrap().versions.get(key).copied().unwrap_or(0)
    }
}

impl Db {
    fn write(&mut self, key: &str, value: Option<Bytes>) {
        match value {
            Some(value) => self.entries.insert(key.to_string(), value),
            None => self.entries.remove(key),
        };
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }
}

impl Session {
    fn apply(&mut self, server: &Server, faults: &Faults, args: Vec<String>) -> Frame {
        let name = args[0].to_ascii_uppercase();

        match name.as_str() {
            "MULTI" => {
                if self.queue.is_some() {
                    return error("ERR MULTI calls can not be nested");
                }
                self.queue = Some(vec![]);
                ok()
            }
            "EXEC" => {
                let queued = match self.queue.take() {
                    Some(queued) => queued,
                    None => return error("ERR EXEC without MULTI"),
                };
                let dirty = mem::take(&mut self.dirty);
                let watched = mem::take(&mut self.watched);

                if dirty {
                    return error("EXECABORT Transaction discarded because of previous errors.");
                }

                if watched
                    .iter()
                    .any(|(key, version)| server.version(key) != *version)
                {
                    return Frame::Null;
                }

                let mut replies: Vec<Frame> = queued.iter().map(|cmd| server.run(cmd)).collect();
                if faults.truncate_exec {
                    replies.pop();
                }
                Frame::Array(replies)
            }
            "DISCARD" => {
                if self.queue.take().is_none() {
                    return error("ERR DISCARD without MULTI");
                }
                self.dirty = false;
                self.watched.clear();
                ok()
            }
            "WATCH" => {
                if self.queue.is_some() {
                    return error("ERR WATCH inside MULTI is not allowed");
                }
                if args.len() < 2 {
                    return error("ERR wrong number of arguments for 'watch' command");
                }
                for key in &args[1..] {
                    self.watched.insert(key.clone(), server.version(key));
                }
                ok()
            }
            "UNWATCH" => {
                self.watched.clear();
                ok()
            }
            _ => match &mut self.queue {
                Some(queue) if is_known(&name) => {
                    queue.push(args);
                    if faults.ack_with_ok {
                        ok()
                    } else {
                        Frame::Simple("QUEUED".into())
                    }
                }
                Some(_) => {
                    self.dirty = true;
                    error(&format!("ERR unknown command '{}'", args[0]))
                }
                None => server.run(&args),
            },
        }
    }
}

async fn serve(mut conn: Connection<DuplexStream>, server: Server, faults: Faults) {
    let mut session = Session::default();
    let mut sent = 0;

    while let Ok(Some(frame)) = conn.read_frame().await {
        let args = match to_args(frame) {
            Some(args) => args,
            None => return,
        };

        server.trace.lock().unwrap().push(args.join(" "));

        if faults.silent {
            continue;
        }

        let mut reply = session.apply(&server, &faults, args);

        // 回复本身保持完整，紧随其后的字节无法解析。
        if faults.garbage_after == Some(sent) {
            if let Frame::Simple(text) = &mut reply {
                text.push_str("\r\n!garbage");
            }
        }

        if conn.write_frame(&reply).await.is_err() || conn.flush().await.is_err() {
            return;
        }

        sent += 1;

        if faults.close_after == Some(sent) {
            return;
        }
    }
}

fn to_args(frame: Frame) -> Option<Vec<String>> {
    match frame {
        Frame::Array(parts) if !parts.is_empty() => parts
            .into_iter()
            .map(|part| match part {
                Frame::Bulk(data) => Some(String::from_utf8_lossy(&data).into_owned()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn is_known(name: &str) -> bool {
    matches!(name, "PING" | "GET" | "SET" | "DEL" | "INCR")
}

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

fn error(msg: &str) -> Frame {
    Frame::Error(msg.into())
}
