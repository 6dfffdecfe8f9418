use crate::Frame;

use bytes::Bytes;
use std::fmt;

/// 发送给服务器的单个命令：命令名加上有序的参数列表。
///
/// 命令一旦构建完成就不再改变。发送时被编码为由字符串块组成的数组帧。
///
/// ```
/// use mini_redis_batch::Command;
///
/// let cmd = Command::new("SET").arg("greeting").arg("hello");
/// assert_eq!(cmd.name(), "SET");
/// assert_eq!(cmd.args().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    /// 创建一个没有参数的命令。
    pub fn new(name: impl Into<String>) -> Command {
        Command {
            name: name.into(),
            args: vec![],
        }
    }

    /// 追加一个参数。参数是二进制安全的。
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Command {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// 将一行文本按空白拆分为命令，例如 `"SET key value"`。
    ///
    /// 空行返回 `None`。
    pub fn parse_line(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;

        Some(parts.fold(Command::new(name), |cmd, part| cmd.arg(part)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// 将命令转换为要写入连接的数组帧。
    pub(crate) fn to_frame(&self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::copy_from_slice(self.name.as_bytes()));

        for arg in &self.args {
            frame.push_bulk(arg.clone());
        }

        frame
    }

    pub(crate) fn multi() -> Command {
        Command::new("MULTI")
    }

    pub(crate) fn exec() -> Command {
        Command::new("EXEC")
    }

    pub(crate) fn watch<I, K>(keys: I) -> Command
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        keys.into_iter()
            .fold(Command::new("WATCH"), |cmd, key| cmd.arg(key))
    }

    pub(crate) fn unwatch() -> Command {
        Command::new("UNWATCH")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.name)?;

        for arg in &self.args {
            write!(fmt, " {}", String::from_utf8_lossy(arg))?;
        }

        Ok(())
    }
}
