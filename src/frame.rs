//! 提供表示Redis协议帧的类型以及在帧与字节之间转换的实用工具。
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// Redis协议中的帧。
///
/// 空字符串块（`$-1`）和空数组（`*-1`）都被解码为 `Null`。
/// 事务因 `WATCH` 冲突被放弃时，`EXEC` 返回的就是空数组。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Simple(String),    // 简单字符串
    Error(String),     // 错误
    Integer(i64),      // 整数，可以为负数
    Bulk(Bytes),       // 字符串块
    Null,              // 空值
    Array(Vec<Frame>), // 数组
}

#[derive(Debug)]
pub enum Error {
    /// 不足以解析消息的数据
    Incomplete,

    /// 无效的消息编码
    Other(crate::Error),
}

impl Frame {
    /// 返回一个空数组
    pub(crate) fn array() -> Frame {
        Frame::Array(vec![])
    }

    /// 将“bulk”帧推送到数组中。`self`必须是Array帧。
    ///
    /// # Panics
    ///
    /// 如果`self`不是数组，则会panic
    pub(crate) fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Bulk(bytes));
            }
            _ => panic!("not an array frame"), // 不是数组帧则panic
        }
    }

    /// 检查是否可以从`src`解码整个消息
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_signed(src)?;
                Ok(())
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    // 跳过'-1\r\n'
                    skip(src, 4)
                } else {
                    let len: usize = get_decimal(src)?.try_into()?;

                    // 跳过相应数量的字节 + 2 (\r\n)。
                    skip(src, bulk_span(len)?)
                }
            }
            b'*' => {
                if b'-' == peek_u8(src)? {
                    return skip(src, 4);
                }

                let len = get_decimal(src)?;

                for _ in 0..len {
                    Frame::check(src)?;
                }

                Ok(())
            }
            actual => Err(format!("protocol error; invalid frame type byte `{}`", actual).into()),
        }
    }

    /// 消息已经通过`check`验证。
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Simple(String::from_utf8(line)?))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Error(String::from_utf8(line)?))
            }
            b':' => Ok(Frame::Integer(get_signed(src)?)),
            b'$' => {
                if b'-' == peek_u8(src)? {
                    parse_null(src)
                } else {
                    let len = get_decimal(src)?.try_into()?;
                    let n = bulk_span(len)?;

                    if src.remaining() < n {
                        return Err(Error::Incomplete);
                    }

                    let data = Bytes::copy_from_slice(&src.chunk()[..len]);

                    // 跳过相应数量的字节 + 2 (\r\n)。
                    skip(src, n)?;

                    Ok(Frame::Bulk(data))
                }
            }
            b'*' => {
                if b'-' == peek_u8(src)? {
                    return parse_null(src);
                }

                let len = get_decimal(src)?.try_into()?;
                let mut out = Vec::with_capacity(len);

                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(out))
            }
            actual => Err(format!("protocol error; invalid frame type byte `{}`", actual).into()),
        }
    }

    /// 将帧编码到 `dst`。
    ///
    /// 编码是同步进行的，因此嵌套数组可以直接递归编码。
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(val) => {
                dst.put_u8(b'+');
                dst.put_slice(val.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(val) => {
                dst.put_u8(b'-');
                dst.put_slice(val.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(val) => {
                dst.put_u8(b':');
                dst.put_slice(val.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::Bulk(val) => {
                dst.put_u8(b'$');
                dst.put_slice(val.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(val);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(parts) => {
                dst.put_u8(b'*');
                dst.put_slice(parts.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for part in parts {
                    part.encode(dst);
                }
            }
        }
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "error: {}", msg),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null => "(nil)".fmt(fmt),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        // 使用空格作为数组元素的显示分隔符
                        write!(fmt, " ")?;
                    }

                    part.fmt(fmt)?;
                }

                Ok(())
            }
        }
    }
}

/// 解析 `-1\r\n`，类型字节已被消费
fn parse_null(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
    let line = get_line(src)?;

    if line != b"-1" {
        return Err("protocol error; invalid frame format".into());
    }

    Ok(Frame::Null)
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.chunk()[0])
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

/// 字符串块的数据长度加上结尾的 `\r\n`。长度来自对端，不能信任。
fn bulk_span(len: usize) -> Result<usize, Error> {
    len.checked_add(2)
        .ok_or_else(|| "protocol error; invalid frame format".into())
}

/// 读取以新行终止的十进制长度
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<u64>(line).ok_or_else(|| "protocol error; invalid frame format".into())
}

/// 读取以新行终止的有符号整数
fn get_signed(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<i64>(line).ok_or_else(|| "protocol error; invalid frame format".into())
}

/// 查找行
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    // 扫描到倒数第二个字节
    for i in start..end.saturating_sub(1) {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            // 我们找到一行，更新位置到\n之后
            src.set_position((i + 2) as u64);

            return Ok(&src.get_ref()[start..i]);
        }
    }

    Err(Error::Incomplete)
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_src: TryFromIntError) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(fmt),
            Error::Other(err) => err.fmt(fmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(src: &[u8]) -> Result<Frame, Error> {
        let mut buf = Cursor::new(src);
        Frame::check(&mut buf)?;
        buf.set_position(0);
        Frame::parse(&mut buf)
    }

    #[test]
    fn negative_integer() {
        assert_eq!(decode(b":-2\r\n").unwrap(), Frame::Integer(-2));
    }

    #[test]
    fn null_array_is_null() {
        assert_eq!(decode(b"*-1\r\n").unwrap(), Frame::Null);
        assert_eq!(decode(b"$-1\r\n").unwrap(), Frame::Null);
    }

    #[test]
    fn nested_array_encodes() {
        let frame = Frame::Array(vec![
            Frame::Simple("OK".into()),
            Frame::Array(vec![Frame::Integer(1), Frame::Null]),
        ]);

        let mut dst = BytesMut::new();
        frame.encode(&mut dst);

        assert_eq!(&dst[..], &b"*2\r\n+OK\r\n*2\r\n:1\r\n$-1\r\n"[..]);
        assert_eq!(decode(&dst).unwrap(), frame);
    }

    #[test]
    fn partial_bulk_is_incomplete() {
        assert!(matches!(decode(b"$5\r\nhel"), Err(Error::Incomplete)));
    }

    #[test]
    fn oversized_bulk_length_is_rejected() {
        assert!(matches!(
            decode(b"$18446744073709551615\r\n"),
            Err(Error::Other(_))
        ));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        assert!(matches!(decode(b"!oops\r\n"), Err(Error::Other(_))));
    }
}
