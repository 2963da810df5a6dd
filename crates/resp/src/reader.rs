//! RESP reply reader

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::{RespError, RespValue};

/// Default maximum size of a single reply: 64MB
pub const DEFAULT_MAX_REPLY_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on array element count accepted from a server
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Reads RESP replies from an async stream
pub struct ReplyReader<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    max_bytes: usize,
    bytes_read: usize,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, DEFAULT_MAX_REPLY_SIZE)
    }

    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
            bytes_read: 0,
        }
    }

    fn account(&mut self, additional: usize) -> Result<(), RespError> {
        self.bytes_read = self.bytes_read.saturating_add(additional);
        if self.bytes_read > self.max_bytes {
            Err(RespError::ReplyTooLarge(self.bytes_read, self.max_bytes))
        } else {
            Ok(())
        }
    }

    /// Read one complete reply
    pub async fn read_reply(&mut self) -> Result<RespValue, RespError> {
        self.bytes_read = 0;
        self.read_value().await
    }

    /// Read a header line without its CRLF terminator
    async fn read_line(&mut self) -> Result<Vec<u8>, RespError> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(RespError::UnexpectedEof);
        }
        self.account(n)?;
        if !line.ends_with(b"\r\n") {
            return Err(RespError::InvalidFormat("Line not terminated by CRLF".to_string()));
        }
        line.truncate(line.len() - 2);
        if line.is_empty() {
            return Err(RespError::InvalidFormat("Empty line".to_string()));
        }
        Ok(line)
    }

    async fn read_value(&mut self) -> Result<RespValue, RespError> {
        let line = self.read_line().await?;
        let payload = &line[1..];
        match line[0] {
            b'+' => Ok(RespValue::SimpleString(Bytes::copy_from_slice(payload))),
            b'-' => Ok(RespValue::Error(Bytes::copy_from_slice(payload))),
            b':' => Ok(RespValue::Integer(parse_int(payload)?)),
            b'$' => self.read_bulk(parse_int(payload)?).await,
            b'*' => self.read_array(parse_int(payload)?).await,
            other => Err(RespError::InvalidType(other)),
        }
    }

    async fn read_bulk(&mut self, len: i64) -> Result<RespValue, RespError> {
        if len == -1 {
            return Ok(RespValue::Null);
        }
        if len < 0 {
            return Err(RespError::InvalidFormat(format!("Invalid bulk length: {}", len)));
        }
        let len = len as usize;
        self.account(len + 2)?;

        let mut data = vec![0u8; len + 2];
        self.reader.read_exact(&mut data).await?;
        if &data[len..] != b"\r\n" {
            return Err(RespError::InvalidFormat(
                "Expected \\r\\n after bulk string".to_string(),
            ));
        }
        data.truncate(len);
        Ok(RespValue::BulkString(Some(Bytes::from(data))))
    }

    async fn read_array(&mut self, count: i64) -> Result<RespValue, RespError> {
        if count == -1 {
            return Ok(RespValue::Null);
        }
        if count < 0 || count as usize > MAX_ARRAY_LEN {
            return Err(RespError::InvalidFormat(format!("Invalid array length: {}", count)));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let item = Box::pin(async { self.read_value().await });
            items.push(item.await?);
        }
        Ok(RespValue::Array(items))
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RespError::InvalidFormat(format!(
                "Invalid integer: {}",
                String::from_utf8_lossy(digits)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_status_and_error() {
        let stream = Builder::new().read(b"+PONG\r\n-ERR not a cluster\r\n").build();
        let mut reader = ReplyReader::new(stream);
        assert_eq!(
            reader.read_reply().await.unwrap(),
            RespValue::SimpleString(Bytes::from("PONG"))
        );
        assert_eq!(
            reader.read_reply().await.unwrap(),
            RespValue::Error(Bytes::from("ERR not a cluster"))
        );
    }

    #[tokio::test]
    async fn test_read_bulk_with_crlf_inside() {
        // INFO replies carry CRLF inside the bulk payload
        let stream = Builder::new()
            .read(b"$21\r\n# Server\r\nredis:7.2\r\n\r\n")
            .build();
        let mut reader = ReplyReader::new(stream);
        let reply = reader.read_reply().await.unwrap();
        assert_eq!(reply.as_text().unwrap(), "# Server\r\nredis:7.2\r\n");
    }

    #[tokio::test]
    async fn test_read_cluster_slots_shape() {
        let stream = Builder::new()
            .read(b"*1\r\n*3\r\n:0\r\n:5460\r\n*2\r\n$9\r\n127.0.0.1\r\n:7000\r\n")
            .build();
        let mut reader = ReplyReader::new(stream);
        let reply = reader.read_reply().await.unwrap();
        let ranges = reply.into_array().unwrap();
        let range = ranges[0].clone().into_array().unwrap();
        assert_eq!(range[0].as_integer(), Some(0));
        assert_eq!(range[1].as_integer(), Some(5460));
        let master = range[2].clone().into_array().unwrap();
        assert_eq!(master[0].as_text().as_deref(), Some("127.0.0.1"));
        assert_eq!(master[1].as_integer(), Some(7000));
    }

    #[tokio::test]
    async fn test_null_bulk() {
        let stream = Builder::new().read(b"$-1\r\n").build();
        let mut reader = ReplyReader::new(stream);
        assert_eq!(reader.read_reply().await.unwrap(), RespValue::Null);
    }

    #[tokio::test]
    async fn test_reply_too_large() {
        let stream = Builder::new().read(b"$9999999\r\n").build();
        let mut reader = ReplyReader::with_max_bytes(stream, 1024);
        let result = reader.read_reply().await;
        assert!(matches!(result, Err(RespError::ReplyTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_eof() {
        let stream = Builder::new().build();
        let mut reader = ReplyReader::new(stream);
        assert!(matches!(reader.read_reply().await, Err(RespError::UnexpectedEof)));
    }
}
