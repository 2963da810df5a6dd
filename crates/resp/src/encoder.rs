//! RESP protocol encoder

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::RespValue;

/// Append the wire form of `value` to `buf`
pub fn encode(value: &RespValue, buf: &mut BytesMut) {
    match value {
        RespValue::SimpleString(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        RespValue::Error(e) => {
            buf.put_u8(b'-');
            buf.put_slice(e);
            buf.put_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            buf.put_slice(format!(":{}\r\n", i).as_bytes());
        }
        RespValue::BulkString(Some(bytes)) => {
            buf.put_slice(format!("${}\r\n", bytes.len()).as_bytes());
            buf.put_slice(bytes);
            buf.put_slice(b"\r\n");
        }
        RespValue::BulkString(None) | RespValue::Null => {
            buf.put_slice(b"$-1\r\n");
        }
        RespValue::Array(items) => {
            buf.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode(item, buf);
            }
        }
    }
}

/// Encode into a fresh byte vector
pub fn encode_to_vec(value: &RespValue) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode(value, &mut buf);
    buf.to_vec()
}

/// Encode and write a whole frame, then flush
pub async fn write_value<W>(writer: &mut W, value: &RespValue) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode(value, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await
}
