use anyhow::{Context, Result, bail};
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest string that fits behind a 2-byte length prefix.
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

const TRANSFER_CHUNK: usize = 64 * 1024;

pub async fn write_utf<W>(writer: &mut W, value: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    if bytes.len() > MAX_UTF_LEN {
        bail!(
            "string of {} bytes exceeds the {} byte frame limit",
            bytes.len(),
            MAX_UTF_LEN
        );
    }
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_utf<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await?;
    read_utf_body(reader, len).await
}

async fn read_utf_body<R>(reader: &mut R, len: u16) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).context("framed string is not valid UTF-8")
}

/// Reads the next command string of a command loop.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before sending
/// anything, which is how clients end a session.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u16().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    read_utf_body(reader, len).await.map(Some)
}

pub async fn write_long<W>(writer: &mut W, value: i64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i64(value).await?;
    Ok(())
}

pub async fn read_long<R>(reader: &mut R) -> Result<i64>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_i64().await?)
}

/// Reads a declared payload length. Negative lengths are a protocol violation.
pub async fn read_size<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let size = read_long(reader).await?;
    u64::try_from(size).map_err(|_| anyhow::anyhow!("negative payload length {}", size))
}

pub async fn write_size<W>(writer: &mut W, size: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let size = i64::try_from(size).context("payload length does not fit in a long")?;
    write_long(writer, size).await
}

pub async fn write_int<W>(writer: &mut W, value: i32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i32(value).await?;
    Ok(())
}

pub async fn read_int<R>(reader: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_i32().await?)
}

/// Frames a single string into a UDP datagram.
pub fn encode_datagram(value: &str) -> Result<Vec<u8>> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_UTF_LEN {
        bail!("datagram string of {} bytes is too long", bytes.len());
    }
    let mut buf = Vec::with_capacity(bytes.len() + 2);
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(buf)
}

/// Extracts the single framed string of a UDP datagram. Trailing bytes are ignored.
pub fn decode_datagram(buf: &[u8]) -> Result<String> {
    if buf.len() < 2 {
        bail!("datagram of {} bytes has no length prefix", buf.len());
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let body = buf
        .get(2..2 + len)
        .ok_or_else(|| anyhow::anyhow!("datagram declares {} bytes but carries {}", len, buf.len() - 2))?;
    String::from_utf8(body.to_vec()).context("datagram string is not valid UTF-8")
}

/// Bounds one protocol step by `limit`.
pub async fn with_deadline<T, E, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<anyhow::Error>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => bail!("timed out after {:?}", limit),
    }
}

/// Moves exactly `len` bytes from `reader` to `writer`.
///
/// Each individual read or write must make progress within `idle`, so a stalled
/// peer cannot hold the transfer forever. Bytes after the first `len` are left
/// unread on `reader`.
pub async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64, idle: Duration) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TRANSFER_CHUNK.min(len as usize).max(1)];
    let mut remaining = len;

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let read = with_deadline(idle, reader.read(&mut buf[..want])).await?;
        if read == 0 {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("stream ended after {} of {} bytes", len - remaining, len),
            )
            .into());
        }
        with_deadline(idle, writer.write_all(&buf[..read])).await?;
        remaining -= read as u64;
    }

    with_deadline(idle, writer.flush()).await?;
    Ok(len)
}
