//! The debug-bridge "smart socket" wire protocol: a 4-ASCII-hex-digit
//! length prefix followed by the payload, `OKAY`/`FAIL` status words.
use crate::error::BridgeError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub async fn send_request(stream: &mut TcpStream, payload: &str) -> Result<(), BridgeError> {
    let header = format!("{:04x}", payload.len());
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(payload.as_bytes()).await?;
    Ok(())
}

pub async fn read_status(stream: &mut TcpStream) -> Result<bool, BridgeError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    match &buf {
        b"OKAY" => Ok(true),
        b"FAIL" => Ok(false),
        other => Err(BridgeError::Protocol(format!(
            "unexpected status word: {:?}",
            other
        ))),
    }
}

pub async fn read_length_prefixed(stream: &mut TcpStream) -> Result<String, BridgeError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len_str = std::str::from_utf8(&len_buf)
        .map_err(|e| BridgeError::Protocol(format!("non-utf8 length prefix: {e}")))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|e| BridgeError::Protocol(format!("invalid length prefix {len_str:?}: {e}")))?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    String::from_utf8(body).map_err(|e| BridgeError::Protocol(format!("non-utf8 body: {e}")))
}

pub async fn read_fail_message(stream: &mut TcpStream) -> Result<String, BridgeError> {
    read_length_prefixed(stream).await
}

/// Send a request and assert an `OKAY`; on `FAIL`, read and surface the
/// daemon's failure message as a protocol error.
pub async fn request_ok(stream: &mut TcpStream, payload: &str) -> Result<(), BridgeError> {
    send_request(stream, payload).await?;
    if read_status(stream).await? {
        Ok(())
    } else {
        let msg = read_fail_message(stream).await.unwrap_or_default();
        Err(BridgeError::Protocol(msg))
    }
}
