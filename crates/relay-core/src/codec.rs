//! Length-prefixed CBOR framing shared by peer sessions and the tunnel.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{RelayError, RelayResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling for a single frame (10 MiB plus header slack).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024 + 512;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> RelayResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = u32::try_from(payload.len()).map_err(|_| RelayError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Encode a value as bare CBOR, without a length prefix.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> RelayResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> RelayResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Write one framed value and flush.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed value.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// Frames whose declared length exceeds `max_len` are refused before the
/// payload is read.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> RelayResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(RelayError::FrameTooLarge { size: len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let frame = frame_encode(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        let decoded: TestMsg = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn stream_of_frames_then_clean_eof() {
        let msgs = vec![
            TestMsg {
                name: "a".into(),
                value: 1,
            },
            TestMsg {
                name: "b".into(),
                value: 2,
            },
        ];

        let (mut client, mut server) = tokio::io::duplex(1024);
        for m in &msgs {
            write_frame(&mut client, m).await.unwrap();
        }
        drop(client);

        let mut decoded = Vec::new();
        while let Some(m) = read_frame::<_, TestMsg>(&mut server, 1024).await.unwrap() {
            decoded.push(m);
        }
        assert_eq!(decoded, msgs);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let msg = TestMsg {
            name: "x".repeat(256),
            value: 0,
        };
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &msg).await.unwrap();

        let err = read_frame::<_, TestMsg>(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, RelayError::FrameTooLarge { max: 64, .. }));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let frame = frame_encode(&TestMsg {
            name: "partial".into(),
            value: 7,
        })
        .unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(client);

        assert!(read_frame::<_, TestMsg>(&mut server, 1024).await.is_err());
    }
}
