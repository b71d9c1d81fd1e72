//! Framed TCP read/write helpers shared by the IST sender and receiver.

use std::marker::Unpin;
use std::net::SocketAddr;

use bincode::{Decode, Encode};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::{self, Duration};

use crate::utils::SyncrepError;

/// Length prefix width of a stream frame: `u32` big-endian, matching the
/// integer byte order of the state request framing.
const FRAME_HDR: usize = 4;

/// Receives one length-prefixed object of type `T` from a readable stream,
/// using `read_buf` as storage for partial reads.
///
/// CANCELLATION SAFETY: this function is used as a `tokio::select!` branch
/// (the receiver races it against its interrupt signal), so it must not use
/// `read_u32()`/`read_exact()`, which lose buffered bytes when cancelled.
/// Bytes already read survive in `read_buf` across cancelled invocations
/// and are consumed only once the whole frame has arrived.
pub(crate) async fn framed_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, SyncrepError>
where
    T: DeserializeOwned + Decode<()>,
    Conn: AsyncReadExt + Unpin,
{
    // read frame length first
    while read_buf.len() < FRAME_HDR {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(SyncrepError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            )));
        }
    }
    let frame_len =
        u32::from_be_bytes(read_buf[..FRAME_HDR].try_into().unwrap());
    if frame_len > i32::MAX as u32 {
        return Err(SyncrepError::Invalid(format!(
            "frame length {} unrepresentable",
            frame_len
        )));
    }

    // then read the object itself
    let frame_end = FRAME_HDR + frame_len as usize;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(SyncrepError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            )));
        }
    }
    let (obj, obj_len) = bincode::decode_from_slice(
        &read_buf[FRAME_HDR..frame_end],
        bincode::config::standard(),
    )?;
    debug_assert_eq!(frame_len as usize, obj_len);

    // no awaits remain in this call; discard the bytes consumed by it
    if read_buf.len() > frame_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[frame_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends one length-prefixed object of type `T` to a writable stream. The
/// IST channel is one-directional while streaming, so a plain `write_all`
/// cannot deadlock against a writing peer here.
pub(crate) async fn framed_write<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), SyncrepError>
where
    T: Serialize + Encode,
    Conn: AsyncWriteExt + Unpin,
{
    let bytes = bincode::encode_to_vec(obj, bincode::config::standard())?;
    if bytes.len() > i32::MAX as usize {
        return Err(SyncrepError::MessageTooLong(bytes.len()));
    }
    conn_write.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    conn_write.write_all(&bytes).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
/// Zero retries means a bind failure is reported immediately.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, SyncrepError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(16) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;

    use serde::Deserialize;

    #[derive(
        Debug,
        PartialEq,
        Eq,
        Clone,
        Serialize,
        Deserialize,
        bincode::Encode,
        bincode::Decode,
    )]
    struct TestFrame {
        seqno: i64,
        body: Vec<u8>,
    }

    #[tokio::test]
    async fn frame_round_trip() -> Result<(), SyncrepError> {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = TestFrame {
            seqno: 42,
            body: vec![7; 10],
        };
        framed_write(&mut a, &sent).await?;
        let mut read_buf = BytesMut::new();
        let got: TestFrame = framed_read(&mut read_buf, &mut b).await?;
        assert_eq!(got, sent);
        assert!(read_buf.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn frames_back_to_back() -> Result<(), SyncrepError> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        for s in 0..3i64 {
            let f = TestFrame {
                seqno: s,
                body: vec![s as u8; 4],
            };
            framed_write(&mut a, &f).await?;
        }
        let mut read_buf = BytesMut::new();
        for s in 0..3i64 {
            let got: TestFrame = framed_read(&mut read_buf, &mut b).await?;
            assert_eq!(got.seqno, s);
        }
        Ok(())
    }

    #[tokio::test]
    async fn eof_mid_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap(); // 5 bytes short
        drop(a);
        let mut read_buf = BytesMut::new();
        let got: Result<TestFrame, _> =
            framed_read(&mut read_buf, &mut b).await;
        assert!(got.is_err());
    }
}
