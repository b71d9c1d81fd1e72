//! IST channel message framing and the plain/TLS stream wrapper.

use std::pin::Pin;
use std::task::{Context, Poll};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

use crate::base::{Seqno, Writeset};

/// Messages exchanged on the IST channel. The stream opens with a
/// `Handshake`/`HandshakeAck` version exchange, then carries `Trx` frames
/// in strict seqno order, closed by an `Eof` marker.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Encode, Decode)]
pub(crate) enum IstMsg {
    /// Sender opens with its negotiated protocol version.
    Handshake { version: u32 },

    /// Receiver answers with its own version; inequality aborts both ends.
    HandshakeAck { version: u32 },

    /// One cached writeset.
    Trx(Writeset),

    /// End-of-stream marker carrying the last seqno served.
    Eof { last: Seqno },
}

/// The IST transport stream: bare TCP or TLS-wrapped TCP, selected by the
/// `ist_ssl` configuration key.
pub(crate) enum IstStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for IstStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IstStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IstStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IstStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IstStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IstStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IstStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IstStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IstStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IstStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod wire_tests {
    use super::*;

    #[test]
    fn messages_encode_decode() {
        let msgs = vec![
            IstMsg::Handshake { version: 1 },
            IstMsg::HandshakeAck { version: 1 },
            IstMsg::Trx(Writeset {
                seqno: 101,
                depends_seqno: 100,
                payload: vec![0xab; 16],
            }),
            IstMsg::Eof { last: 105 },
        ];
        for msg in msgs {
            let bytes =
                bincode::encode_to_vec(&msg, bincode::config::standard())
                    .unwrap();
            let (back, _): (IstMsg, usize) = bincode::decode_from_slice(
                &bytes,
                bincode::config::standard(),
            )
            .unwrap();
            assert_eq!(back, msg);
        }
    }
}
