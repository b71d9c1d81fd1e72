//! IST sender: streams a contiguous seqno range out of the writeset cache
//! to a joiner's receiver.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;

use crate::base::{Seqno, SEQNO_ILL};
use crate::iface::WritesetCache;
use crate::ist::tls;
use crate::ist::wire::{IstMsg, IstStream};
use crate::ist::IstConfig;
use crate::utils::{framed_read, framed_write};
use crate::utils::SyncrepError;

/// Donor-side IST transmission endpoint. One sender serves one transfer;
/// there are no retries at this layer, any mid-stream error is left for
/// the receiver to report to its joiner.
pub struct Sender {
    conf: IstConfig,
    gcache: Arc<dyn WritesetCache>,
    peer: String,
    version: u32,

    /// Cancellation flag observed by the streaming loop.
    cancel_tx: watch::Sender<bool>,

    /// Highest seqno successfully written to the socket.
    progress: AtomicI64,
}

impl Sender {
    pub fn new(
        conf: IstConfig,
        gcache: Arc<dyn WritesetCache>,
        peer: &str,
        version: u32,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Sender {
            conf,
            gcache,
            peer: peer.to_string(),
            version,
            cancel_tx,
            progress: AtomicI64::new(SEQNO_ILL),
        }
    }

    /// Abort the stream out-of-band: the sending task's pending socket
    /// operation is abandoned and `send()` returns `Cancelled`. Idempotent
    /// and callable from any task.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Highest seqno written so far, `SEQNO_ILL` before the first one.
    pub fn progress(&self) -> Seqno {
        self.progress.load(Ordering::Acquire)
    }

    /// Stream writesets `[first, last]` inclusive to the peer, then send
    /// the end-of-stream marker and wait for the peer's clean close.
    pub async fn send(
        &self,
        first: Seqno,
        last: Seqno,
    ) -> Result<(), SyncrepError> {
        let mut cancel_rx = self.cancel_tx.subscribe();

        // single connection attempt
        let tcp = tokio::select! {
            conn = TcpStream::connect(&self.peer) => conn.map_err(|e| {
                SyncrepError::Connect(self.peer.clone(), e)
            })?,
            _ = cancel_rx.wait_for(|c| *c) => {
                return Err(SyncrepError::Cancelled);
            }
        };
        tcp.set_nodelay(true)?;
        let mut stream = if self.conf.ssl {
            let connector =
                TlsConnector::from(tls::client_config(&self.conf.ssl_ca)?);
            let host = host_of(&self.peer);
            let name = ServerName::try_from(host).map_err(|e| {
                SyncrepError::Config(format!(
                    "bad tls server name '{}': {}",
                    host, e
                ))
            })?;
            let tls = tokio::select! {
                tls = connector.connect(name, tcp) => tls?,
                _ = cancel_rx.wait_for(|c| *c) => {
                    return Err(SyncrepError::Cancelled);
                }
            };
            IstStream::Tls(Box::new(tls.into()))
        } else {
            IstStream::Plain(tcp)
        };

        // version handshake
        framed_write(&mut stream, &IstMsg::Handshake {
            version: self.version,
        })
        .await?;
        let mut read_buf = BytesMut::new();
        let ack: IstMsg = tokio::select! {
            msg = framed_read(&mut read_buf, &mut stream) => msg?,
            _ = cancel_rx.wait_for(|c| *c) => {
                return Err(SyncrepError::Cancelled);
            }
        };
        match ack {
            IstMsg::HandshakeAck { version }
                if version == self.version => {}
            IstMsg::HandshakeAck { version } => {
                return Err(SyncrepError::ProtocolVersion {
                    local: self.version,
                    peer: version,
                });
            }
            other => {
                return Err(SyncrepError::Invalid(format!(
                    "expected handshake ack, got {:?}",
                    other
                )));
            }
        }

        // stream the range in order; a cache miss is fatal for the transfer
        for seqno in first..=last {
            let ws = tokio::select! {
                ws = self.gcache.get(seqno) => ws.map_err(|e| match e {
                    SyncrepError::NotFound(s) => SyncrepError::OutOfRange(s),
                    other => other,
                })?,
                _ = cancel_rx.wait_for(|c| *c) => {
                    return Err(SyncrepError::Cancelled);
                }
            };
            let trx_msg = IstMsg::Trx(ws);
            tokio::select! {
                sent = framed_write(&mut stream, &trx_msg) => sent?,
                _ = cancel_rx.wait_for(|c| *c) => {
                    return Err(SyncrepError::Cancelled);
                }
            }
            self.progress.store(seqno, Ordering::Release);
        }

        let eof_msg = IstMsg::Eof { last };
        tokio::select! {
            sent = framed_write(&mut stream, &eof_msg) => sent?,
            _ = cancel_rx.wait_for(|c| *c) => {
                return Err(SyncrepError::Cancelled);
            }
        }

        // wait for the peer to close its end cleanly
        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                read = stream.read(&mut scratch) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
                _ = cancel_rx.wait_for(|c| *c) => {
                    return Err(SyncrepError::Cancelled);
                }
            }
        }
    }
}

/// Host portion of a `host:port` peer string, with IPv6 brackets removed.
fn host_of(peer: &str) -> &str {
    let host = match peer.rfind(':') {
        Some(idx) => &peer[..idx],
        None => peer,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod sender_tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("10.0.0.1:4568"), "10.0.0.1");
        assert_eq!(host_of("donor.example.com:4568"), "donor.example.com");
        assert_eq!(host_of("[::1]:4568"), "::1");
        assert_eq!(host_of("bare-host"), "bare-host");
    }
}
