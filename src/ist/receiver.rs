//! IST receiver: accepts one incoming sender connection and feeds the
//! stream of missing writesets to the event observer.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::base::{Seqno, SEQNO_ILL};
use crate::iface::EventObserver;
use crate::ist::tls;
use crate::ist::wire::{IstMsg, IstStream};
use crate::ist::IstConfig;
use crate::utils::{framed_read, framed_write, tcp_bind_with_retry};
use crate::utils::SyncrepError;

/// Clonable interrupt handle for a [`Receiver`]. Idempotent.
#[derive(Clone)]
pub struct Interrupter {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }
}

/// Joiner-side IST reception endpoint.
///
/// Lifecycle: `prepare()` binds the listener, spawns the background accept
/// task, and returns the address to advertise in the state request;
/// `ready(first)` releases writeset delivery once the snapshot has fixed
/// the starting position; `finished()` joins the task and reports the
/// highest seqno delivered. `interrupt()` tears everything down promptly
/// from any task.
pub struct Receiver {
    conf: IstConfig,
    observer: Arc<dyn EventObserver>,

    /// Starting seqno; `SEQNO_ILL` until `ready()` is called.
    ready_tx: watch::Sender<Seqno>,

    /// Interrupt flag shared with the background task.
    interrupt_tx: Arc<watch::Sender<bool>>,

    /// Background task handle; returns the highest delivered seqno.
    handle: Option<JoinHandle<Seqno>>,
}

impl Receiver {
    pub fn new(conf: IstConfig, observer: Arc<dyn EventObserver>) -> Self {
        let (ready_tx, _) = watch::channel(SEQNO_ILL);
        let (interrupt_tx, _) = watch::channel(false);
        Receiver {
            conf,
            observer,
            ready_tx,
            interrupt_tx: Arc::new(interrupt_tx),
            handle: None,
        }
    }

    /// Bind the listen address, start accepting in the background, and
    /// return the externally reachable address to advertise to donors.
    /// Binding failure is reported immediately.
    pub async fn prepare(
        &mut self,
        last_seqno: Seqno,
        version: u32,
    ) -> Result<String, SyncrepError> {
        if self.handle.is_some() {
            return logged_err!("ist.recv"; "prepare() called twice");
        }

        let bind_str = if !self.conf.recv_bind.is_empty() {
            self.conf.recv_bind.clone()
        } else if !self.conf.recv_addr.is_empty() {
            self.conf.recv_addr.clone()
        } else {
            "127.0.0.1:0".into()
        };
        let bind_addr = bind_str.parse().map_err(|e| {
            SyncrepError::Config(format!(
                "invalid IST receive address '{}': {}",
                bind_str, e
            ))
        })?;

        let listener = tcp_bind_with_retry(bind_addr, 0).await?;
        let local_addr = listener.local_addr()?;
        let advertised = if !self.conf.recv_addr.is_empty() {
            self.conf.recv_addr.clone()
        } else {
            local_addr.to_string()
        };

        let acceptor = if self.conf.ssl {
            Some(TlsAcceptor::from(tls::server_config(
                &self.conf.ssl_cert,
                &self.conf.ssl_key,
            )?))
        } else {
            None
        };

        pf_debug!("ist.recv"; "listening on {}, advertising '{}'",
                  local_addr, advertised);

        let observer = Arc::clone(&self.observer);
        let ready_rx = self.ready_tx.subscribe();
        let interrupt_rx = self.interrupt_tx.subscribe();
        self.handle = Some(tokio::spawn(Self::receiver_task(
            listener,
            acceptor,
            observer,
            ready_rx,
            interrupt_rx,
            last_seqno,
            version,
        )));

        Ok(advertised)
    }

    /// Record the starting seqno and release delivery. On a joiner this
    /// happens only after snapshot completion fixes the starting position.
    pub fn ready(&self, first_seqno: Seqno) {
        self.ready_tx.send_replace(first_seqno);
    }

    /// Starting seqno recorded by `ready()`, `SEQNO_ILL` if not yet set.
    pub fn first_seqno(&self) -> Seqno {
        *self.ready_tx.borrow()
    }

    /// Tear down the acceptor and any accepted socket promptly.
    /// Idempotent and callable from any task.
    pub fn interrupt(&self) {
        self.interrupt_tx.send_replace(true);
    }

    /// Detached handle that interrupts this receiver from any task, even
    /// after the receiver itself has moved elsewhere.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            tx: Arc::clone(&self.interrupt_tx),
        }
    }

    /// Join the background task after `ist_end` has been observed (or to
    /// abandon a reception that never started). Returns the highest seqno
    /// successfully delivered, `SEQNO_ILL` if none was.
    pub async fn finished(&mut self) -> Seqno {
        self.interrupt();
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(seqno) => seqno,
                Err(e) => {
                    pf_error!("ist.recv"; "receiver task died: {}", e);
                    SEQNO_ILL
                }
            },
            None => SEQNO_ILL,
        }
    }

    /// Background accept-and-deliver task. Reports `ist_end` exactly once
    /// on every exit path and resolves to the highest delivered seqno.
    async fn receiver_task(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        observer: Arc<dyn EventObserver>,
        mut ready_rx: watch::Receiver<Seqno>,
        mut interrupt_rx: watch::Receiver<bool>,
        last_seqno: Seqno,
        version: u32,
    ) -> Seqno {
        let mut delivered = SEQNO_ILL;
        let result = Self::serve(
            listener,
            acceptor,
            &observer,
            &mut ready_rx,
            &mut interrupt_rx,
            last_seqno,
            version,
            &mut delivered,
        )
        .await;

        let error_code = match result {
            Ok(()) => 0,
            Err(SyncrepError::Interrupted) => {
                pf_debug!("ist.recv"; "reception interrupted at seqno {}",
                          delivered);
                SyncrepError::Interrupted.code()
            }
            Err(e) => {
                pf_warn!("ist.recv"; "reception failed at seqno {}: {}",
                         delivered, e);
                e.code()
            }
        };
        observer.ist_end(error_code);
        delivered
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        observer: &Arc<dyn EventObserver>,
        ready_rx: &mut watch::Receiver<Seqno>,
        interrupt_rx: &mut watch::Receiver<bool>,
        last_seqno: Seqno,
        version: u32,
        delivered: &mut Seqno,
    ) -> Result<(), SyncrepError> {
        // accept a single sender connection
        let tcp = tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer) = accepted?;
                pf_debug!("ist.recv"; "accepted connection from {}", peer);
                tcp
            }
            _ = interrupt_rx.wait_for(|i| *i) => {
                return Err(SyncrepError::Interrupted);
            }
        };
        drop(listener);
        tcp.set_nodelay(true)?;

        let mut stream = match acceptor {
            Some(acceptor) => tokio::select! {
                tls = acceptor.accept(tcp) => {
                    IstStream::Tls(Box::new(tls?.into()))
                }
                _ = interrupt_rx.wait_for(|i| *i) => {
                    return Err(SyncrepError::Interrupted);
                }
            },
            None => IstStream::Plain(tcp),
        };

        // version handshake: always answer with our version, then judge
        let mut read_buf = BytesMut::new();
        let opening: IstMsg = tokio::select! {
            msg = framed_read(&mut read_buf, &mut stream) => msg?,
            _ = interrupt_rx.wait_for(|i| *i) => {
                return Err(SyncrepError::Interrupted);
            }
        };
        let peer_version = match opening {
            IstMsg::Handshake { version } => version,
            other => {
                return Err(SyncrepError::Invalid(format!(
                    "expected handshake, got {:?}",
                    other
                )));
            }
        };
        framed_write(&mut stream, &IstMsg::HandshakeAck { version }).await?;
        if peer_version != version {
            return Err(SyncrepError::ProtocolVersion {
                local: version,
                peer: peer_version,
            });
        }

        // delivery must not begin until the starting position is fixed
        let first_seqno = tokio::select! {
            first = ready_rx.wait_for(|s| *s != SEQNO_ILL) => {
                *first.map_err(|_| SyncrepError::msg("receiver dropped"))?
            }
            _ = interrupt_rx.wait_for(|i| *i) => {
                return Err(SyncrepError::Interrupted);
            }
        };
        *delivered = first_seqno - 1;
        let mut expected = first_seqno;

        loop {
            let read = tokio::select! {
                msg = framed_read(&mut read_buf, &mut stream) => msg,
                _ = interrupt_rx.wait_for(|i| *i) => {
                    return Err(SyncrepError::Interrupted);
                }
            };
            let msg: IstMsg = match read {
                Ok(msg) => msg,
                // a sender that closes right after its last writeset
                // instead of marking end-of-stream still completed
                Err(SyncrepError::Io(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof
                        && *delivered == last_seqno =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match msg {
                IstMsg::Trx(ws) => {
                    if ws.seqno != expected {
                        return Err(SyncrepError::Sequence {
                            expected,
                            got: ws.seqno,
                        });
                    }
                    let must_apply = ws.must_apply();
                    observer.ist_trx(ws, must_apply).await?;
                    *delivered = expected;
                    expected += 1;
                    if *delivered == last_seqno {
                        pf_debug!("ist.recv"; "stream complete at seqno {}",
                                  last_seqno);
                        // keep reading for the end-of-stream marker so the
                        // close is clean on both ends
                    }
                }
                IstMsg::Eof { last } => {
                    pf_debug!("ist.recv"; "end of stream marker, last {}",
                              last);
                    return Ok(());
                }
                other => {
                    return Err(SyncrepError::Invalid(format!(
                        "unexpected message mid-stream: {:?}",
                        other
                    )));
                }
            }
        }
    }
}
