//! Incremental state transfer subsystem: the receiver a joiner listens
//! with, the sender a donor streams from, and the registry that lets a
//! shutting-down donor cancel its in-flight senders.

mod receiver;
mod sender;
mod senders;
mod tls;
mod wire;

pub use receiver::{Interrupter, Receiver};
pub use sender::Sender;
pub use senders::AsyncSenderMap;

/// IST channel settings, carved out of the coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct IstConfig {
    /// Address the receiver advertises to donors; empty means advertise
    /// the locally bound address.
    pub recv_addr: String,

    /// Address the receiver binds to locally; empty means `recv_addr`.
    pub recv_bind: String,

    /// Wrap the IST channel in TLS.
    pub ssl: bool,

    /// PEM certificate chain presented by the receiver.
    pub ssl_cert: String,

    /// PEM PKCS#8 private key for `ssl_cert`.
    pub ssl_key: String,

    /// PEM CA bundle the sender trusts.
    pub ssl_ca: String,
}

#[cfg(test)]
mod ist_tests {
    use super::*;

    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use tokio::time::{timeout, Duration};

    use crate::base::{Seqno, Writeset, SEQNO_ILL};
    use crate::iface::{EventObserver, SeqnoPin};
    use crate::testing::MemCache;
    use crate::utils::SyncrepError;

    /// Observer recording delivered writesets and the final end code.
    struct RecordingObserver {
        trxs: StdMutex<Vec<(Seqno, bool)>>,
        end: StdMutex<Option<i32>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(RecordingObserver {
                trxs: StdMutex::new(Vec::new()),
                end: StdMutex::new(None),
            })
        }

        fn seqnos(&self) -> Vec<Seqno> {
            self.trxs.lock().unwrap().iter().map(|(s, _)| *s).collect()
        }

        fn end_code(&self) -> Option<i32> {
            *self.end.lock().unwrap()
        }
    }

    #[async_trait]
    impl EventObserver for RecordingObserver {
        async fn ist_trx(
            &self,
            ws: Writeset,
            must_apply: bool,
        ) -> Result<(), SyncrepError> {
            self.trxs.lock().unwrap().push((ws.seqno, must_apply));
            Ok(())
        }

        fn ist_end(&self, error: i32) {
            let mut end = self.end.lock().unwrap();
            assert!(end.is_none(), "ist_end delivered twice");
            *end = Some(error);
        }
    }

    fn loopback_conf() -> IstConfig {
        IstConfig {
            recv_bind: "127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stream_full_range_in_order() -> Result<(), SyncrepError> {
        let observer = RecordingObserver::new();
        let mut receiver =
            Receiver::new(loopback_conf(), Arc::clone(&observer) as _);
        let addr = receiver.prepare(105, 1).await?;
        receiver.ready(101);

        let cache = MemCache::with_range(101, 105);
        let sender = Sender::new(IstConfig::default(), cache, &addr, 1);
        sender.send(101, 105).await?;

        let finished = timeout(Duration::from_secs(5), receiver.finished())
            .await
            .expect("receiver did not finish");
        assert_eq!(finished, 105);
        assert_eq!(observer.seqnos(), vec![101, 102, 103, 104, 105]);
        assert_eq!(observer.end_code(), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn already_committed_writesets_not_applied(
    ) -> Result<(), SyncrepError> {
        let observer = RecordingObserver::new();
        let mut receiver =
            Receiver::new(loopback_conf(), Arc::clone(&observer) as _);
        let addr = receiver.prepare(3, 1).await?;
        receiver.ready(1);

        let cache = MemCache::new();
        cache.insert(Writeset {
            seqno: 1,
            depends_seqno: 0,
            payload: vec![1],
        });
        cache.insert(Writeset {
            seqno: 2,
            depends_seqno: SEQNO_ILL, // committed elsewhere
            payload: vec![2],
        });
        cache.insert(Writeset {
            seqno: 3,
            depends_seqno: 2,
            payload: vec![3],
        });
        let sender = Sender::new(IstConfig::default(), cache, &addr, 1);
        sender.send(1, 3).await?;

        assert_eq!(receiver.finished().await, 3);
        let flags: Vec<(Seqno, bool)> =
            observer.trxs.lock().unwrap().clone();
        assert_eq!(flags, vec![(1, true), (2, false), (3, true)]);
        Ok(())
    }

    #[tokio::test]
    async fn evicted_seqno_breaks_stream() -> Result<(), SyncrepError> {
        let observer = RecordingObserver::new();
        let mut receiver =
            Receiver::new(loopback_conf(), Arc::clone(&observer) as _);
        let addr = receiver.prepare(105, 1).await?;
        receiver.ready(101);

        // hole at 103
        let cache = MemCache::with_range(101, 105);
        cache.evict(103);
        let sender = Sender::new(IstConfig::default(), cache, &addr, 1);
        let err = sender.send(101, 105).await.unwrap_err();
        assert!(matches!(err, SyncrepError::OutOfRange(103)));

        // receiver sees the broken stream and reports a nonzero end code
        let finished = timeout(Duration::from_secs(5), receiver.finished())
            .await
            .expect("receiver did not finish");
        assert_eq!(finished, 102);
        assert_eq!(observer.seqnos(), vec![101, 102]);
        assert_ne!(observer.end_code(), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn version_mismatch_rejected() -> Result<(), SyncrepError> {
        let observer = RecordingObserver::new();
        let mut receiver =
            Receiver::new(loopback_conf(), Arc::clone(&observer) as _);
        let addr = receiver.prepare(5, 2).await?;
        receiver.ready(1);

        let cache = MemCache::with_range(1, 5);
        let sender = Sender::new(IstConfig::default(), cache, &addr, 1);
        let err = sender.send(1, 5).await.unwrap_err();
        assert!(matches!(
            err,
            SyncrepError::ProtocolVersion { local: 1, peer: 2 }
        ));

        receiver.finished().await;
        assert!(observer.seqnos().is_empty());
        assert_ne!(observer.end_code(), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_before_any_connection() -> Result<(), SyncrepError> {
        let observer = RecordingObserver::new();
        let mut receiver =
            Receiver::new(loopback_conf(), Arc::clone(&observer) as _);
        receiver.prepare(100, 1).await?;

        receiver.interrupt();
        receiver.interrupt(); // idempotent
        let finished = timeout(Duration::from_secs(5), receiver.finished())
            .await
            .expect("interrupt did not take effect");
        assert_eq!(finished, SEQNO_ILL);
        assert_eq!(observer.end_code(), Some(SyncrepError::Interrupted.code()));
        Ok(())
    }

    #[tokio::test]
    async fn sender_map_cancel_mid_stream() -> Result<(), SyncrepError> {
        let observer = RecordingObserver::new();
        let mut receiver =
            Receiver::new(loopback_conf(), Arc::clone(&observer) as _);
        let addr = receiver.prepare(110, 1).await?;
        receiver.ready(101);

        // cache holds only a prefix; the fetch of 104 parks the sender
        let cache = MemCache::with_range(101, 103);
        cache.set_blocking_fetch(true);
        let map = AsyncSenderMap::new();
        let pin = SeqnoPin::acquire(Arc::clone(&cache) as _, 101)?;
        map.run(
            IstConfig::default(),
            Arc::clone(&cache) as _,
            &addr,
            101,
            110,
            1,
            pin,
        );

        // wait until the delivered prefix has drained to the observer
        timeout(Duration::from_secs(5), async {
            while observer.seqnos().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("prefix not delivered");

        timeout(Duration::from_secs(5), map.cancel())
            .await
            .expect("cancel did not drain senders");
        assert_eq!(map.in_flight(), 0);

        let finished = timeout(Duration::from_secs(5), receiver.finished())
            .await
            .expect("receiver did not finish");
        assert_eq!(finished, 103);
        assert_eq!(observer.seqnos(), vec![101, 102, 103]);
        assert_ne!(observer.end_code(), Some(0));
        Ok(())
    }
}
