//! Registry of in-flight IST sender tasks on the donor side, so that a
//! shutting-down donor can cancel them and wait for all to exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Notify;

use crate::base::Seqno;
use crate::iface::{SeqnoPin, WritesetCache};
use crate::ist::sender::Sender;
use crate::ist::IstConfig;

/// Tracks running IST senders. `cancel()` must be able to suspend while
/// waiting for every sender task to unregister itself, so removal is
/// signalled through a notifier rather than observed under a plain lock.
pub struct AsyncSenderMap {
    senders: Arc<StdMutex<HashMap<u64, Arc<Sender>>>>,
    next_id: AtomicU64,
    removed: Arc<Notify>,
}

impl Default for AsyncSenderMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncSenderMap {
    pub fn new() -> Self {
        AsyncSenderMap {
            senders: Arc::new(StdMutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            removed: Arc::new(Notify::new()),
        }
    }

    /// Number of senders currently in flight.
    pub fn in_flight(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// Spawn a sender task streaming `[first, last]` to `peer` and insert
    /// it into the registry. `pin` keeps the cache range alive for the
    /// task's whole lifetime; the task unregisters itself on exit.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        conf: IstConfig,
        gcache: Arc<dyn WritesetCache>,
        peer: &str,
        first: Seqno,
        last: Seqno,
        version: u32,
        pin: SeqnoPin,
    ) {
        let sender = Arc::new(Sender::new(conf, gcache, peer, version));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&sender));

        let senders = Arc::clone(&self.senders);
        let removed = Arc::clone(&self.removed);
        let peer = peer.to_string();
        tokio::spawn(async move {
            pf_info!("ist.send"; "serving IST {}..={} to '{}'",
                     first, last, peer);
            if let Err(e) = sender.send(first, last).await {
                pf_warn!("ist.send"; "IST to '{}' failed: {}", peer, e);
            }
            drop(pin);
            Self::remove(&senders, &removed, id, sender.progress(), &peer);
        });
    }

    /// Unregister a finished sender and log its progress.
    fn remove(
        senders: &StdMutex<HashMap<u64, Arc<Sender>>>,
        removed: &Notify,
        id: u64,
        last_sent: Seqno,
        peer: &str,
    ) {
        senders.lock().unwrap().remove(&id);
        pf_info!("ist.send"; "sender to '{}' exiting, last seqno sent {}",
                 peer, last_sent);
        removed.notify_waiters();
    }

    /// Cancel every in-flight sender and wait until all have exited. The
    /// wait suspends, making this a cancellation point for the caller.
    pub async fn cancel(&self) {
        loop {
            // arm the notification before re-checking emptiness, so an
            // exit between the check and the await cannot be missed
            let notified = self.removed.notified();
            {
                let senders = self.senders.lock().unwrap();
                if senders.is_empty() {
                    return;
                }
                for sender in senders.values() {
                    sender.cancel();
                }
            }
            notified.await;
        }
    }
}
