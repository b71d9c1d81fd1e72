//! In-memory doubles of the external collaborators, shared by the test
//! modules across the crate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::base::{GroupUuid, Seqno, Writeset};
use crate::iface::{
    Applier, GroupComm, SstDonor, StReply, WritesetCache,
};
use crate::utils::SyncrepError;

/// In-memory writeset cache with explicit eviction and an optional
/// block-until-present fetch mode.
pub(crate) struct MemCache {
    writesets: StdMutex<BTreeMap<Seqno, Writeset>>,
    pins: StdMutex<Vec<Seqno>>,
    blocking_fetch: AtomicBool,
    inserted: Notify,
}

impl MemCache {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MemCache {
            writesets: StdMutex::new(BTreeMap::new()),
            pins: StdMutex::new(Vec::new()),
            blocking_fetch: AtomicBool::new(false),
            inserted: Notify::new(),
        })
    }

    /// Cache pre-filled with writesets `[first, last]`, each depending on
    /// its predecessor.
    pub(crate) fn with_range(first: Seqno, last: Seqno) -> Arc<Self> {
        let cache = Self::new();
        for seqno in first..=last {
            cache.insert(Writeset {
                seqno,
                depends_seqno: seqno - 1,
                payload: vec![seqno as u8; 8],
            });
        }
        cache
    }

    pub(crate) fn insert(&self, ws: Writeset) {
        self.writesets.lock().unwrap().insert(ws.seqno, ws);
        self.inserted.notify_waiters();
    }

    pub(crate) fn evict(&self, seqno: Seqno) {
        self.writesets.lock().unwrap().remove(&seqno);
    }

    /// When on, `get()` of an absent seqno suspends until it is inserted
    /// instead of failing.
    pub(crate) fn set_blocking_fetch(&self, on: bool) {
        self.blocking_fetch.store(on, Ordering::Release);
    }

    pub(crate) fn pinned(&self) -> Vec<Seqno> {
        self.pins.lock().unwrap().clone()
    }
}

#[async_trait]
impl WritesetCache for MemCache {
    fn seqno_lock(&self, seqno: Seqno) -> Result<(), SyncrepError> {
        if !self.writesets.lock().unwrap().contains_key(&seqno) {
            return Err(SyncrepError::NotFound(seqno));
        }
        self.pins.lock().unwrap().push(seqno);
        Ok(())
    }

    fn seqno_unlock(&self, seqno: Seqno) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(idx) = pins.iter().position(|s| *s == seqno) {
            pins.remove(idx);
        }
    }

    async fn get(&self, seqno: Seqno) -> Result<Writeset, SyncrepError> {
        loop {
            // arm before checking so an insert cannot slip between
            let notified = self.inserted.notified();
            if let Some(ws) = self.writesets.lock().unwrap().get(&seqno) {
                return Ok(ws.clone());
            }
            if !self.blocking_fetch.load(Ordering::Acquire) {
                return Err(SyncrepError::NotFound(seqno));
            }
            notified.await;
        }
    }

    fn seqno_reset(&self) {
        self.writesets.lock().unwrap().clear();
    }
}

/// Group communication double replaying a script of submit replies and
/// recording every submitted request and join announcement.
pub(crate) struct MockGcs {
    replies: StdMutex<VecDeque<StReply>>,
    submitted_tx: mpsc::UnboundedSender<Vec<u8>>,
    calls: AtomicU64,
    joins: StdMutex<Vec<Seqno>>,
}

impl MockGcs {
    /// Returns the double plus the stream of submitted request bytes.
    pub(crate) fn new(
        replies: Vec<StReply>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (submitted_tx, submitted_rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockGcs {
                replies: StdMutex::new(replies.into()),
                submitted_tx,
                calls: AtomicU64::new(0),
                joins: StdMutex::new(Vec::new()),
            }),
            submitted_rx,
        )
    }

    pub(crate) fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    pub(crate) fn joins(&self) -> Vec<Seqno> {
        self.joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupComm for MockGcs {
    async fn request_state_transfer(
        &self,
        req: &[u8],
        _donor_hint: &str,
    ) -> StReply {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let _ = self.submitted_tx.send(req.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("MockGcs reply script exhausted")
    }

    async fn join(&self, seqno: Seqno) -> Result<(), SyncrepError> {
        self.joins.lock().unwrap().push(seqno);
        Ok(())
    }
}

/// Applier double recording applied seqnos in order.
pub(crate) struct RecordingApplier {
    applied: StdMutex<Vec<Seqno>>,
}

impl RecordingApplier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingApplier {
            applied: StdMutex::new(Vec::new()),
        })
    }

    pub(crate) fn applied(&self) -> Vec<Seqno> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(&self, ws: &Writeset) -> Result<(), SyncrepError> {
        self.applied.lock().unwrap().push(ws.seqno);
        Ok(())
    }
}

/// One recorded snapshot donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Donation {
    pub uuid: GroupUuid,
    pub seqno: Seqno,
    pub bypass: bool,
}

/// Snapshot donor double recording every callback invocation and
/// forwarding it to the test for cross-wiring to a joiner.
pub(crate) struct MockDonor {
    donations: StdMutex<Vec<Donation>>,
    events_tx: mpsc::UnboundedSender<Donation>,
}

impl MockDonor {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Donation>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockDonor {
                donations: StdMutex::new(Vec::new()),
                events_tx,
            }),
            events_rx,
        )
    }

    pub(crate) fn donations(&self) -> Vec<Donation> {
        self.donations.lock().unwrap().clone()
    }
}

#[async_trait]
impl SstDonor for MockDonor {
    async fn donate(
        &self,
        _sst_req: &[u8],
        uuid: &GroupUuid,
        seqno: Seqno,
        bypass: bool,
    ) -> Result<(), SyncrepError> {
        let donation = Donation {
            uuid: *uuid,
            seqno,
            bypass,
        };
        self.donations.lock().unwrap().push(donation.clone());
        let _ = self.events_tx.send(donation);
        Ok(())
    }
}
