//! Interfaces of the external collaborators this crate orchestrates but
//! does not implement: group communication, the writeset cache, the
//! application engine, and the opaque snapshot donor callback.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::base::{DonorId, GroupUuid, Seqno, Writeset};
use crate::utils::SyncrepError;

/// Error kinds surfaced by the group communication submit path. `Again`
/// and `NotConnected` are retried with fixed backoff; everything else is
/// terminal for the request.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum GcsError {
    /// No donor currently available; try again later.
    Again,
    /// Not connected to the primary component yet.
    NotConnected,
    /// The group connection has been closed.
    Closed,
    /// Any other errno-style failure.
    Other(i32),
}

impl GcsError {
    /// Whether the submit loop should sleep and retry this failure.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, GcsError::Again | GcsError::NotConnected)
    }

    /// errno-style code for logs and `ist_end` reporting.
    pub fn errno(&self) -> i32 {
        match self {
            GcsError::Again => 11,         // EAGAIN
            GcsError::NotConnected => 107, // ENOTCONN
            GcsError::Closed => 108,       // ESHUTDOWN
            GcsError::Other(e) => *e,
        }
    }
}

impl fmt::Display for GcsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GcsError::Again => write!(f, "try again (-{})", self.errno()),
            GcsError::NotConnected => {
                write!(f, "not connected (-{})", self.errno())
            }
            GcsError::Closed => write!(f, "closed (-{})", self.errno()),
            GcsError::Other(e) => write!(f, "errno {}", e),
        }
    }
}

impl std::error::Error for GcsError {}

/// Outcome of submitting a state transfer request to the group. The group
/// reserves a local-order slot for the request even on some failures, so
/// `order_seqno` is reported independently of donor selection
/// (`SEQNO_ILL` when no slot was reserved).
#[derive(Debug)]
pub struct StReply {
    /// Selected donor index, or the submit failure.
    pub donor: Result<DonorId, GcsError>,

    /// Local-order slot reserved for this request.
    pub order_seqno: Seqno,
}

/// Group communication system handle (consumed).
#[async_trait]
pub trait GroupComm: Send + Sync {
    /// Submit a state transfer request carrying the given opaque bytes.
    async fn request_state_transfer(
        &self,
        req: &[u8],
        donor_hint: &str,
    ) -> StReply;

    /// Announce that this node has reached the given position and may be
    /// counted as joined.
    async fn join(&self, seqno: Seqno) -> Result<(), SyncrepError>;
}

/// Local writeset cache handle (consumed). The cache stores committed
/// writesets by seqno with bounded retention.
#[async_trait]
pub trait WritesetCache: Send + Sync {
    /// Pin `seqno` (and everything after it) against eviction. Fails with
    /// `NotFound` when the seqno has already been evicted. Must be paired
    /// with `seqno_unlock`; use [`SeqnoPin`] for scoped acquisition.
    fn seqno_lock(&self, seqno: Seqno) -> Result<(), SyncrepError>;

    /// Release a pin taken by `seqno_lock`.
    fn seqno_unlock(&self, seqno: Seqno);

    /// Fetch the writeset at `seqno`. May suspend (bounded) until a
    /// writeset with that seqno is present.
    async fn get(&self, seqno: Seqno) -> Result<Writeset, SyncrepError>;

    /// Drop all seqno ordering state; retention is irrelevant to a joiner
    /// until it rejoins the order.
    fn seqno_reset(&self);
}

/// Scoped cache pin: releases the underlying `seqno_lock` when dropped,
/// on every exit path.
pub struct SeqnoPin {
    cache: Arc<dyn WritesetCache>,
    seqno: Seqno,
}

impl SeqnoPin {
    /// Acquire a pin on `seqno`, failing with `NotFound` if the cache no
    /// longer retains it.
    pub fn acquire(
        cache: Arc<dyn WritesetCache>,
        seqno: Seqno,
    ) -> Result<Self, SyncrepError> {
        cache.seqno_lock(seqno)?;
        Ok(SeqnoPin { cache, seqno })
    }

    /// Pinned seqno.
    #[inline]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }
}

impl Drop for SeqnoPin {
    fn drop(&mut self) {
        self.cache.seqno_unlock(self.seqno);
    }
}

/// Observer of IST reception events (exposed). The receiver holds this as
/// a narrow capability: deliver one writeset, report end-of-stream. The
/// implementor outlives the receiver.
#[async_trait]
pub trait EventObserver: Send + Sync {
    /// Deliver one writeset received over IST. `must_apply` is false only
    /// for writesets marked already-committed-elsewhere by protocol.
    async fn ist_trx(
        &self,
        ws: Writeset,
        must_apply: bool,
    ) -> Result<(), SyncrepError>;

    /// Report end of the IST stream; `error` is zero on clean completion.
    /// Called exactly once per reception.
    fn ist_end(&self, error: i32);
}

/// Writeset application engine handle (consumed). Application order is
/// enforced by the coordinator's monitors, not by the engine.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply one decoded writeset.
    async fn apply(&self, ws: &Writeset) -> Result<(), SyncrepError>;
}

/// Opaque snapshot donor callback (consumed). When `bypass` is true the
/// call is a handshake-only indication that IST covers the whole transfer.
#[async_trait]
pub trait SstDonor: Send + Sync {
    async fn donate(
        &self,
        sst_req: &[u8],
        uuid: &GroupUuid,
        seqno: Seqno,
        bypass: bool,
    ) -> Result<(), SyncrepError>;
}
