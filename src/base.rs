//! Base types shared by the transfer coordinator and the IST subsystem.

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Global total-order sequence number assigned by group communication.
pub type Seqno = i64;

/// Sentinel seqno value meaning "none".
pub const SEQNO_ILL: Seqno = -1;

/// 128-bit group state identifier.
pub type GroupUuid = uuid::Uuid;

/// Donor index as reported by group communication on a successful
/// state transfer request.
pub type DonorId = i64;

/// Distinguished state request payload meaning "no actual transfer
/// required; just acknowledge".
pub const TRIVIAL_SST: &[u8] = b"trivial";

/// A totally-ordered unit of replicated change, as cached by the local
/// writeset cache and replayed over IST.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Writeset {
    /// Global seqno of this writeset.
    pub seqno: Seqno,

    /// Seqno of the last writeset this one depends on. `SEQNO_ILL` marks a
    /// writeset already committed elsewhere, which a joiner must not
    /// re-apply.
    pub depends_seqno: Seqno,

    /// Opaque replication payload.
    pub payload: Vec<u8>,
}

impl Writeset {
    /// Whether a joiner receiving this writeset over IST must apply it.
    #[inline]
    pub fn must_apply(&self) -> bool {
        self.depends_seqno != SEQNO_ILL
    }
}

/// Node membership/transfer state. Variant order matters: states strictly
/// greater than `Closing` count as operational.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub enum NodeState {
    Closed,
    Closing,
    Open,
    Primary,
    Joiner,
    Joining,
    Joined,
    Synced,
    Donor,
}

impl NodeState {
    /// True for states in which an unrecoverable transfer failure must
    /// abort the process rather than be reported back.
    #[inline]
    pub fn is_operational(&self) -> bool {
        *self > NodeState::Closing
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Progress of the joiner's state snapshot wait.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SstState {
    /// No transfer in flight.
    None,
    /// Request submitted, waiting for the donor to finish.
    Wait,
    /// The request itself could not be submitted.
    ReqFailed,
    /// The transfer started but did not complete.
    Failed,
}
