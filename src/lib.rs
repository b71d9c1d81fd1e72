//! Public interface to the syncrep library: the state transfer
//! coordinator of a synchronous multi-master replication engine, linked
//! by the engine that supplies group communication, the writeset cache,
//! and the application callbacks.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod base;
mod coord;
mod iface;
mod ist;

pub use base::{
    DonorId, GroupUuid, NodeState, Seqno, SstState, Writeset, SEQNO_ILL,
    TRIVIAL_SST,
};
pub use coord::{
    read_state_request, CoordConfig, Coordinator, IstRequest, OrderMonitor,
    SlotGuard, StateRequest, StateRequestView, DEFAULT_MONITOR_CAPACITY,
};
pub use iface::{
    Applier, EventObserver, GcsError, GroupComm, SeqnoPin, SstDonor, StReply,
    WritesetCache,
};
pub use ist::{AsyncSenderMap, Interrupter, IstConfig, Receiver, Sender};
pub use utils::SyncrepError;

#[cfg(test)]
pub(crate) mod testing;
