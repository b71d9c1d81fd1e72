//! State transfer coordinator: brings a joining node from its current
//! position to the group's position by composing an opaque state snapshot
//! transfer (SST) with an incremental writeset replay (IST), and serves
//! both roles of that exchange.

mod donor;
mod joiner;
mod monitor;
mod request;

pub use monitor::{OrderMonitor, SlotGuard, DEFAULT_MONITOR_CAPACITY};
pub use request::{
    read_state_request, IstRequest, StateRequest, StateRequestView,
};

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Mutex as TokioMutex};

use crate::base::{GroupUuid, NodeState, Seqno, SstState};
use crate::iface::{Applier, GroupComm, SstDonor, WritesetCache};
use crate::ist::{AsyncSenderMap, IstConfig};
use crate::ist::Receiver;
use crate::utils::SyncrepError;

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoordConfig {
    /// Node name used as the logging prefix.
    pub node_name: String,

    /// Address the IST receiver advertises to donors; empty means
    /// advertise the locally bound address.
    pub ist_recv_addr: String,

    /// Address the IST receiver binds to locally; empty means
    /// `ist_recv_addr`.
    pub ist_recv_bind: String,

    /// Enable TLS on the IST channel.
    pub ist_ssl: bool,

    /// PEM certificate chain file for the IST receiver.
    pub ist_ssl_cert: String,

    /// PEM PKCS#8 private key file for the IST receiver.
    pub ist_ssl_key: String,

    /// PEM CA bundle file the IST sender trusts.
    pub ist_ssl_ca: String,

    /// Sleep between retries of the state transfer request, in seconds.
    pub sst_retry_s: u64,

    /// Preferred donor name passed through to group communication.
    pub sst_donor: String,

    /// Admission window of the ordered monitors.
    pub monitor_capacity: i64,

    /// Skip commit-order serialization entirely.
    pub commit_order_bypass: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            node_name: "node".into(),
            ist_recv_addr: String::new(),
            ist_recv_bind: String::new(),
            ist_ssl: false,
            ist_ssl_cert: String::new(),
            ist_ssl_key: String::new(),
            ist_ssl_ca: String::new(),
            sst_retry_s: 1,
            sst_donor: String::new(),
            monitor_capacity: DEFAULT_MONITOR_CAPACITY,
            commit_order_bypass: false,
        }
    }
}

impl CoordConfig {
    /// IST channel settings slice of this configuration.
    pub(crate) fn ist(&self) -> IstConfig {
        IstConfig {
            recv_addr: self.ist_recv_addr.clone(),
            recv_bind: self.ist_recv_bind.clone(),
            ssl: self.ist_ssl,
            ssl_cert: self.ist_ssl_cert.clone(),
            ssl_key: self.ist_ssl_key.clone(),
            ssl_ca: self.ist_ssl_ca.clone(),
        }
    }
}

/// Snapshot completion signal set by the external SST callback.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) struct SstSignal {
    pub uuid: GroupUuid,
    pub seqno: Seqno,
}

/// The state transfer coordinator. One instance serves both roles: the
/// joiner side (`request_state_transfer`, `sst_received`) and the donor
/// side (`process_state_req`). External collaborators are handed in at
/// construction as narrow trait objects.
pub struct Coordinator {
    pub(crate) conf: CoordConfig,

    /// Negotiated state transfer request framing version.
    pub(crate) proto_ver: u32,

    /// Node membership/transfer state.
    state: watch::Sender<NodeState>,

    /// Current group state identifier of this node.
    state_uuid: StdMutex<GroupUuid>,

    /// Progress of the snapshot wait.
    sst_state: StdMutex<SstState>,

    /// Rendezvous cell between the joiner's wait and `sst_received`.
    pub(crate) sst_signal: watch::Sender<Option<SstSignal>>,

    /// Serializes a transfer's submit-and-wait against concurrent use.
    pub(crate) sst_mutex: TokioMutex<()>,

    /// Raised by `close()`; breaks retry sleeps and waits.
    pub(crate) closing: watch::Sender<bool>,

    pub(crate) gcs: Arc<dyn GroupComm>,
    pub(crate) gcache: Arc<dyn WritesetCache>,
    pub(crate) applier: Arc<dyn Applier>,
    pub(crate) sst_donate: Arc<dyn SstDonor>,

    /// Serializes writeset application by seqno.
    pub(crate) apply_monitor: OrderMonitor,

    /// Serializes commit ordering by seqno.
    pub(crate) commit_monitor: OrderMonitor,

    /// Serializes locally-ordered group actions.
    pub(crate) local_monitor: OrderMonitor,

    /// In-flight donor-side IST senders.
    pub(crate) ist_senders: AsyncSenderMap,

    /// Interrupt handle of the receiver of the transfer in flight.
    pub(crate) ist_interrupt: StdMutex<Option<crate::ist::Interrupter>>,
}

impl Coordinator {
    /// Create a coordinator from optional TOML config overrides, the
    /// negotiated request framing version, and this node's recovered
    /// state (group uuid and last applied position).
    pub fn new(
        config_str: Option<&str>,
        proto_ver: u32,
        state_uuid: GroupUuid,
        init_position: Seqno,
        gcs: Arc<dyn GroupComm>,
        gcache: Arc<dyn WritesetCache>,
        applier: Arc<dyn Applier>,
        sst_donate: Arc<dyn SstDonor>,
    ) -> Result<Self, SyncrepError> {
        let conf = parsed_config!(config_str => CoordConfig;
                                  node_name, ist_recv_addr, ist_recv_bind,
                                  ist_ssl, ist_ssl_cert, ist_ssl_key,
                                  ist_ssl_ca, sst_retry_s, sst_donor,
                                  monitor_capacity, commit_order_bypass)?;
        if conf.monitor_capacity <= 0 {
            return logged_err!(
                "invalid config.monitor_capacity '{}'",
                conf.monitor_capacity
            );
        }
        if proto_ver > 1 {
            return logged_err!(
                "unsupported state transfer protocol version {}",
                proto_ver
            );
        }
        if conf.ist_ssl
            && (conf.ist_ssl_cert.is_empty() || conf.ist_ssl_key.is_empty())
        {
            return logged_err!(
                "config.ist_ssl requires ist_ssl_cert and ist_ssl_key"
            );
        }

        let apply_monitor = OrderMonitor::new("apply", conf.monitor_capacity);
        let commit_monitor =
            OrderMonitor::new("commit", conf.monitor_capacity);
        let local_monitor = OrderMonitor::new("local", conf.monitor_capacity);
        apply_monitor.set_initial_position(init_position);
        commit_monitor.set_initial_position(init_position);

        let (state, _) = watch::channel(NodeState::Open);
        let (sst_signal, _) = watch::channel(None);
        let (closing, _) = watch::channel(false);

        Ok(Coordinator {
            conf,
            proto_ver,
            state,
            state_uuid: StdMutex::new(state_uuid),
            sst_state: StdMutex::new(SstState::None),
            sst_signal,
            sst_mutex: TokioMutex::new(()),
            closing,
            gcs,
            gcache,
            applier,
            sst_donate,
            apply_monitor,
            commit_monitor,
            local_monitor,
            ist_senders: AsyncSenderMap::new(),
            ist_interrupt: StdMutex::new(None),
        })
    }

    /// Current node state.
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Watch handle over node state transitions.
    pub fn state_watch(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// Current group state identifier.
    pub fn current_uuid(&self) -> GroupUuid {
        *self.state_uuid.lock().unwrap()
    }

    /// Progress of the snapshot wait.
    pub fn sst_state(&self) -> SstState {
        *self.sst_state.lock().unwrap()
    }

    /// Last seqno to have left the apply monitor.
    pub fn apply_position(&self) -> Seqno {
        self.apply_monitor.last_left()
    }

    /// Number of donor-side IST senders currently in flight.
    pub fn ist_in_flight(&self) -> usize {
        self.ist_senders.in_flight()
    }

    pub(crate) fn shift_to(&self, next: NodeState) {
        let prev = self.state.send_replace(next);
        pf_info!(&self.conf.node_name; "shifting state {} -> {}", prev, next);
    }

    pub(crate) fn set_sst_state(&self, next: SstState) {
        *self.sst_state.lock().unwrap() = next;
    }

    pub(crate) fn set_state_uuid(&self, uuid: GroupUuid) {
        *self.state_uuid.lock().unwrap() = uuid;
    }

    /// Cancel every in-flight donor-side IST sender and wait for them to
    /// exit.
    pub async fn cancel_ist_senders(&self) {
        self.ist_senders.cancel().await;
    }

    /// Shut the coordinator down: interrupts a reception in flight,
    /// cancels outstanding senders, and breaks any submit retry sleep.
    pub async fn close(&self) {
        self.shift_to(NodeState::Closing);
        self.closing.send_replace(true);
        let interrupter = self.ist_interrupt.lock().unwrap().clone();
        if let Some(interrupter) = interrupter {
            interrupter.interrupt();
        }
        self.ist_senders.cancel().await;
    }

    /// Register the receiver serving the transfer in flight so `close()`
    /// can interrupt it.
    pub(crate) fn track_receiver(&self, receiver: &Receiver) {
        *self.ist_interrupt.lock().unwrap() = Some(receiver.interrupter());
    }

    pub(crate) fn untrack_receiver(&self) {
        *self.ist_interrupt.lock().unwrap() = None;
    }
}
