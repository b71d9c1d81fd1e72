//! Joiner-side transfer orchestration: build and submit the state
//! request, rendezvous with the snapshot completion signal, then drain
//! the incremental stream through the ordered monitors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use crate::base::{DonorId, GroupUuid, NodeState, Seqno, SstState, Writeset, SEQNO_ILL};
use crate::coord::request::{IstRequest, StateRequest};
use crate::coord::{Coordinator, SstSignal};
use crate::iface::EventObserver;
use crate::ist::Receiver;
use crate::utils::SyncrepError;

/// Reception events bridged from the IST receiver's observer callbacks
/// into the joiner's drain loop.
enum IstEvent {
    Trx { ws: Writeset, must_apply: bool },
    End(i32),
}

/// The narrow observer capability handed to the receiver: forwards every
/// event into the joiner's drain loop without holding any joiner state.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<IstEvent>,
}

#[async_trait]
impl EventObserver for ChannelObserver {
    async fn ist_trx(
        &self,
        ws: Writeset,
        must_apply: bool,
    ) -> Result<(), SyncrepError> {
        self.tx
            .send(IstEvent::Trx { ws, must_apply })
            .map_err(|_| SyncrepError::msg("joiner drain loop gone"))
    }

    fn ist_end(&self, error: i32) {
        // the drain loop may already have exited on its own error
        let _ = self.tx.send(IstEvent::End(error));
    }
}

impl Coordinator {
    /// Called by the group delivery thread when the external snapshot
    /// callback reports completion at `(uuid, seqno)`. Bounded-time:
    /// records the signal and wakes the waiting joiner.
    pub fn sst_received(
        &self,
        uuid: GroupUuid,
        seqno: Seqno,
    ) -> Result<(), SyncrepError> {
        pf_info!(&self.conf.node_name; "received SST: {}:{}", uuid, seqno);

        if self.state() != NodeState::Joining {
            return logged_err!(
                &self.conf.node_name;
                "not JOINING when sst_received() called, state: {}",
                self.state()
            );
        }

        self.sst_signal.send_replace(Some(SstSignal { uuid, seqno }));
        Ok(())
    }

    /// Bring this node from its current position to the group's position
    /// `(group_uuid, group_seqno)`. Returns the final applied position on
    /// success; on success the apply monitor has reached `group_seqno`.
    pub async fn request_state_transfer(
        &self,
        group_uuid: GroupUuid,
        group_seqno: Seqno,
        sst_req: &[u8],
    ) -> Result<Seqno, SyncrepError> {
        // the receiver must listen before the request leaves: the donor
        // may connect back immediately
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let observer: Arc<dyn EventObserver> =
            Arc::new(ChannelObserver { tx: event_tx });
        let mut receiver = Receiver::new(self.conf.ist(), observer);
        let advertised =
            receiver.prepare(group_seqno, self.proto_ver).await?;
        self.track_receiver(&receiver);

        let req =
            self.prepare_state_request(sst_req, &advertised, group_seqno);

        pf_debug!(&self.conf.node_name;
                  "state transfer required: group {}:{}, local {}:{}",
                  group_uuid, group_seqno, self.current_uuid(),
                  self.apply_monitor.last_left());

        let result = self
            .transfer(group_uuid, group_seqno, &req, &receiver, &mut event_rx)
            .await;

        let ist_position = receiver.finished().await;
        self.untrack_receiver();

        match result {
            Ok(sst_seqno) => {
                let position = sst_seqno.max(ist_position);
                self.set_sst_state(SstState::None);
                self.shift_to(NodeState::Joined);
                pf_info!(&self.conf.node_name;
                         "state transfer complete at {}:{}",
                         self.current_uuid(), position);
                Ok(position)
            }
            Err(e) => {
                // a submit failure has already recorded ReqFailed
                if self.sst_state() != SstState::ReqFailed {
                    self.set_sst_state(SstState::Failed);
                }
                Err(e)
            }
        }
    }

    /// Submit-and-wait body of a transfer; returns the snapshot seqno once
    /// the incremental stream (if any) has drained.
    async fn transfer(
        &self,
        group_uuid: GroupUuid,
        group_seqno: Seqno,
        req: &StateRequest,
        receiver: &Receiver,
        event_rx: &mut mpsc::UnboundedReceiver<IstEvent>,
    ) -> Result<Seqno, SyncrepError> {
        let _sst_lock = self.sst_mutex.lock().await;
        self.sst_signal.send_replace(None);

        self.send_state_request(req).await?;

        self.shift_to(NodeState::Joining);
        self.set_sst_state(SstState::Wait);

        // waiting for the snapshot is a good point to reset the cache,
        // since that may involve some IO too
        self.gcache.seqno_reset();

        // rendezvous with sst_received()
        let mut signal_rx = self.sst_signal.subscribe();
        let mut closing_rx = self.closing.subscribe();
        let signal = tokio::select! {
            signal = signal_rx.wait_for(|s| s.is_some()) => {
                *signal.map_err(|_| SyncrepError::msg("coordinator gone"))?
            }
            _ = closing_rx.wait_for(|c| *c) => {
                return Err(SyncrepError::Cancelled);
            }
        };
        let Some(SstSignal { uuid: sst_uuid, seqno: sst_seqno }) = signal
        else {
            return Err(SyncrepError::msg("empty SST signal"));
        };

        if sst_uuid != group_uuid {
            pf_error!(&self.conf.node_name;
                      "application received wrong state: received {}, \
                       required {}",
                      sst_uuid, group_uuid);
            self.set_sst_state(SstState::Failed);
            pf_error!(&self.conf.node_name;
                      "application state transfer failed; this is an \
                       unrecoverable condition, restart required");
            panic!("wrong state delivered by donor");
        }

        self.set_state_uuid(sst_uuid);
        // two-step reseed: the monitors refuse to go backwards
        self.apply_monitor.set_initial_position(SEQNO_ILL);
        self.apply_monitor.set_initial_position(sst_seqno);
        if !self.conf.commit_order_bypass {
            self.commit_monitor.set_initial_position(SEQNO_ILL);
            self.commit_monitor.set_initial_position(sst_seqno);
        }
        pf_info!(&self.conf.node_name; "SST finished: {}:{}",
                 sst_uuid, sst_seqno);

        if sst_seqno < group_seqno {
            pf_info!(&self.conf.node_name; "receiving IST: {} writesets",
                     group_seqno - sst_seqno);
            receiver.ready(sst_seqno + 1);
            self.recv_ist(event_rx).await?;
        }

        Ok(sst_seqno)
    }

    /// Encode the state request at the negotiated framing version. For v1
    /// this synthesizes the IST sub-request from the node's current
    /// position and the receiver's advertised address.
    pub(crate) fn prepare_state_request(
        &self,
        sst_req: &[u8],
        ist_peer: &str,
        group_seqno: Seqno,
    ) -> StateRequest {
        match self.proto_ver {
            0 => StateRequest::v0(sst_req),
            1 => {
                let istr = IstRequest {
                    uuid: self.current_uuid(),
                    last_applied: self.apply_monitor.last_left(),
                    group_seqno,
                    peer: ist_peer.to_string(),
                };
                match StateRequest::v1(sst_req, istr.to_string().as_bytes())
                {
                    Ok(req) => req,
                    Err(e) => {
                        pf_error!(&self.conf.node_name;
                                  "state request preparation failed, \
                                   aborting: {}",
                                  e);
                        panic!("state request preparation failed");
                    }
                }
            }
            other => {
                pf_error!(&self.conf.node_name;
                          "unsupported state transfer protocol: {}", other);
                panic!("unsupported state transfer protocol");
            }
        }
    }

    /// Submit the request to group communication, retrying retryable
    /// failures with fixed backoff. Self-cancels every local-order slot
    /// the group reserves along the way.
    pub(crate) async fn send_state_request(
        &self,
        req: &StateRequest,
    ) -> Result<DonorId, SyncrepError> {
        let mut closing_rx = self.closing.subscribe();
        let mut tries = 0u64;

        let result = loop {
            tries += 1;

            let reply = self
                .gcs
                .request_state_transfer(req.as_bytes(), &self.conf.sst_donor)
                .await;

            if reply.order_seqno != SEQNO_ILL {
                // the group reserved a local-order slot for this request;
                // this node will not apply any group action until joined,
                // so the slot must be skipped by hand
                if self.local_monitor.would_block(reply.order_seqno) {
                    let seconds =
                        self.conf.sst_retry_s * self.conf.monitor_capacity as u64;
                    pf_error!(&self.conf.node_name;
                              "ran out of local monitor resources, seemingly \
                               after requesting state transfer unsuccessfully \
                               for over {} seconds; check that there is at \
                               least one fully synced member in the group",
                              seconds);
                    break Err(SyncrepError::Deadlock);
                }
                self.local_monitor.self_cancel(reply.order_seqno);
            }

            match reply.donor {
                Ok(donor) => {
                    if tries == 1 {
                        pf_info!(&self.conf.node_name;
                                 "requesting state transfer: success, \
                                  donor: {}", donor);
                    } else {
                        pf_info!(&self.conf.node_name;
                                 "requesting state transfer: success after \
                                  {} tries, donor: {}", tries, donor);
                    }
                    break Ok(donor);
                }
                Err(e) if e.is_retryable() => {
                    if tries == 1 {
                        pf_info!(&self.conf.node_name;
                                 "requesting state transfer failed: {}; \
                                  will keep retrying every {} second(s)",
                                 e, self.conf.sst_retry_s);
                    }
                    tokio::select! {
                        _ = time::sleep(Duration::from_secs(
                            self.conf.sst_retry_s)) => {}
                        _ = closing_rx.wait_for(|c| *c) => {
                            break Err(SyncrepError::Cancelled);
                        }
                    }
                }
                Err(e) => {
                    pf_error!(&self.conf.node_name;
                              "requesting state transfer failed: {}", e);
                    break Err(SyncrepError::Gcs(e));
                }
            }
        };

        if let Err(ref e) = result {
            self.set_sst_state(SstState::ReqFailed);
            if self.state().is_operational()
                && !matches!(e, SyncrepError::Cancelled)
            {
                pf_error!(&self.conf.node_name;
                          "state transfer request failed unrecoverably: {}; \
                           most likely unable to communicate with the \
                           cluster primary component, restart required",
                          e);
                panic!("state transfer request failed unrecoverably");
            }
        }
        result
    }

    /// Drain reception events until end-of-stream, applying each writeset
    /// in strict seqno order through the monitors. Writesets marked
    /// already-committed-elsewhere only advance the monitors.
    async fn recv_ist(
        &self,
        event_rx: &mut mpsc::UnboundedReceiver<IstEvent>,
    ) -> Result<(), SyncrepError> {
        while let Some(event) = event_rx.recv().await {
            match event {
                IstEvent::Trx { ws, must_apply } => {
                    if must_apply {
                        let apply_slot =
                            self.apply_monitor.enter(ws.seqno).await?;
                        self.applier.apply(&ws).await?;
                        if !self.conf.commit_order_bypass {
                            let commit_slot =
                                self.commit_monitor.enter(ws.seqno).await?;
                            drop(commit_slot);
                        }
                        drop(apply_slot);
                    } else {
                        self.apply_monitor.self_cancel(ws.seqno);
                        if !self.conf.commit_order_bypass {
                            self.commit_monitor.self_cancel(ws.seqno);
                        }
                    }
                }
                IstEvent::End(0) => return Ok(()),
                IstEvent::End(error) => {
                    return Err(SyncrepError::Msg(format!(
                        "IST reception failed: error {}",
                        error
                    )));
                }
            }
        }
        Err(SyncrepError::msg("IST event channel closed unexpectedly"))
    }
}
