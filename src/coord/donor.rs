//! Donor-side handling of incoming state transfer requests: pin a
//! consistent snapshot moment, decide between a bypassed snapshot with an
//! incremental stream and a full snapshot, and kick off the work.

use std::sync::Arc;

use crate::base::{NodeState, Seqno, TRIVIAL_SST};
use crate::coord::request::{read_state_request, IstRequest};
use crate::coord::Coordinator;
use crate::iface::SeqnoPin;
use crate::utils::SyncrepError;

impl Coordinator {
    /// Called by the group delivery thread with a state transfer request
    /// this node was selected to serve. `seqno_l` is the request's
    /// local-order slot, `donor_seq` the group position pinned for the
    /// donation. Heavy work (the snapshot callback runs the opaque donor
    /// script; the stream runs as a sender task) is delegated; this call
    /// itself is bounded by the monitor drains.
    pub async fn process_state_req(
        &self,
        req: &[u8],
        seqno_l: Seqno,
        donor_seq: Seqno,
    ) -> Result<(), SyncrepError> {
        let local_slot = self.local_monitor.enter(seqno_l).await?;
        self.apply_monitor.drain(donor_seq).await?;
        if !self.conf.commit_order_bypass {
            self.commit_monitor.drain(donor_seq).await?;
        }

        self.shift_to(NodeState::Donor);

        let trivial = req == TRIVIAL_SST;
        if !trivial {
            self.serve_state_req(req, donor_seq).await;
        }

        drop(local_slot);

        if trivial {
            // nothing to transfer; acknowledge the position straight away
            self.gcs.join(donor_seq).await?;
        }
        Ok(())
    }

    /// Parse the request and start the appropriate transfer work. A
    /// malformed request is unrecoverable for a selected donor.
    async fn serve_state_req(&self, req: &[u8], donor_seq: Seqno) {
        let view = match read_state_request(req) {
            Ok(view) => view,
            Err(e) => {
                pf_error!(&self.conf.node_name;
                          "malformed state transfer request: {}; aborting",
                          e);
                panic!("malformed state transfer request");
            }
        };

        if view.has_ist() {
            let istr = match std::str::from_utf8(view.ist())
                .map_err(|e| SyncrepError::Invalid(e.to_string()))
                .and_then(|text| text.parse::<IstRequest>())
            {
                Ok(istr) => istr,
                Err(e) => {
                    pf_error!(&self.conf.node_name;
                              "malformed IST sub-request: {}; aborting", e);
                    panic!("malformed IST sub-request");
                }
            };

            // the stream only makes sense against the same state lineage,
            // and only while the cache still holds the starting seqno
            if istr.uuid == self.current_uuid() {
                pf_info!(&self.conf.node_name; "IST request: {}", istr);
                let first = istr.last_applied + 1;
                match SeqnoPin::acquire(Arc::clone(&self.gcache), first) {
                    Ok(pin) => {
                        self.serve_ist(view.sst(), &istr, pin).await;
                        return;
                    }
                    Err(_) => {
                        pf_info!(&self.conf.node_name;
                                 "IST first seqno {} not found in cache, \
                                  falling back to SST", first);
                    }
                }
            }
        }

        if !view.sst().is_empty() {
            let uuid = self.current_uuid();
            if let Err(e) = self
                .sst_donate
                .donate(view.sst(), &uuid, donor_seq, false)
                .await
            {
                pf_error!(&self.conf.node_name; "SST donation failed: {}", e);
            }
        }
    }

    /// Bypass the snapshot (handshake only) and spawn a sender for the
    /// exact missing range. A sender failure is the joiner's to discover
    /// through its receiver; it never aborts the donor.
    async fn serve_ist(&self, sst_req: &[u8], istr: &IstRequest, pin: SeqnoPin) {
        if let Err(e) = self
            .sst_donate
            .donate(sst_req, &istr.uuid, istr.last_applied, true)
            .await
        {
            pf_warn!(&self.conf.node_name;
                     "bypassed SST callback failed: {}", e);
        }

        self.ist_senders.run(
            self.conf.ist(),
            Arc::clone(&self.gcache),
            &istr.peer,
            istr.last_applied + 1,
            istr.group_seqno,
            self.proto_ver,
            pin,
        );
    }
}
