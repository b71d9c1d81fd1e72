//! Versioned state transfer request framing.
//!
//! Two request layouts travel through group communication:
//!   - v0: the entire buffer is the opaque SST payload; IST absent.
//!   - v1: magic `"STRv1\0"`, then big-endian `u32` length-prefixed SST
//!     bytes, then `u32` length-prefixed IST bytes.
//!
//! Integer field widths, byte order, and the trailing NUL of the magic are
//! part of the on-wire contract. Lengths are read byte-wise; the buffer
//! carries no alignment guarantees.

use std::fmt;
use std::str::FromStr;

use crate::base::{GroupUuid, Seqno};
use crate::utils::SyncrepError;

/// Magic signature opening a v1 request, including the trailing NUL.
const MAGIC: &[u8] = b"STRv1\0";

/// Bytes of the magic that participate in version dispatch.
const MAGIC_SIG: usize = 5;

/// Width of a length field.
const LEN_FIELD: usize = 4;

/// An owned, encoded state transfer request ready for submission.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StateRequest {
    version: u8,
    buf: Vec<u8>,
}

impl StateRequest {
    /// Encode a v0 request: the SST payload travels bare.
    pub fn v0(sst: &[u8]) -> Self {
        StateRequest {
            version: 0,
            buf: sst.to_vec(),
        }
    }

    /// Encode a v1 request carrying both an SST payload and an IST
    /// sub-request. Either may be empty.
    pub fn v1(sst: &[u8], ist: &[u8]) -> Result<Self, SyncrepError> {
        if sst.len() > i32::MAX as usize {
            return Err(SyncrepError::MessageTooLong(sst.len()));
        }
        if ist.len() > i32::MAX as usize {
            return Err(SyncrepError::MessageTooLong(ist.len()));
        }

        let mut buf = Vec::with_capacity(
            MAGIC.len() + 2 * LEN_FIELD + sst.len() + ist.len(),
        );
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(sst.len() as u32).to_be_bytes());
        buf.extend_from_slice(sst);
        buf.extend_from_slice(&(ist.len() as u32).to_be_bytes());
        buf.extend_from_slice(ist);

        Ok(StateRequest { version: 1, buf })
    }

    /// Encoded request bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Request framing version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }
}

/// A parsed view into a request buffer. Borrows the buffer; owns nothing.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StateRequestView<'a> {
    version: u8,
    sst: &'a [u8],
    ist: &'a [u8],
}

impl<'a> StateRequestView<'a> {
    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// SST payload slice (may be empty).
    #[inline]
    pub fn sst(&self) -> &'a [u8] {
        self.sst
    }

    /// IST sub-request slice; empty when absent.
    #[inline]
    pub fn ist(&self) -> &'a [u8] {
        self.ist
    }

    /// Whether an IST sub-request is present.
    #[inline]
    pub fn has_ist(&self) -> bool {
        !self.ist.is_empty()
    }
}

/// Read a big-endian `u32` length field at `offset`, byte-wise.
fn read_len(buf: &[u8], offset: usize) -> Result<usize, SyncrepError> {
    let bytes: [u8; LEN_FIELD] = buf[offset..offset + LEN_FIELD]
        .try_into()
        .map_err(|_| SyncrepError::Invalid("length field truncated".into()))?;
    let len = u32::from_be_bytes(bytes);
    if len > i32::MAX as u32 {
        return Err(SyncrepError::Invalid(format!(
            "length field {} unrepresentable",
            len
        )));
    }
    Ok(len as usize)
}

/// Parse a request buffer, dispatching on the v1 magic. A buffer that does
/// not open with the magic is a v0 request in its entirety.
pub fn read_state_request(
    buf: &[u8],
) -> Result<StateRequestView<'_>, SyncrepError> {
    if buf.len() > MAGIC_SIG && buf[..MAGIC_SIG] == MAGIC[..MAGIC_SIG] {
        parse_v1(buf)
    } else {
        Ok(StateRequestView {
            version: 0,
            sst: buf,
            ist: &[],
        })
    }
}

fn parse_v1(buf: &[u8]) -> Result<StateRequestView<'_>, SyncrepError> {
    if buf.len() < MAGIC_SIG || buf[..MAGIC_SIG] != MAGIC[..MAGIC_SIG] {
        return Err(SyncrepError::Invalid(
            "wrong magic signature in state request v1".into(),
        ));
    }
    let sst_off = MAGIC.len();
    if sst_off + 2 * LEN_FIELD > buf.len() {
        return Err(SyncrepError::Invalid(format!(
            "state request too short: {}, must be at least {}",
            buf.len(),
            sst_off + 2 * LEN_FIELD
        )));
    }

    let sst_len = read_len(buf, sst_off)?;
    if sst_off + LEN_FIELD + sst_len + LEN_FIELD > buf.len() {
        return Err(SyncrepError::Invalid(format!(
            "malformed state request v1: sst length {}, total length {}",
            sst_len,
            buf.len()
        )));
    }

    let ist_off = sst_off + LEN_FIELD + sst_len;
    let ist_len = read_len(buf, ist_off)?;
    if ist_off + LEN_FIELD + ist_len != buf.len() {
        return Err(SyncrepError::Invalid(format!(
            "malformed state request v1: parsed field lengths {} + {} do \
             not reconcile with total length {}",
            sst_len,
            ist_len,
            buf.len()
        )));
    }

    Ok(StateRequestView {
        version: 1,
        sst: &buf[sst_off + LEN_FIELD..ist_off],
        ist: &buf[ist_off + LEN_FIELD..],
    })
}

/// IST sub-request carried as printable text inside a v1 state request:
/// `<state_uuid>:<last_applied>:<group_seqno>:<peer_listen_addr>`. The
/// peer address is everything after the third separator and may itself
/// contain `:` characters.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct IstRequest {
    pub uuid: GroupUuid,
    pub last_applied: Seqno,
    pub group_seqno: Seqno,
    pub peer: String,
}

impl fmt::Display for IstRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.uuid, self.last_applied, self.group_seqno, self.peer
        )
    }
}

impl FromStr for IstRequest {
    type Err = SyncrepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(4, ':');
        let mut next = || {
            fields
                .next()
                .ok_or_else(|| {
                    SyncrepError::Invalid(format!("bad ist request '{}'", s))
                })
        };

        let uuid = GroupUuid::parse_str(next()?)
            .map_err(|e| SyncrepError::Invalid(format!("bad uuid: {}", e)))?;
        let last_applied: Seqno = next()?.parse().map_err(|e| {
            SyncrepError::Invalid(format!("bad last_applied: {}", e))
        })?;
        let group_seqno: Seqno = next()?.parse().map_err(|e| {
            SyncrepError::Invalid(format!("bad group_seqno: {}", e))
        })?;
        let peer = next()?.to_string();
        if peer.is_empty() {
            return Err(SyncrepError::Invalid(format!(
                "bad ist request '{}': empty peer",
                s
            )));
        }

        Ok(IstRequest {
            uuid,
            last_applied,
            group_seqno,
            peer,
        })
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;

    #[test]
    fn v1_round_trip() -> Result<(), SyncrepError> {
        let sst = b"xtrabackup-v2\0auth=foo";
        let ist = b"deadbeef:100:105:10.0.0.1:4568";
        let req = StateRequest::v1(sst, ist)?;
        assert_eq!(req.version(), 1);

        let view = read_state_request(req.as_bytes())?;
        assert_eq!(view.version(), 1);
        assert_eq!(view.sst(), sst);
        assert_eq!(view.ist(), ist);
        assert!(view.has_ist());
        Ok(())
    }

    #[test]
    fn v1_zero_length_sst() -> Result<(), SyncrepError> {
        let req = StateRequest::v1(b"", b"some-ist")?;
        let view = read_state_request(req.as_bytes())?;
        assert_eq!(view.sst(), b"");
        assert_eq!(view.ist(), b"some-ist");
        assert!(view.has_ist());
        Ok(())
    }

    #[test]
    fn v1_zero_length_ist() -> Result<(), SyncrepError> {
        let req = StateRequest::v1(b"sst-script", b"")?;
        let view = read_state_request(req.as_bytes())?;
        assert_eq!(view.sst(), b"sst-script");
        assert!(!view.has_ist());
        Ok(())
    }

    #[test]
    fn v0_accepts_any_buffer() -> Result<(), SyncrepError> {
        let raw = b"any old sst request bytes \x00\x01\x02";
        let view = read_state_request(raw)?;
        assert_eq!(view.version(), 0);
        assert_eq!(view.sst(), raw);
        assert!(!view.has_ist());
        Ok(())
    }

    #[test]
    fn v1_parser_requires_magic() {
        let req = StateRequest::v0(b"no magic here");
        assert!(matches!(
            parse_v1(req.as_bytes()),
            Err(SyncrepError::Invalid(_))
        ));
    }

    #[test]
    fn magic_without_structure_is_invalid() {
        // opens with the magic signature but is far too short for v1
        let raw = b"STRv1\0\x00";
        assert!(matches!(
            read_state_request(raw),
            Err(SyncrepError::Invalid(_))
        ));
    }

    #[test]
    fn sst_length_overrun_is_invalid() {
        let req = StateRequest::v1(b"abcd", b"efgh").unwrap();
        let mut buf = req.as_bytes().to_vec();
        // inflate the declared sst length past the buffer end
        buf[MAGIC.len()..MAGIC.len() + LEN_FIELD]
            .copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(
            read_state_request(&buf),
            Err(SyncrepError::Invalid(_))
        ));
    }

    #[test]
    fn length_reconciliation_is_exact() {
        let req = StateRequest::v1(b"abcd", b"efgh").unwrap();
        let mut buf = req.as_bytes().to_vec();
        buf.push(0); // one trailing byte breaks the exact sum
        assert!(matches!(
            read_state_request(&buf),
            Err(SyncrepError::Invalid(_))
        ));
    }

    #[test]
    fn negative_length_field_is_invalid() {
        let req = StateRequest::v1(b"abcd", b"").unwrap();
        let mut buf = req.as_bytes().to_vec();
        // set the sign bit of the sst length field
        buf[MAGIC.len()..MAGIC.len() + LEN_FIELD]
            .copy_from_slice(&0x8000_0004u32.to_be_bytes());
        assert!(matches!(
            read_state_request(&buf),
            Err(SyncrepError::Invalid(_))
        ));
    }

    #[test]
    fn ist_request_text_round_trip() -> Result<(), SyncrepError> {
        let istr = IstRequest {
            uuid: GroupUuid::new_v4(),
            last_applied: 100,
            group_seqno: 105,
            peer: "10.0.0.1:4568".into(),
        };
        let parsed: IstRequest = istr.to_string().parse()?;
        assert_eq!(parsed, istr);
        Ok(())
    }

    #[test]
    fn ist_request_peer_with_colons() -> Result<(), SyncrepError> {
        let istr = IstRequest {
            uuid: GroupUuid::new_v4(),
            last_applied: -1,
            group_seqno: 7,
            peer: "[::1]:4568".into(),
        };
        let parsed: IstRequest = istr.to_string().parse()?;
        assert_eq!(parsed.peer, "[::1]:4568");
        assert_eq!(parsed.last_applied, -1);
        Ok(())
    }

    #[test]
    fn ist_request_garbage_rejected() {
        assert!("not-a-uuid:1:2:peer".parse::<IstRequest>().is_err());
        assert!("".parse::<IstRequest>().is_err());
        let uuid = GroupUuid::new_v4();
        assert!(format!("{}:1:2:", uuid).parse::<IstRequest>().is_err());
        assert!(format!("{}:x:2:peer", uuid).parse::<IstRequest>().is_err());
    }
}
