//! HTCP datagram decoding.
//!
//! Only CLR (opcode 4) frames are accepted; the data section carries a
//! length-prefixed method, which is skipped, followed by the length-prefixed
//! URL to purge.

use bytes::Buf;
use thiserror::Error;

use crate::metrics::{Metrics, PacketState};

/// Minimum size of a frame we are willing to look at.
pub const MIN_HTCP_LEN: usize = 20;

/// Offset of the opcode byte within the HTCP header.
const OPCODE_OFFSET: usize = 6;
/// CLR: remove the named URL from cache.
const OPCODE_CLR: u8 = 4;
/// Start of the CLR data section (method length field).
const DATA_OFFSET: usize = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HtcpError {
    #[error("rejecting HTCP packet, size {0} smaller than {MIN_HTCP_LEN}")]
    TooShort(usize),
    #[error("rejecting HTCP packet, no CLR opcode")]
    NoClrOpcode,
    #[error("rejecting HTCP packet, URL len is zero")]
    EmptyUrl,
    #[error("rejecting HTCP packet, data section truncated")]
    Truncated,
    #[error("rejecting HTCP packet, URL is not valid UTF-8")]
    InvalidUtf8,
}

/// Extract the URL to purge from one HTCP datagram.
///
/// `n` is the number of bytes actually received into `buffer`. The packet is
/// counted as good or bad on the `purged_htcp_packets_total` counter; no
/// other side effects.
pub fn extract_url<'a>(
    buffer: &'a [u8],
    n: usize,
    metrics: &Metrics,
) -> Result<&'a str, HtcpError> {
    match parse(buffer, n) {
        Ok(url) => {
            metrics.inc_htcp_packet(PacketState::Good);
            Ok(url)
        }
        Err(err) => {
            metrics.inc_htcp_packet(PacketState::Bad);
            Err(err)
        }
    }
}

fn parse(buffer: &[u8], n: usize) -> Result<&str, HtcpError> {
    if n < MIN_HTCP_LEN {
        return Err(HtcpError::TooShort(n));
    }
    let datagram = buffer.get(..n).ok_or(HtcpError::Truncated)?;

    if datagram[OPCODE_OFFSET] != OPCODE_CLR {
        return Err(HtcpError::NoClrOpcode);
    }

    let mut data = &datagram[DATA_OFFSET..];
    let method_len = data.get_u16() as usize;
    if data.remaining() < method_len + 2 {
        return Err(HtcpError::Truncated);
    }
    data.advance(method_len);

    let url_len = data.get_u16() as usize;
    if url_len == 0 {
        return Err(HtcpError::EmptyUrl);
    }
    if data.remaining() < url_len {
        return Err(HtcpError::Truncated);
    }

    std::str::from_utf8(&data[..url_len]).map_err(|_| HtcpError::InvalidUtf8)
}
