// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Framing and parsing of invocation records and control messages.
//!
//! An invocation record is an 8-byte header (caller node id and payload
//! length, both little-endian u32) followed by the payload. The first
//! payload byte discriminates the two forms: non-zero begins a
//! NUL-terminated function name, zero is followed by eight bytes of
//! callback reference. Opaque argument bytes fill the remainder either
//! way.

use log::*;

use crate::NodeId;

pub(crate) const HEADER_LEN: usize = 8;

/// The identifier of an outbound invocation.
pub(crate) enum WireId<'a> {
    Name(&'a str),
    Callback(u64),
}

impl WireId<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Name(name) => name.len() + 1,
            Self::Callback(_) => 1 + std::mem::size_of::<u64>(),
        }
    }
}

/// Total record size for an invocation with `args_len` argument bytes.
pub(crate) fn record_len(id: &WireId, args_len: usize) -> usize {
    HEADER_LEN + id.encoded_len() + args_len
}

/// Fill `region` (exactly `record_len` bytes) with one framed
/// invocation.
pub(crate) fn encode_record(region: &mut [u8], node_id: NodeId, id: &WireId, args: &[u8]) {
    let payload_len = id.encoded_len() + args.len();
    debug_assert_eq!(region.len(), HEADER_LEN + payload_len);

    region[0..4].copy_from_slice(&node_id.to_le_bytes());
    region[4..8].copy_from_slice(&(payload_len as u32).to_le_bytes());

    let payload = &mut region[HEADER_LEN..];
    match id {
        WireId::Name(name) => {
            payload[..name.len()].copy_from_slice(name.as_bytes());
            payload[name.len()] = 0;
            payload[name.len() + 1..].copy_from_slice(args);
        }
        WireId::Callback(reference) => {
            payload[0] = 0;
            payload[1..9].copy_from_slice(&reference.to_le_bytes());
            payload[9..].copy_from_slice(args);
        }
    }
}

pub(crate) enum Identifier<'a> {
    Named(&'a str),
    Callback(u64),
}

pub(crate) struct Record<'a> {
    pub node_id: NodeId,
    pub identifier: Identifier<'a>,
    pub args: &'a [u8],
}

pub(crate) enum ParseOutcome<'a> {
    Call(Record<'a>),

    /// The record was malformed; it has been logged and the consumed
    /// count steps past it.
    Skip,
}

/// Parse the record at the front of `data`. Returns the outcome and how
/// many bytes were consumed: a well-framed record consumes exactly
/// header plus payload; truncated input is consumed whole so the caller
/// can never spin on a bad buffer.
pub(crate) fn parse_record(data: &[u8]) -> (ParseOutcome, usize) {
    if data.len() < HEADER_LEN {
        warn!("Record header too short: wanted {HEADER_LEN} bytes, got {}", data.len());
        return (ParseOutcome::Skip, data.len());
    }

    let node_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let payload_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

    if data.len() - HEADER_LEN < payload_len {
        warn!(
            "Record payload too short: wanted {payload_len} bytes, got {}",
            data.len() - HEADER_LEN
        );
        return (ParseOutcome::Skip, data.len());
    }

    let consumed = HEADER_LEN + payload_len;
    let payload = &data[HEADER_LEN..consumed];

    let Some((&first, _)) = payload.split_first() else {
        warn!("Record from node 0x{node_id:X} carries no identifier");
        return (ParseOutcome::Skip, consumed);
    };

    if first != 0 {
        let Some(nul) = payload.iter().position(|&b| b == 0) else {
            warn!("Unterminated function name from node 0x{node_id:X}");
            return (ParseOutcome::Skip, consumed);
        };

        let Ok(name) = std::str::from_utf8(&payload[..nul]) else {
            warn!("Undecodable function name from node 0x{node_id:X}");
            return (ParseOutcome::Skip, consumed);
        };

        let record = Record {
            node_id,
            identifier: Identifier::Named(name),
            args: &payload[nul + 1..],
        };
        return (ParseOutcome::Call(record), consumed);
    }

    if payload.len() < 9 {
        warn!("Callback record from node 0x{node_id:X} shorter than its reference");
        return (ParseOutcome::Skip, consumed);
    }

    let reference = u64::from_le_bytes(payload[1..9].try_into().unwrap());
    let record = Record {
        node_id,
        identifier: Identifier::Callback(reference),
        args: &payload[9..],
    };
    (ParseOutcome::Call(record), consumed)
}

/// Frame a control message: the advertiser's node id followed by the
/// NUL-terminated function name. The control channel's framing conveys
/// the total length.
pub(crate) fn encode_control(node_id: NodeId, name: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(4 + name.len() + 1);
    message.extend_from_slice(&node_id.to_le_bytes());
    message.extend_from_slice(name.as_bytes());
    message.push(0);
    message
}

pub(crate) fn parse_control(payload: &[u8]) -> Option<(NodeId, &str)> {
    if payload.len() < 5 {
        return None;
    }

    let node_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let name = &payload[4..];
    let nul = name.iter().position(|&b| b == 0)?;
    let name = std::str::from_utf8(&name[..nul]).ok()?;

    Some((node_id, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(node_id: NodeId, id: &WireId, args: &[u8]) -> Vec<u8> {
        let mut wire = vec![0; record_len(id, args.len())];
        encode_record(&mut wire, node_id, id, args);
        wire
    }

    #[test]
    fn named_record_round_trip() {
        let wire = encode(42, &WireId::Name("loopback"), b"args");

        let (outcome, consumed) = parse_record(&wire);
        assert_eq!(consumed, wire.len());
        let ParseOutcome::Call(record) = outcome else {
            panic!("expected a call");
        };

        assert_eq!(record.node_id, 42);
        assert!(matches!(record.identifier, Identifier::Named("loopback")));
        assert_eq!(record.args, b"args");
    }

    #[test]
    fn callback_record_round_trip() {
        let wire = encode(7, &WireId::Callback(0xDEAD_BEEF_0000_0001), b"reply");

        let (outcome, consumed) = parse_record(&wire);
        assert_eq!(consumed, wire.len());
        let ParseOutcome::Call(record) = outcome else {
            panic!("expected a call");
        };

        assert_eq!(record.node_id, 7);
        assert!(matches!(record.identifier, Identifier::Callback(0xDEAD_BEEF_0000_0001)));
        assert_eq!(record.args, b"reply");
    }

    #[test]
    fn bundled_records_consume_exactly() {
        let mut wire = encode(1, &WireId::Name("first"), b"a");
        let second = encode(1, &WireId::Callback(9), b"bb");
        wire.extend_from_slice(&second);

        let (_, consumed) = parse_record(&wire);
        assert_eq!(consumed, wire.len() - second.len());

        let (outcome, rest) = parse_record(&wire[consumed..]);
        assert_eq!(rest, second.len());
        assert!(matches!(
            outcome,
            ParseOutcome::Call(Record {
                identifier: Identifier::Callback(9),
                ..
            })
        ));
    }

    #[test]
    fn truncated_header_consumes_whole_input() {
        let (outcome, consumed) = parse_record(&[1, 2, 3]);
        assert!(matches!(outcome, ParseOutcome::Skip));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn truncated_payload_consumes_whole_input() {
        let mut wire = encode(5, &WireId::Name("f"), b"xyz");
        wire.truncate(wire.len() - 2);

        let (outcome, consumed) = parse_record(&wire);
        assert!(matches!(outcome, ParseOutcome::Skip));
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn runt_callback_payload_is_skipped_not_spun_on() {
        // Payload claims one zero byte and nothing else: no room for a
        // callback reference.
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.push(0);

        let (outcome, consumed) = parse_record(&wire);
        assert!(matches!(outcome, ParseOutcome::Skip));
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn control_message_round_trip() {
        let message = encode_control(99, "set_value");
        assert_eq!(parse_control(&message), Some((99, "set_value")));
    }

    #[test]
    fn control_message_without_terminator_is_rejected() {
        let mut message = encode_control(99, "set_value");
        message.pop();
        assert_eq!(parse_control(&message), None);
    }
}
