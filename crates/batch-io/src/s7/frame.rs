//! S7comm telegram encoding on top of RFC1006 (TPKT) and ISO 8073 (COTP).
//!
//! Every function works on complete frames, TPKT header included, so the client only
//! has to move bytes. Offsets used below:
//!
//! ```text
//! [0..4]   TPKT   03 00 len_hi len_lo
//! [4..7]   COTP   02 F0 80            (data transfer, last unit)
//! [7..17]  S7     32 rosctr red(2) pdu_ref(2) param_len(2) data_len(2)
//! [17..19] S7     error class, error code       (ack-data only)
//! ```

use batch_core::{S7Address, S7Width, TagValue};
use thiserror::Error;

pub const ISO_TCP_PORT: u16 = 102;
pub const TPKT_HEADER_LEN: usize = 4;
pub const DEFAULT_PDU_LENGTH: u16 = 480;
/// Bound from the S7 protocol on variables in one Read Var job.
pub const MAX_ITEMS_PER_JOB: usize = 20;

const TPKT_VERSION: u8 = 0x03;
const COTP_CONNECT_REQUEST: u8 = 0xE0;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: u8 = 0xF0;
const COTP_EOT: u8 = 0x80;

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;

const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;
const FN_SETUP_COMM: u8 = 0xF0;

const VAR_SPEC: u8 = 0x12;
const VAR_SPEC_LEN: u8 = 0x0A;
const SYNTAX_S7ANY: u8 = 0x10;

const TRANSPORT_BIT: u8 = 0x01;
const TRANSPORT_BYTE: u8 = 0x02;
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE: u8 = 0x04;
const DATA_TS_INT: u8 = 0x05;

pub const RETURN_SUCCESS: u8 = 0xFF;
const RETURN_INVALID_ADDRESS: u8 = 0x05;
const RETURN_TYPE_NOT_SUPPORTED: u8 = 0x06;
const RETURN_TYPE_INCONSISTENT: u8 = 0x07;
const RETURN_NOT_FOUND: u8 = 0x0A;

const COTP_DT_LEN: usize = 3;
const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;
const ITEM_SPEC_LEN: usize = 12;
const PARAM_OFFSET: usize = TPKT_HEADER_LEN + COTP_DT_LEN + ACK_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum S7Error {
    #[error("invalid TPKT header")]
    BadTpkt,

    #[error("invalid COTP header")]
    BadCotp,

    #[error("connection refused by PLC (COTP type {0:#04x})")]
    ConnectRefused(u8),

    #[error("truncated telegram: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("not an S7 telegram")]
    NotS7,

    #[error("PLC reported error class {class:#04x} code {code:#04x}")]
    Header { class: u8, code: u8 },

    #[error("unexpected function {0:#04x} in response")]
    UnexpectedFunction(u8),

    #[error("response carries {got} items, expected {expected}")]
    ItemCount { expected: usize, got: usize },

    #[error("response PDU reference {got} does not match request {expected}")]
    PduRef { expected: u16, got: u16 },

    #[error("PDU negotiation returned length 0")]
    PduNegotiation,
}

/// Human readable text for a per-item return code.
pub fn describe_return_code(code: u8) -> &'static str {
    match code {
        RETURN_SUCCESS => "success",
        RETURN_INVALID_ADDRESS => "address out of range",
        RETURN_TYPE_NOT_SUPPORTED => "data type not supported",
        RETURN_TYPE_INCONSISTENT => "data type inconsistent",
        RETURN_NOT_FOUND => "object does not exist",
        _ => "hardware fault",
    }
}

/// Prefix `cotp_and_payload` with a TPKT header.
fn tpkt(cotp_and_payload: &[u8]) -> Vec<u8> {
    let len = (cotp_and_payload.len() + TPKT_HEADER_LEN) as u16;
    let mut frame = Vec::with_capacity(len as usize);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(cotp_and_payload);
    frame
}

/// Total frame length announced by a TPKT header.
pub fn frame_length(header: &[u8; TPKT_HEADER_LEN]) -> Result<usize, S7Error> {
    if header[0] != TPKT_VERSION {
        return Err(S7Error::BadTpkt);
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len < TPKT_HEADER_LEN + COTP_DT_LEN {
        return Err(S7Error::BadTpkt);
    }
    Ok(len)
}

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(COTP_DT_LEN + JOB_HEADER_LEN + params.len() + data.len());
    body.extend_from_slice(&[0x02, COTP_DATA, COTP_EOT]);
    body.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    body.extend_from_slice(&pdu_ref.to_be_bytes());
    body.extend_from_slice(&(params.len() as u16).to_be_bytes());
    body.extend_from_slice(&(data.len() as u16).to_be_bytes());
    body.extend_from_slice(params);
    body.extend_from_slice(data);
    tpkt(&body)
}

pub fn encode_connect_request(local_tsap: u16, remote_tsap: u16) -> Vec<u8> {
    let [lh, ll] = local_tsap.to_be_bytes();
    let [rh, rl] = remote_tsap.to_be_bytes();
    tpkt(&[
        0x11,
        COTP_CONNECT_REQUEST,
        0x00,
        0x00, // destination reference
        0x00,
        0x01, // source reference
        0x00, // class 0
        0xC0,
        0x01,
        0x0A, // TPDU size 1024
        0xC1,
        0x02,
        lh,
        ll,
        0xC2,
        0x02,
        rh,
        rl,
    ])
}

pub fn check_connect_confirm(frame: &[u8]) -> Result<(), S7Error> {
    need(frame, TPKT_HEADER_LEN + 2)?;
    if frame[0] != TPKT_VERSION {
        return Err(S7Error::BadTpkt);
    }
    match frame[5] {
        COTP_CONNECT_CONFIRM => Ok(()),
        other => Err(S7Error::ConnectRefused(other)),
    }
}

pub fn encode_setup_comm(pdu_ref: u16, pdu_length: u16) -> Vec<u8> {
    let [ph, pl] = pdu_length.to_be_bytes();
    job(
        pdu_ref,
        &[FN_SETUP_COMM, 0x00, 0x00, 0x01, 0x00, 0x01, ph, pl],
        &[],
    )
}

/// Returns the PDU length granted by the PLC.
pub fn decode_setup_comm(frame: &[u8], pdu_ref: u16) -> Result<u16, S7Error> {
    check_ack(frame, pdu_ref, FN_SETUP_COMM)?;
    need(frame, PARAM_OFFSET + 8)?;
    let granted = u16::from_be_bytes([frame[PARAM_OFFSET + 6], frame[PARAM_OFFSET + 7]]);
    if granted == 0 {
        return Err(S7Error::PduNegotiation);
    }
    Ok(granted)
}

/// How many of our items fit one Read Var job. Items are at most four bytes, so the
/// response bound is 4 header bytes + 4 data bytes per item.
pub fn max_items_per_read(pdu_length: u16) -> usize {
    let pdu = pdu_length as usize;
    let by_request = pdu.saturating_sub(JOB_HEADER_LEN + 2) / ITEM_SPEC_LEN;
    let by_response = pdu.saturating_sub(ACK_HEADER_LEN + 2) / 8;
    by_request.min(by_response).clamp(1, MAX_ITEMS_PER_JOB)
}

fn item_spec(addr: &S7Address) -> [u8; ITEM_SPEC_LEN] {
    let (transport, count) = match addr.width {
        S7Width::Bit(_) => (TRANSPORT_BIT, 1u16),
        width => (TRANSPORT_BYTE, width.size_bytes() as u16),
    };
    let [ch, cl] = count.to_be_bytes();
    let [dh, dl] = addr.db.to_be_bytes();
    let start = addr.bit_address();
    [
        VAR_SPEC,
        VAR_SPEC_LEN,
        SYNTAX_S7ANY,
        transport,
        ch,
        cl,
        dh,
        dl,
        addr.area.code(),
        ((start >> 16) & 0xFF) as u8,
        ((start >> 8) & 0xFF) as u8,
        (start & 0xFF) as u8,
    ]
}

pub fn encode_read_request(pdu_ref: u16, items: &[S7Address]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + items.len() * ITEM_SPEC_LEN);
    params.push(FN_READ_VAR);
    params.push(items.len() as u8);
    for item in items {
        params.extend_from_slice(&item_spec(item));
    }
    job(pdu_ref, &params, &[])
}

/// Per-item payloads of a Read Var response; `Err` carries the item's return code.
pub fn decode_read_response(
    frame: &[u8],
    pdu_ref: u16,
    expected_items: usize,
) -> Result<Vec<Result<Vec<u8>, u8>>, S7Error> {
    check_ack(frame, pdu_ref, FN_READ_VAR)?;
    need(frame, PARAM_OFFSET + 2)?;
    let count = frame[PARAM_OFFSET + 1] as usize;
    if count != expected_items {
        return Err(S7Error::ItemCount {
            expected: expected_items,
            got: count,
        });
    }

    let mut items = Vec::with_capacity(count);
    let mut pos = PARAM_OFFSET + 2;
    for index in 0..count {
        need(frame, pos + 4)?;
        let code = frame[pos];
        let transport = frame[pos + 1];
        let raw_len = u16::from_be_bytes([frame[pos + 2], frame[pos + 3]]) as usize;
        let len = match transport {
            DATA_TS_BIT | DATA_TS_BYTE | DATA_TS_INT => raw_len.div_ceil(8),
            _ => raw_len,
        };
        pos += 4;

        if code != RETURN_SUCCESS {
            items.push(Err(code));
            continue;
        }
        need(frame, pos + len)?;
        items.push(Ok(frame[pos..pos + len].to_vec()));
        pos += len;
        // Odd-length payloads are padded, except on the final item.
        if len % 2 == 1 && index + 1 < count {
            pos += 1;
        }
    }
    Ok(items)
}

pub fn encode_write_request(pdu_ref: u16, addr: &S7Address, payload: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + ITEM_SPEC_LEN);
    params.extend_from_slice(&[FN_WRITE_VAR, 0x01]);
    params.extend_from_slice(&item_spec(addr));

    let (transport, bits) = match addr.width {
        S7Width::Bit(_) => (DATA_TS_BIT, 1u16),
        _ => (DATA_TS_BYTE, (payload.len() * 8) as u16),
    };
    let mut data = Vec::with_capacity(4 + payload.len());
    data.extend_from_slice(&[0x00, transport]);
    data.extend_from_slice(&bits.to_be_bytes());
    data.extend_from_slice(payload);
    job(pdu_ref, &params, &data)
}

/// Outer `Err` is a malformed telegram, inner `Err` the item's return code.
pub fn decode_write_response(frame: &[u8], pdu_ref: u16) -> Result<Result<(), u8>, S7Error> {
    check_ack(frame, pdu_ref, FN_WRITE_VAR)?;
    need(frame, PARAM_OFFSET + 3)?;
    match frame[PARAM_OFFSET + 2] {
        RETURN_SUCCESS => Ok(Ok(())),
        code => Ok(Err(code)),
    }
}

/// Big-endian wire bytes for a value at `width`. Words and dwords are signed.
pub fn encode_value(width: S7Width, value: TagValue) -> Option<Vec<u8>> {
    match (width, value) {
        (S7Width::Bit(_), TagValue::Bool(b)) => Some(vec![b as u8]),
        (S7Width::Byte, TagValue::Int(v)) => u8::try_from(v).ok().map(|b| vec![b]),
        (S7Width::Word, TagValue::Int(v)) => {
            i16::try_from(v).ok().map(|w| w.to_be_bytes().to_vec())
        }
        (S7Width::DWord, TagValue::Int(v)) => {
            i32::try_from(v).ok().map(|d| d.to_be_bytes().to_vec())
        }
        _ => None,
    }
}

pub fn decode_value(width: S7Width, bytes: &[u8]) -> Option<TagValue> {
    match width {
        S7Width::Bit(_) => bytes.first().map(|b| TagValue::Bool(b & 0x01 != 0)),
        S7Width::Byte => bytes.first().map(|b| TagValue::Int(*b as i64)),
        S7Width::Word => {
            let raw: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
            Some(TagValue::Int(i16::from_be_bytes(raw) as i64))
        }
        S7Width::DWord => {
            let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
            Some(TagValue::Int(i32::from_be_bytes(raw) as i64))
        }
    }
}

fn need(frame: &[u8], len: usize) -> Result<(), S7Error> {
    if frame.len() < len {
        return Err(S7Error::Truncated {
            need: len,
            got: frame.len(),
        });
    }
    Ok(())
}

fn check_ack(frame: &[u8], pdu_ref: u16, function: u8) -> Result<(), S7Error> {
    need(frame, TPKT_HEADER_LEN + COTP_DT_LEN + JOB_HEADER_LEN)?;
    if frame[0] != TPKT_VERSION {
        return Err(S7Error::BadTpkt);
    }
    if frame[4] != 0x02 || frame[5] != COTP_DATA {
        return Err(S7Error::BadCotp);
    }
    if frame[7] != S7_PROTOCOL_ID {
        return Err(S7Error::NotS7);
    }
    let rosctr = frame[8];
    if rosctr != ROSCTR_ACK && rosctr != ROSCTR_ACK_DATA {
        return Err(S7Error::NotS7);
    }
    need(frame, PARAM_OFFSET)?;
    let (class, code) = (frame[17], frame[18]);
    if class != 0 || code != 0 {
        return Err(S7Error::Header { class, code });
    }
    let got = u16::from_be_bytes([frame[11], frame[12]]);
    if got != pdu_ref {
        return Err(S7Error::PduRef {
            expected: pdu_ref,
            got,
        });
    }
    need(frame, PARAM_OFFSET + 1)?;
    if frame[PARAM_OFFSET] != function {
        return Err(S7Error::UnexpectedFunction(frame[PARAM_OFFSET]));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use batch_core::{PhysicalAddress, Protocol};

    pub(crate) fn s7(text: &str) -> S7Address {
        match PhysicalAddress::parse(Protocol::S7, text).unwrap() {
            PhysicalAddress::S7(addr) => addr,
            other => panic!("not an S7 address: {other:?}"),
        }
    }

    /// Builds an ack-data frame the way a PLC would.
    pub(crate) fn ack(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut body = vec![0x02, COTP_DATA, COTP_EOT, S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0, 0];
        body.extend_from_slice(&pdu_ref.to_be_bytes());
        body.extend_from_slice(&(params.len() as u16).to_be_bytes());
        body.extend_from_slice(&(data.len() as u16).to_be_bytes());
        body.extend_from_slice(&[0x00, 0x00]);
        body.extend_from_slice(params);
        body.extend_from_slice(data);
        tpkt(&body)
    }

    #[test]
    fn connect_request_layout() {
        let frame = encode_connect_request(0x0100, 0x0102);
        assert_eq!(frame.len(), 22);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x16]);
        assert_eq!(frame[5], COTP_CONNECT_REQUEST);
        assert_eq!(&frame[14..18], &[0xC1, 0x02, 0x01, 0x00]);
        assert_eq!(&frame[18..22], &[0xC2, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn connect_confirm_is_checked() {
        let mut confirm = encode_connect_request(0x0100, 0x0102);
        confirm[5] = COTP_CONNECT_CONFIRM;
        assert!(check_connect_confirm(&confirm).is_ok());
        confirm[5] = 0x80;
        assert_eq!(
            check_connect_confirm(&confirm),
            Err(S7Error::ConnectRefused(0x80))
        );
    }

    #[test]
    fn setup_comm_roundtrip_with_plc_reply() {
        let frame = encode_setup_comm(1, 480);
        assert_eq!(frame.len(), 25);
        assert_eq!(&frame[23..25], &[0x01, 0xE0]);

        let reply = ack(1, &[FN_SETUP_COMM, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0], &[]);
        assert_eq!(reply.len(), 27);
        assert_eq!(decode_setup_comm(&reply, 1), Ok(240));
    }

    #[test]
    fn read_request_layout() {
        let frame = encode_read_request(7, &[s7("VW0"), s7("V8.1")]);
        assert_eq!(frame.len(), 7 + 10 + 2 + 24);
        assert_eq!(&frame[11..13], &[0x00, 0x07]);
        assert_eq!(&frame[13..15], &[0x00, 26]);
        assert_eq!(&frame[17..19], &[FN_READ_VAR, 2]);
        // VW0: byte transport, two bytes, DB1, area 0x84, address 0.
        assert_eq!(
            &frame[19..31],
            &[0x12, 0x0A, 0x10, 0x02, 0x00, 0x02, 0x00, 0x01, 0x84, 0x00, 0x00, 0x00]
        );
        // V8.1: bit transport, one element, bit address 65.
        assert_eq!(
            &frame[31..43],
            &[0x12, 0x0A, 0x10, 0x01, 0x00, 0x01, 0x00, 0x01, 0x84, 0x00, 0x00, 0x41]
        );
    }

    #[test]
    fn read_response_with_failed_item() {
        let data = [
            0xFF, DATA_TS_BYTE, 0x00, 0x10, 0x00, 0x0C, // VW0 = 12
            0x0A, 0x00, 0x00, 0x00, // object does not exist
            0xFF, DATA_TS_BIT, 0x00, 0x01, 0x01, 0x00, // bit true + pad
            0xFF, DATA_TS_BYTE, 0x00, 0x10, 0x01, 0x31, // VW6 = 305
        ];
        let frame = ack(3, &[FN_READ_VAR, 4], &data);
        let items = decode_read_response(&frame, 3, 4).unwrap();
        assert_eq!(items[0], Ok(vec![0x00, 0x0C]));
        assert_eq!(items[1], Err(0x0A));
        assert_eq!(items[2], Ok(vec![0x01]));
        assert_eq!(items[3], Ok(vec![0x01, 0x31]));
        assert_eq!(decode_value(S7Width::Word, &[0x01, 0x31]), Some(TagValue::Int(305)));
    }

    #[test]
    fn read_response_mismatches_are_errors() {
        let frame = ack(3, &[FN_READ_VAR, 1], &[0xFF, DATA_TS_BIT, 0x00, 0x01, 0x01]);
        assert_eq!(
            decode_read_response(&frame, 4, 1),
            Err(S7Error::PduRef { expected: 4, got: 3 })
        );
        assert_eq!(
            decode_read_response(&frame, 3, 2),
            Err(S7Error::ItemCount { expected: 2, got: 1 })
        );
        assert!(matches!(
            decode_read_response(&frame[..frame.len() - 1], 3, 1),
            Err(S7Error::Truncated { .. })
        ));
    }

    #[test]
    fn write_request_layout() {
        let frame = encode_write_request(9, &s7("VW2"), &encode_value(S7Width::Word, TagValue::Int(40)).unwrap());
        assert_eq!(&frame[13..15], &[0x00, 14]);
        assert_eq!(&frame[15..17], &[0x00, 6]);
        assert_eq!(&frame[17..19], &[FN_WRITE_VAR, 1]);
        assert_eq!(&frame[31..], &[0x00, DATA_TS_BYTE, 0x00, 0x10, 0x00, 0x28]);

        let bit = encode_write_request(9, &s7("V9.0"), &[1]);
        assert_eq!(&bit[31..], &[0x00, DATA_TS_BIT, 0x00, 0x01, 0x01]);
        assert_eq!(&bit[28..31], &[0x00, 0x00, 0x48]);
    }

    #[test]
    fn write_response_carries_item_code() {
        let ok = ack(9, &[FN_WRITE_VAR, 1], &[0xFF]);
        assert_eq!(decode_write_response(&ok, 9), Ok(Ok(())));
        let denied = ack(9, &[FN_WRITE_VAR, 1], &[0x05]);
        assert_eq!(decode_write_response(&denied, 9), Ok(Err(0x05)));
        assert_eq!(describe_return_code(0x05), "address out of range");
    }

    #[test]
    fn header_error_is_reported() {
        let mut frame = ack(2, &[FN_READ_VAR, 0], &[]);
        frame[17] = 0x85;
        frame[18] = 0x00;
        assert_eq!(
            decode_read_response(&frame, 2, 0),
            Err(S7Error::Header { class: 0x85, code: 0x00 })
        );
    }

    #[test]
    fn items_per_read_fit_pdu() {
        assert_eq!(max_items_per_read(240), 19);
        assert_eq!(max_items_per_read(480), MAX_ITEMS_PER_JOB);
        assert_eq!(max_items_per_read(20), 1);
    }

    #[test]
    fn value_codec_bounds() {
        assert_eq!(encode_value(S7Width::Word, TagValue::Int(-2)), Some(vec![0xFF, 0xFE]));
        assert_eq!(encode_value(S7Width::Word, TagValue::Int(40_000)), None);
        assert_eq!(encode_value(S7Width::Byte, TagValue::Int(256)), None);
        assert_eq!(encode_value(S7Width::Bit(3), TagValue::Int(1)), None);
        assert_eq!(
            decode_value(S7Width::DWord, &[0xFF, 0xFF, 0xFF, 0xFF]),
            Some(TagValue::Int(-1))
        );
        assert_eq!(decode_value(S7Width::Word, &[0x01]), None);
    }
}
