//! Frame codec for the bunch wire format.
//!
//! Frame layout: `[length:4][checksum:4][channel:2][kind:1][flags:1][seq:4][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of (channel + kind + flags + seq + payload)
//! - **channel**: Target channel index (little-endian u16)
//! - **kind**: Channel kind byte (control/actor/voice)
//! - **flags**: Bunch flags (reliable/open/close)
//! - **seq**: Per-channel sequence number (little-endian u32)
//! - **payload**: Raw bunch payload

use crate::bunch::{Bunch, ChannelKind, CONTROL_CHANNEL};
use crate::error::WireError;

/// Header size: 4 (length) + 4 (checksum) + 2 (channel) + 1 (kind) + 1 (flags) + 4 (seq).
pub const FRAME_HEADER_SIZE: usize = 16;

/// The protocol's stated maximum payload size per frame.
///
/// This is the limit the packet-size probe converges against. Frames larger
/// than this are rejected by a well-behaved endpoint.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

const FLAG_RELIABLE: u8 = 0x01;
const FLAG_OPEN: u8 = 0x02;
const FLAG_CLOSE: u8 = 0x04;

fn flags_byte(bunch: &Bunch) -> u8 {
    let mut flags = 0u8;
    if bunch.reliable {
        flags |= FLAG_RELIABLE;
    }
    if bunch.open {
        flags |= FLAG_OPEN;
    }
    if bunch.close {
        flags |= FLAG_CLOSE;
    }
    flags
}

/// Compute CRC32C over the checksummed region (everything after the checksum field).
fn compute_checksum(channel: u16, kind: u8, flags: u8, seq: u32, payload: &[u8]) -> u32 {
    let mut data = Vec::with_capacity(8 + payload.len());
    data.extend_from_slice(&channel.to_le_bytes());
    data.push(kind);
    data.push(flags);
    data.extend_from_slice(&seq.to_le_bytes());
    data.extend_from_slice(payload);
    crc32c::crc32c(&data)
}

/// Serialize a bunch into a wire frame.
///
/// # Errors
///
/// Returns `PayloadTooLarge` when the payload exceeds [`MAX_PAYLOAD_SIZE`].
/// Oversized frames can still be produced for boundary probing via
/// [`encode_frame_unchecked`].
pub fn encode_frame(bunch: &Bunch) -> Result<Vec<u8>, WireError> {
    if bunch.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: bunch.payload.len(),
        });
    }

    Ok(encode_frame_unchecked(bunch))
}

/// Serialize a bunch without enforcing the payload limit.
///
/// Probes use this to deliberately build over-limit frames; normal send
/// paths go through [`encode_frame`].
pub fn encode_frame_unchecked(bunch: &Bunch) -> Vec<u8> {
    let flags = flags_byte(bunch);
    let kind = bunch.kind.as_byte();
    let total_length = FRAME_HEADER_SIZE + bunch.payload.len();
    let checksum = compute_checksum(bunch.channel, kind, flags, bunch.seq, &bunch.payload);

    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&checksum.to_le_bytes());
    data.extend_from_slice(&bunch.channel.to_le_bytes());
    data.push(kind);
    data.push(flags);
    data.extend_from_slice(&bunch.seq.to_le_bytes());
    data.extend_from_slice(&bunch.payload);
    data
}

/// Deserialize a complete frame, validating the checksum.
///
/// # Errors
///
/// - `InsufficientData`: not enough bytes for the header or the full frame
/// - `InvalidLength`: length field malformed
/// - `ChecksumMismatch`: frame was corrupted
/// - `UnknownChannelKind` / `ReservedChannel`: header fields invalid
pub fn decode_frame(data: &[u8]) -> Result<Bunch, WireError> {
    match try_parse(data)? {
        Some((bunch, _consumed)) => Ok(bunch),
        None => Err(WireError::InsufficientData {
            needed: expected_len(data).unwrap_or(FRAME_HEADER_SIZE),
            have: data.len(),
        }),
    }
}

/// Try to decode one frame from the front of `buffer`, consuming it.
///
/// Reads may contain partial frames or several concatenated frames; this
/// consumes complete frames and leaves partial data for the next read.
///
/// # Returns
///
/// - `Ok(Some(bunch))` if a complete frame was parsed and drained
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the data is malformed
pub fn try_decode_frame(buffer: &mut Vec<u8>) -> Result<Option<Bunch>, WireError> {
    match try_parse(buffer)? {
        Some((bunch, consumed)) => {
            buffer.drain(..consumed);
            Ok(Some(bunch))
        }
        None => Ok(None),
    }
}

fn expected_len(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize)
}

fn try_parse(data: &[u8]) -> Result<Option<(Bunch, usize)>, WireError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if (length as usize) < FRAME_HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }

    let expected = length as usize;
    if data.len() < expected {
        return Ok(None);
    }

    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let channel = u16::from_le_bytes([data[8], data[9]]);
    let kind_byte = data[10];
    let flags = data[11];
    let seq = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
    let payload = &data[FRAME_HEADER_SIZE..expected];

    let computed = compute_checksum(channel, kind_byte, flags, seq, payload);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    let kind = ChannelKind::from_byte(kind_byte)?;
    if channel == CONTROL_CHANNEL && kind != ChannelKind::Control {
        return Err(WireError::ReservedChannel { kind });
    }

    let mut bunch = Bunch::new(channel, kind, seq, payload.to_vec())?;
    bunch.reliable = flags & FLAG_RELIABLE != 0;
    bunch.open = flags & FLAG_OPEN != 0;
    bunch.close = flags & FLAG_CLOSE != 0;

    Ok(Some((bunch, expected)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bunch() -> Bunch {
        Bunch::new(2, ChannelKind::Actor, 11, b"payload bytes".to_vec())
            .expect("bunch")
            .reliable()
            .opening()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let bunch = sample_bunch();
        let frame = encode_frame(&bunch).expect("encode");
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(bunch, decoded);
    }

    #[test]
    fn test_frame_length_field() {
        let bunch = sample_bunch();
        let frame = encode_frame(&bunch).expect("encode");

        let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(length as usize, frame.len());
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + bunch.payload.len());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let frame = encode_frame(&sample_bunch()).expect("encode");

        let mut corrupted = frame.clone();
        corrupted[FRAME_HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            decode_frame(&corrupted),
            Err(WireError::ChecksumMismatch { .. })
        ));

        // Header corruption trips the checksum too
        let mut corrupted = frame;
        corrupted[9] ^= 0xFF;
        assert!(matches!(
            decode_frame(&corrupted),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_limit_enforced() {
        let bunch = Bunch::new(1, ChannelKind::Actor, 1, vec![0u8; MAX_PAYLOAD_SIZE + 1]).expect("bunch");
        assert!(matches!(
            encode_frame(&bunch),
            Err(WireError::PayloadTooLarge { .. })
        ));

        // The unchecked path still produces a parseable frame for probing
        let frame = encode_frame_unchecked(&bunch);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE + 1);
    }

    #[test]
    fn test_max_size_payload() {
        let bunch = Bunch::new(1, ChannelKind::Actor, 1, vec![0xAB; MAX_PAYLOAD_SIZE]).expect("bunch");
        let frame = encode_frame(&bunch).expect("encode");
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_try_decode_partial_then_complete() {
        let bunch = sample_bunch();
        let frame = encode_frame(&bunch).expect("encode");

        let mut buffer = frame[..10].to_vec();
        assert!(try_decode_frame(&mut buffer).expect("partial").is_none());
        assert_eq!(buffer.len(), 10);

        buffer.extend_from_slice(&frame[10..]);
        let decoded = try_decode_frame(&mut buffer).expect("complete").expect("bunch");
        assert_eq!(decoded, bunch);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_try_decode_concatenated_frames() {
        let first = sample_bunch();
        let second = Bunch::new(0, ChannelKind::Control, 3, b"ctl".to_vec()).expect("bunch");

        let mut buffer = encode_frame(&first).expect("encode");
        buffer.extend_from_slice(&encode_frame(&second).expect("encode"));

        assert_eq!(try_decode_frame(&mut buffer).expect("one"), Some(first));
        assert_eq!(try_decode_frame(&mut buffer).expect("two"), Some(second));
        assert_eq!(try_decode_frame(&mut buffer).expect("empty"), None);
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut frame = encode_frame(&sample_bunch()).expect("encode");
        frame[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::InvalidLength { length: 4 })
        ));
    }

    #[test]
    fn test_reserved_channel_rejected_on_decode() {
        // Hand-build a frame claiming channel 0 with an actor kind
        let bunch = Bunch::new(5, ChannelKind::Actor, 1, vec![1, 2, 3]).expect("bunch");
        let mut frame = encode_frame(&bunch).expect("encode");
        // Rewrite channel to 0 and fix up the checksum
        frame[8..10].copy_from_slice(&0u16.to_le_bytes());
        let checksum = {
            let mut data = Vec::new();
            data.extend_from_slice(&frame[8..]);
            crc32c::crc32c(&data)
        };
        frame[4..8].copy_from_slice(&checksum.to_le_bytes());

        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::ReservedChannel { .. })
        ));
    }
}
