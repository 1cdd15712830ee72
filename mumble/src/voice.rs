//! UDP voice/ping packet framing for both protocol eras: legacy (packed
//! header byte + codec-specific frame header) and Protobuf (>= 1.5).

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::proto;
use crate::varint::{read_varint, write_varint, VarIntError};

#[derive(Debug, Error)]
pub enum VoicePacketError {
    #[error("packet too short")]
    Short,
    #[error("invalid varint in voice payload: {0}")]
    VarInt(#[from] VarIntError),
    #[error("failed to decode protobuf voice payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Codec tag carried in the legacy header's `type` field. Matches the
/// historical Mumble assignment: CELT Alpha and Beta predate Opus, and
/// Speex predates both.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VoiceCodec {
    CeltAlpha,
    Speex,
    CeltBeta,
    Opus,
}

impl VoiceCodec {
    pub(crate) fn from_type(t: u8) -> Option<Self> {
        match t {
            0 => Some(VoiceCodec::CeltAlpha),
            2 => Some(VoiceCodec::Speex),
            3 => Some(VoiceCodec::CeltBeta),
            4 => Some(VoiceCodec::Opus),
            _ => None,
        }
    }

    fn to_type(self) -> u8 {
        match self {
            VoiceCodec::CeltAlpha => 0,
            VoiceCodec::Speex => 2,
            VoiceCodec::CeltBeta => 3,
            VoiceCodec::Opus => 4,
        }
    }
}

/// A decoded inbound voice frame, independent of which era produced it.
#[derive(Debug, Clone)]
pub struct VoiceFrame {
    pub sender_session: u32,
    pub sequence: u64,
    pub codec: Option<VoiceCodec>,
    pub opus_data: Vec<u8>,
    pub is_terminator: bool,
    pub target: u8,
}

/// Introspection of an Opus packet's TOC (table-of-contents) byte: which
/// config row it selects determines channel count and frame size, and the
/// audio bandwidth class it implies.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OpusToc {
    pub stereo: bool,
    pub bandwidth: OpusBandwidth,
    pub samples_per_frame: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpusBandwidth {
    Narrow,
    Medium,
    Wide,
    SuperWide,
    Full,
}

/// Parses an Opus TOC byte (RFC 6716 §3.1). Frame-size table indexed by
/// `config >> 3` within each bandwidth octet group.
pub fn parse_opus_toc(toc: u8) -> OpusToc {
    let config = toc >> 3;
    let stereo = (toc & 0x04) != 0;

    const FRAME_SIZES_MS_X2: [u32; 4] = [20, 40, 60, 120]; // in units of 10ms *2 for SILK rows below it's different; see branches

    let (bandwidth, samples_per_frame) = match config {
        0..=3 => (OpusBandwidth::Narrow, silk_frame_samples(config)),
        4..=7 => (OpusBandwidth::Medium, silk_frame_samples(config - 4)),
        8..=11 => (OpusBandwidth::Wide, silk_frame_samples(config - 8)),
        12..=13 => (OpusBandwidth::SuperWide, hybrid_frame_samples(config - 12)),
        14..=15 => (OpusBandwidth::Full, hybrid_frame_samples(config - 14)),
        16..=19 => (OpusBandwidth::Narrow, celt_frame_samples(config - 16)),
        20..=23 => (OpusBandwidth::Wide, celt_frame_samples(config - 20)),
        24..=27 => (OpusBandwidth::SuperWide, celt_frame_samples(config - 24)),
        _ => (OpusBandwidth::Full, celt_frame_samples(config - 28)),
    };
    let _ = FRAME_SIZES_MS_X2;

    OpusToc { stereo, bandwidth, samples_per_frame }
}

fn silk_frame_samples(row: u8) -> u32 {
    // SILK-only configs: 10, 20, 40, 60 ms at 48kHz.
    match row {
        0 => 480,
        1 => 960,
        2 => 1920,
        _ => 2880,
    }
}

fn hybrid_frame_samples(row: u8) -> u32 {
    // Hybrid configs only come in 10 and 20 ms.
    match row {
        0 => 480,
        _ => 960,
    }
}

fn celt_frame_samples(row: u8) -> u32 {
    // CELT-only configs: 2.5, 5, 10, 20 ms at 48kHz.
    match row {
        0 => 120,
        1 => 240,
        2 => 480,
        _ => 960,
    }
}

/// Parses a legacy-era UDP datagram's first byte into `(type, target)`.
pub fn parse_legacy_header(b: u8) -> (u8, u8) {
    ((b >> 5) & 7, b & 0x1F)
}

pub fn encode_legacy_header(voice_type: u8, target: u8) -> u8 {
    ((voice_type & 7) << 5) | (target & 0x1F)
}

/// Parses a legacy voice payload (everything after the header byte) for a
/// known codec. Opus carries a varint frame header with a 13-bit length and
/// bit 13 as the terminator flag; Speex/CELT carry a single byte with a
/// 7-bit length and bit 7 as a *continuation* flag (terminator is the
/// logical inverse).
pub fn parse_legacy_voice(codec: VoiceCodec, target: u8, payload: &[u8]) -> Result<VoiceFrame, VoicePacketError> {
    let (sender, consumed) = read_varint(payload)?;
    let rest = &payload[consumed..];

    let (sequence, consumed) = read_varint(rest)?;
    let rest = &rest[consumed..];

    let (opus_data, is_terminator) = match codec {
        VoiceCodec::Opus => {
            let (header, consumed) = read_varint(rest)?;
            let header = header as u32;
            let length = (header & 0x1FFF) as usize;
            let terminator = (header & 0x2000) != 0;
            let rest = &rest[consumed..];
            if rest.len() < length {
                return Err(VoicePacketError::Short);
            }
            (rest[..length].to_vec(), terminator)
        }
        VoiceCodec::Speex | VoiceCodec::CeltAlpha | VoiceCodec::CeltBeta => {
            if rest.is_empty() {
                return Err(VoicePacketError::Short);
            }
            let header = rest[0];
            let length = (header & 0x7F) as usize;
            let continuation = (header & 0x80) != 0;
            let rest = &rest[1..];
            if rest.len() < length {
                return Err(VoicePacketError::Short);
            }
            (rest[..length].to_vec(), !continuation)
        }
    };

    Ok(VoiceFrame {
        sender_session: sender as u32,
        sequence: sequence as u64,
        codec: Some(codec),
        opus_data,
        is_terminator,
        target,
    })
}

/// Serializes an outbound legacy Opus voice frame: `sender varint, sequence
/// varint, (length | terminator<<13) varint, opus bytes`.
pub fn encode_legacy_opus(sender_session: u32, sequence: u64, opus_data: &[u8], is_terminator: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    write_varint(&mut buf, sender_session as u64);
    write_varint(&mut buf, sequence);

    let mut header = opus_data.len() as u64 & 0x1FFF;
    if is_terminator {
        header |= 0x2000;
    }
    write_varint(&mut buf, header);
    buf.extend_from_slice(opus_data);
    buf
}

/// Parses a Protobuf-era `Audio` message into the era-independent
/// `VoiceFrame` shape.
pub fn parse_protobuf_audio(body: &[u8]) -> Result<VoiceFrame, VoicePacketError> {
    use prost::Message;
    let audio = proto::udp::Audio::decode(body)?;

    Ok(VoiceFrame {
        sender_session: audio.sender_session.unwrap_or(0),
        sequence: audio.frame_number.unwrap_or(0),
        codec: None,
        opus_data: audio.opus_data.unwrap_or_default(),
        is_terminator: audio.is_terminator.unwrap_or(false),
        target: audio.target.unwrap_or(0) as u8,
    })
}

pub fn encode_protobuf_audio(frame: &VoiceFrame) -> BytesMut {
    use prost::Message;

    let audio = proto::udp::Audio {
        target: Some(frame.target as u32),
        context: None,
        sender_session: Some(frame.sender_session),
        frame_number: Some(frame.sequence),
        opus_data: Some(frame.opus_data.clone()),
        positional_data: Vec::new(),
        volume_adjustment: None,
        is_terminator: Some(frame.is_terminator),
    };

    let mut buf = BytesMut::new();
    audio.encode(&mut buf).expect("Audio encode is infallible into a growable buffer");
    buf
}

/// The first byte of a Protobuf-era UDP datagram.
pub const PROTOBUF_AUDIO_TAG: u8 = 0;
pub const PROTOBUF_PING_TAG: u8 = 1;

pub fn legacy_ping_payload(timestamp: u64) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(encode_legacy_header(1, 0));
    write_varint(&mut buf, timestamp);
    buf
}

pub fn parse_legacy_ping(payload: &[u8]) -> Result<u64, VoicePacketError> {
    let (timestamp, _) = read_varint(payload)?;
    Ok(timestamp as u64)
}

pub fn protobuf_ping_payload(timestamp: u64) -> BytesMut {
    use prost::Message;

    let ping = proto::udp::Ping { timestamp: Some(timestamp), request_extra_information: Vec::new(), server_version_v2: None };

    let mut buf = BytesMut::new();
    buf.put_u8(PROTOBUF_PING_TAG);
    ping.encode(&mut buf).expect("Ping encode is infallible into a growable buffer");
    buf
}

pub fn parse_protobuf_ping(body: &[u8]) -> Result<u64, VoicePacketError> {
    use prost::Message;
    let ping = proto::udp::Ping::decode(body)?;
    Ok(ping.timestamp.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_header_packs_type_and_target() {
        let byte = encode_legacy_header(4, 0x1F);
        assert_eq!(parse_legacy_header(byte), (4, 0x1F));
    }

    #[test]
    fn legacy_opus_round_trips() {
        let opus_data = vec![1, 2, 3, 4, 5];
        let encoded = encode_legacy_opus(42, 7, &opus_data, true);

        let frame = parse_legacy_voice(VoiceCodec::Opus, 0, &encoded).unwrap();
        assert_eq!(frame.sender_session, 42);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.opus_data, opus_data);
        assert!(frame.is_terminator);
    }

    #[test]
    fn legacy_opus_non_terminator_clears_bit() {
        let encoded = encode_legacy_opus(1, 1, &[9, 9], false);
        let frame = parse_legacy_voice(VoiceCodec::Opus, 0, &encoded).unwrap();
        assert!(!frame.is_terminator);
    }

    #[test]
    fn protobuf_audio_round_trips() {
        let frame = VoiceFrame {
            sender_session: 3,
            sequence: 11,
            codec: None,
            opus_data: vec![0xAB, 0xCD],
            is_terminator: true,
            target: 2,
        };

        let encoded = encode_protobuf_audio(&frame);
        let decoded = parse_protobuf_audio(&encoded).unwrap();

        assert_eq!(decoded.sender_session, 3);
        assert_eq!(decoded.sequence, 11);
        assert_eq!(decoded.opus_data, vec![0xAB, 0xCD]);
        assert!(decoded.is_terminator);
    }

    #[test]
    fn opus_toc_20ms_silk_mono() {
        // config=1 (10ms row index...), actually row 1 of SILK NB => 20ms, mono
        let toc = parse_opus_toc(0b00001_000);
        assert_eq!(toc.bandwidth, OpusBandwidth::Narrow);
        assert!(!toc.stereo);
        assert_eq!(toc.samples_per_frame, 960);
    }

    #[test]
    fn opus_toc_stereo_bit() {
        let toc = parse_opus_toc(0b00001_100);
        assert!(toc.stereo);
    }
}
