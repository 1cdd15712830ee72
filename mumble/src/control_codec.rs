//! TCP control-channel framing: `u16be type || u32be length || payload`,
//! carrying one Protobuf message per frame.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message as _;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto;

/// Maximum accepted payload length. A frame claiming to be longer than this
/// is a protocol violation, not merely an unknown type, and closes the
/// connection.
pub const MAX_MESSAGE_LENGTH: u32 = 8 * 1024 * 1024 - 1;

macro_rules! control_packet {
    ($($id:expr => $variant:ident($ty:ty)),+ $(,)?) => {
        #[derive(Debug, Clone)]
        pub enum ControlPacket {
            $($variant($ty),)+
            /// A frame whose type number this client doesn't recognize. The
            /// payload is discarded by the decoder already; this variant only
            /// carries the type number for logging.
            Unknown(u16),
        }

        impl ControlPacket {
            pub fn type_id(&self) -> u16 {
                match self {
                    $(ControlPacket::$variant(_) => $id,)+
                    ControlPacket::Unknown(id) => *id,
                }
            }

            fn encode_body(&self, buf: &mut BytesMut) -> Result<(), prost::EncodeError> {
                match self {
                    $(ControlPacket::$variant(msg) => msg.encode(buf),)+
                    ControlPacket::Unknown(_) => Ok(()),
                }
            }

            fn decode_body(id: u16, body: &[u8]) -> Result<Self, prost::DecodeError> {
                Ok(match id {
                    $($id => ControlPacket::$variant(<$ty>::decode(body)?),)+
                    other => return Ok(ControlPacket::Unknown(other)),
                })
            }
        }

        $(
            impl From<$ty> for ControlPacket {
                fn from(msg: $ty) -> Self {
                    ControlPacket::$variant(msg)
                }
            }
        )+
    };
}

control_packet! {
    0 => Version(proto::Version),
    1 => UdpTunnel(proto::UdpTunnel),
    2 => Authenticate(proto::Authenticate),
    3 => Ping(proto::Ping),
    4 => Reject(proto::Reject),
    5 => ServerSync(proto::ServerSync),
    6 => ChannelRemove(proto::ChannelRemove),
    7 => ChannelState(proto::ChannelState),
    8 => UserRemove(proto::UserRemove),
    9 => UserState(proto::UserState),
    10 => BanList(proto::BanList),
    11 => TextMessage(proto::TextMessage),
    12 => PermissionDenied(proto::PermissionDenied),
    13 => Acl(proto::Acl),
    14 => QueryUsers(proto::QueryUsers),
    15 => CryptSetup(proto::CryptSetup),
    16 => ContextActionModify(proto::ContextActionModify),
    17 => ContextAction(proto::ContextAction),
    18 => UserList(proto::UserList),
    19 => VoiceTarget(proto::VoiceTarget),
    20 => PermissionQuery(proto::PermissionQuery),
    21 => CodecVersion(proto::CodecVersion),
    22 => UserStats(proto::UserStats),
    23 => RequestBlob(proto::RequestBlob),
    24 => ServerConfig(proto::ServerConfig),
    25 => SuggestConfig(proto::SuggestConfig),
    26 => PluginDataTransmission(proto::PluginDataTransmission),
}

#[derive(Debug, Error)]
pub enum ControlCodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to encode protobuf payload: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("frame length {0} exceeds the maximum of {max}", max = MAX_MESSAGE_LENGTH)]
    FrameTooLarge(u32),
}

#[derive(Default)]
pub struct ControlCodec {
    // Set once a header has been read but the full payload hasn't arrived yet.
    pending: Option<(u16, u32)>,
}

impl ControlCodec {
    pub fn new() -> Self {
        ControlCodec::default()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlPacket;
    type Error = ControlCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let (type_id, length) = match self.pending {
                Some(header) => header,
                None => {
                    if src.len() < 6 {
                        return Ok(None);
                    }

                    let type_id = u16::from_be_bytes([src[0], src[1]]);
                    let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);

                    if length > MAX_MESSAGE_LENGTH {
                        return Err(ControlCodecError::FrameTooLarge(length));
                    }

                    src.advance(6);
                    self.pending = Some((type_id, length));
                    (type_id, length)
                }
            };

            if (src.len() as u32) < length {
                return Ok(None);
            }

            let body = src.split_to(length as usize);
            self.pending = None;

            return Ok(Some(ControlPacket::decode_body(type_id, &body)?));
        }
    }
}

impl Encoder<ControlPacket> for ControlCodec {
    type Error = ControlCodecError;

    fn encode(&mut self, item: ControlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let type_id = item.type_id();

        let mut body = BytesMut::new();
        item.encode_body(&mut body)?;

        dst.put_u16(type_id);
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_a_version_packet() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();

        let mut version = proto::Version::default();
        version.version = Some(0x00010204);
        version.release = Some("test".into());

        codec.encode(version.clone().into(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            ControlPacket::Version(v) => assert_eq!(v.version, version.version),
            _ => panic!("wrong variant decoded"),
        }

        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_type_is_surfaced_without_erroring() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(999);
        buf.put_u32(3);
        buf.extend_from_slice(&[1, 2, 3]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, ControlPacket::Unknown(999)));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        buf.put_u32(MAX_MESSAGE_LENGTH + 1);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ControlCodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn fed_one_byte_at_a_time_yields_exactly_one_dispatch() {
        // 00 01 00 00 00 03 0A 01 41: type=1 (UdpTunnel), length=3, body=0A 01 41.
        let bytes: &[u8] = &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x0A, 0x01, 0x41];
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        let mut dispatched = Vec::new();

        for &b in bytes {
            buf.put_u8(b);
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                dispatched.push(packet);
            }
        }

        assert_eq!(dispatched.len(), 1);
        match &dispatched[0] {
            // body `0A 01 41` is protobuf field 1 (wire type 2, length 1) = packet: [0x41].
            ControlPacket::UdpTunnel(p) => assert_eq!(p.packet.as_deref(), Some(&[0x41][..])),
            other => panic!("expected UdpTunnel, got {:?}", other),
        }
    }

    #[test]
    fn partial_frame_returns_none_until_complete() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        buf.put_u32(4);
        buf.extend_from_slice(&[1, 2]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[3, 4]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }
}
