use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(channel_id: i32, type_id: i32, body: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&channel_id.to_le_bytes());
        digest.update(&type_id.to_le_bytes());
        digest.update(body);

        Checksum(
            digest.finalize()
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    /// one-way, no response expected
    Message = 0,
    Request = 1,
    Response = 2,
}

/// The unit of transfer on a connection: a message addressed to one of the connection's channels,
///  together with the correlation data for request / response matching.
///
/// The body is opaque at this level - it is interpreted by the channel's message factory (or by
///  the peer itself for the reserved channel 0).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub channel_id: i32,
    pub type_id: i32,
    pub kind: FrameKind,
    /// only meaningful for requests and responses
    pub request_id: i64,
    /// only meaningful for responses
    pub failure: bool,
    pub body: Bytes,
}

impl Frame {
    pub fn message(channel_id: i32, type_id: i32, body: Bytes) -> Frame {
        Frame { channel_id, type_id, kind: FrameKind::Message, request_id: 0, failure: false, body }
    }

    pub fn request(channel_id: i32, type_id: i32, request_id: i64, body: Bytes) -> Frame {
        Frame { channel_id, type_id, kind: FrameKind::Request, request_id, failure: false, body }
    }

    pub fn response(channel_id: i32, type_id: i32, request_id: i64, failure: bool, body: Bytes) -> Frame {
        Frame { channel_id, type_id, kind: FrameKind::Response, request_id, failure, body }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_varint(self.channel_id);
        buf.put_i32_varint(self.type_id);
        buf.put_u8(self.kind.into());
        match self.kind {
            FrameKind::Message => {}
            FrameKind::Request => {
                buf.put_i64_varint(self.request_id);
            }
            FrameKind::Response => {
                buf.put_i64_varint(self.request_id);
                buf.put_u8(if self.failure { 1 } else { 0 });
            }
        }
        buf.put_u64(Checksum::new(self.channel_id, self.type_id, &self.body).0);
        buf.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.body.len() + 24);
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(mut buf: Bytes) -> anyhow::Result<Frame> {
        let channel_id = buf.try_get_i32_varint()?;
        let type_id = buf.try_get_i32_varint()?;
        let kind = FrameKind::try_from(buf.try_get_u8()?)?;

        let (request_id, failure) = match kind {
            FrameKind::Message => (0, false),
            FrameKind::Request => (buf.try_get_i64_varint()?, false),
            FrameKind::Response => {
                let request_id = buf.try_get_i64_varint()?;
                let failure = match buf.try_get_u8()? {
                    0 => false,
                    1 => true,
                    n => bail!("invalid failure flag {}", n),
                };
                (request_id, failure)
            }
        };

        let checksum = Checksum(buf.try_get_u64()?);
        let actual = Checksum::new(channel_id, type_id, &buf);
        if checksum != actual {
            bail!("checksum mismatch on channel {}: expected {:?}, was {:?}", channel_id, checksum, actual);
        }

        Ok(Frame {
            channel_id,
            type_id,
            kind,
            request_id,
            failure,
            body: buf,
        })
    }
}
