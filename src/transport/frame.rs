use anyhow::bail;
use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const DIGEST_LEN: usize = 16;

/// Upper bound for the payload-plus-digest part of a single inbound packet. Packets are
///  datagram-sized by contract, so this is generous.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// The first byte on every accepted connection's first stream decides how the rest of the
///  connection is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Opaque bidirectional byte stream, handed to the membership layer verbatim.
    Stream = 1,
    /// One framed packet: sender address, payload, integrity trailer. The connection is closed
    ///  once the frame is read.
    Packet = 2,
}

/// Builds the packet frame header: type byte, then the sender's advertised address with a
///  single length-prefix byte. Addresses longer than 255 bytes do not fit the length prefix
///  and fail the send.
pub fn packet_header(advertised_addr: &str) -> anyhow::Result<BytesMut> {
    if advertised_addr.len() > u8::MAX as usize {
        bail!("local address too long");
    }

    let mut buf = BytesMut::with_capacity(2 + advertised_addr.len());
    buf.put_u8(MessageType::Packet.into());
    buf.put_u8(advertised_addr.len() as u8);
    buf.put_slice(advertised_addr.as_bytes());
    Ok(buf)
}

/// MD5 over the payload. This is a corruption detector for the frame, not an authenticity
///  check - the channel itself is authenticated by TLS.
pub fn payload_digest(payload: &[u8]) -> [u8; DIGEST_LEN] {
    Md5::digest(payload).into()
}

/// Splits a fully received packet body into payload and trailing digest, and checks the
///  digest. A buffer too short to even hold the trailer is an error; a digest mismatch is
///  reported as `false` with the payload still returned, so the caller decides whether to
///  treat it as telemetry or as a drop.
pub fn split_digest(mut buf: Vec<u8>) -> anyhow::Result<(Vec<u8>, bool)> {
    if buf.len() < DIGEST_LEN {
        bail!("not enough data received: {} bytes", buf.len());
    }

    let received = buf.split_off(buf.len() - DIGEST_LEN);
    let digest_ok = payload_digest(&buf)[..] == received[..];
    Ok((buf, digest_ok))
}
