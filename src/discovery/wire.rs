// Wire primitives shared by every discovery format: checked big-endian
// decoding from `Bytes`, length-prefixed strings and framed stream IO

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{Deadline, DiscoveryStream};

/// Largest unicast frame either side will accept
pub const MAX_FRAME: usize = 1 << 20;

/// Encoded size of a length-prefixed string
pub fn str_len(value: &str) -> usize {
    2 + value.len()
}

pub fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::malformed(format!("string of {} bytes exceeds u16 length", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::malformed(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u16(buf: &mut Bytes, what: &str) -> Result<u16> {
    need(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64())
}

pub fn get_str(buf: &mut Bytes, what: &str) -> Result<String> {
    let len = usize::from(get_u16(buf, what)?);
    need(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::malformed(format!("{what} is not UTF-8")))
}

pub fn get_uuid(buf: &mut Bytes, what: &str) -> Result<Uuid> {
    need(buf, 16, what)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub fn get_array<const N: usize>(buf: &mut Bytes, what: &str) -> Result<[u8; N]> {
    need(buf, N, what)?;
    let mut raw = [0u8; N];
    buf.copy_to_slice(&mut raw);
    Ok(raw)
}

pub fn expect_end(buf: &Bytes, what: &str) -> Result<()> {
    if buf.has_remaining() {
        return Err(Error::malformed(format!(
            "{} trailing bytes after {what}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub async fn read_u32(stream: &mut dyn DiscoveryStream, deadline: &Deadline) -> Result<u32> {
    deadline.io("read", stream.read_u32()).await
}

pub async fn read_u16(stream: &mut dyn DiscoveryStream, deadline: &Deadline) -> Result<u16> {
    deadline.io("read", stream.read_u16()).await
}

pub async fn read_u8(stream: &mut dyn DiscoveryStream, deadline: &Deadline) -> Result<u8> {
    deadline.io("read", stream.read_u8()).await
}

pub async fn read_exact<const N: usize>(
    stream: &mut dyn DiscoveryStream,
    deadline: &Deadline,
) -> Result<[u8; N]> {
    let mut raw = [0u8; N];
    deadline.io("read", stream.read_exact(&mut raw)).await?;
    Ok(raw)
}

pub async fn read_str(stream: &mut dyn DiscoveryStream, deadline: &Deadline) -> Result<String> {
    let len = usize::from(read_u16(stream, deadline).await?);
    let mut raw = vec![0u8; len];
    deadline.io("read", stream.read_exact(&mut raw)).await?;
    String::from_utf8(raw).map_err(|_| Error::malformed("string on stream is not UTF-8"))
}

/// Reads a u32-length-prefixed frame of at most [`MAX_FRAME`] bytes.
pub async fn read_frame(stream: &mut dyn DiscoveryStream, deadline: &Deadline) -> Result<Bytes> {
    let len = read_u32(stream, deadline).await? as usize;
    if len > MAX_FRAME {
        return Err(Error::malformed(format!("frame of {len} bytes exceeds limit")));
    }
    let mut raw = vec![0u8; len];
    deadline.io("read", stream.read_exact(&mut raw)).await?;
    Ok(Bytes::from(raw))
}

pub fn put_frame(buf: &mut BytesMut, frame: &[u8]) -> Result<()> {
    if frame.len() > MAX_FRAME {
        return Err(Error::malformed(format!("frame of {} bytes exceeds limit", frame.len())));
    }
    // Bounded by MAX_FRAME above
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    Ok(())
}

pub async fn write_all(stream: &mut dyn DiscoveryStream, data: &[u8], deadline: &Deadline) -> Result<()> {
    deadline.io("write", stream.write_all(data)).await?;
    deadline.io("flush", stream.flush()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_input_is_malformed() {
        let mut buf = Bytes::from_static(&[0x00]);
        assert!(matches!(get_u16(&mut buf, "port"), Err(Error::MalformedMessage(_))));

        let mut buf = Bytes::from_static(&[0x00, 0x05, b'a', b'b']);
        assert!(matches!(get_str(&mut buf, "host"), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "public").unwrap();
        assert_eq!(buf.len(), str_len("public"));

        let mut bytes = buf.freeze();
        assert_eq!(get_str(&mut bytes, "group").unwrap(), "public");
        expect_end(&bytes, "group").unwrap();
    }

    #[test]
    fn test_oversized_string_rejected() {
        let long = "x".repeat(usize::from(u16::MAX) + 1);
        assert!(put_str(&mut BytesMut::new(), &long).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = Bytes::from_static(&[0x00, 0x01, 0xff]);
        assert!(get_str(&mut bytes, "group").is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(u32::MAX).await.unwrap();
        let result = read_frame(&mut server, &Deadline::none()).await;
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
    }
}
