// Plaintext discovery format - unauthenticated, unprotected encoding of
// requests, announcements and unicast responses.
//
// The body layouts here are shared with the signed format, which wraps
// the same bodies in signatures.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::constraint::{supports_transport, Constraint, ConstraintChecker, InvocationConstraints};
use crate::error::{Error, Result};
use crate::transport::{Deadline, DiscoveryStream};

use super::multicast::Datagram;
use super::subject::ClientSubjectChecker;
use super::wire::{self, str_len};
use super::{
    DatagramBufferFactory, DiscoveryCodec, DiscoveryProvider, MulticastAnnouncement, MulticastRequest,
    SealFn, UnicastResponse,
};

pub const FORMAT_NAME: &str = "net.jini.discovery.plaintext";

#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

pub fn provider() -> DiscoveryProvider {
    DiscoveryProvider::new(Arc::new(Plaintext), Arc::new(Plaintext))
}

impl ConstraintChecker for Plaintext {
    fn format_name(&self) -> &str {
        FORMAT_NAME
    }

    fn supports(&self, constraint: &Constraint) -> bool {
        match constraint {
            Constraint::Integrity(false)
            | Constraint::Confidentiality(false)
            | Constraint::ServerAuthentication(false)
            | Constraint::ClientAuthentication(false)
            | Constraint::Delegation(false)
            | Constraint::AtomicInputValidation(_) => true,
            other => supports_transport(other),
        }
    }
}

#[async_trait]
impl DiscoveryCodec for Plaintext {
    fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        buffers: &mut dyn DatagramBufferFactory,
        _constraints: &InvocationConstraints,
    ) -> Result<()> {
        encode_request_body(request, buffers, 0, &mut |_| Ok(()))
    }

    fn decode_multicast_request(
        &self,
        datagram: &Datagram,
        _constraints: &InvocationConstraints,
        subject_checker: &dyn ClientSubjectChecker,
    ) -> Result<MulticastRequest> {
        let request = decode_request_body(datagram.payload())?;
        subject_checker.check_client_subject(None)?;
        Ok(request)
    }

    fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        buffers: &mut dyn DatagramBufferFactory,
        _constraints: &InvocationConstraints,
    ) -> Result<()> {
        encode_announcement_body(announcement, buffers, 0, &mut |_| Ok(()))
    }

    fn decode_multicast_announcement(
        &self,
        datagram: &Datagram,
        _constraints: &InvocationConstraints,
    ) -> Result<MulticastAnnouncement> {
        decode_announcement_body(datagram.payload())
    }

    async fn unicast_client(
        &self,
        stream: &mut dyn DiscoveryStream,
        _constraints: &InvocationConstraints,
        deadline: &Deadline,
    ) -> Result<UnicastResponse> {
        let body = wire::read_frame(stream, deadline).await?;
        decode_response_body(body)
    }

    async fn unicast_server(
        &self,
        stream: &mut dyn DiscoveryStream,
        response: &UnicastResponse,
        _constraints: &InvocationConstraints,
        subject_checker: &dyn ClientSubjectChecker,
        deadline: &Deadline,
    ) -> Result<()> {
        subject_checker.check_client_subject(None)?;
        let body = encode_response_body(response)?;
        let mut frame = BytesMut::with_capacity(body.len() + 4);
        wire::put_frame(&mut frame, &body)?;
        wire::write_all(stream, &frame, deadline).await
    }
}

fn put_count(buf: &mut BytesMut, count: usize, what: &str) -> Result<()> {
    let count = u16::try_from(count).map_err(|_| Error::malformed(format!("too many {what}")))?;
    buf.put_u16(count);
    Ok(())
}

/// Spreads `groups` over as many datagrams as needed.
///
/// Every datagram gets the fixed fields from `prefix`, a slice of the
/// groups and then whatever `suffix` fits in the remaining room, which is
/// at least `suffix_min` bytes. A non-empty group list never yields a
/// datagram with zero groups, since that would widen the request to every
/// group.
fn encode_split(
    buffers: &mut dyn DatagramBufferFactory,
    trailer: usize,
    groups: &[String],
    prefix: &dyn Fn(&mut BytesMut) -> Result<()>,
    suffix_min: usize,
    suffix: &dyn Fn(&mut BytesMut, usize) -> Result<()>,
    seal: SealFn<'_>,
) -> Result<()> {
    let limit = buffers.max_datagram_size().saturating_sub(trailer);
    let mut next = 0;
    loop {
        let buf = buffers.new_datagram();
        prefix(buf)?;
        let mut size = buf.len() + 2 + suffix_min;
        if size > limit {
            return Err(Error::DatagramOverflow { needed: size, limit });
        }

        let start = next;
        while next < groups.len() && size + str_len(&groups[next]) <= limit {
            size += str_len(&groups[next]);
            next += 1;
        }
        if next == start && next < groups.len() {
            return Err(Error::DatagramOverflow {
                needed: size + str_len(&groups[next]),
                limit,
            });
        }

        put_count(buf, next - start, "groups")?;
        for group in &groups[start..next] {
            wire::put_str(buf, group)?;
        }
        suffix(buf, limit - size + suffix_min)?;
        seal(buf)?;

        if next >= groups.len() {
            return Ok(());
        }
    }
}

pub(crate) fn encode_request_body(
    request: &MulticastRequest,
    buffers: &mut dyn DatagramBufferFactory,
    trailer: usize,
    seal: SealFn<'_>,
) -> Result<()> {
    let prefix = |buf: &mut BytesMut| -> Result<()> {
        wire::put_str(buf, &request.host)?;
        buf.put_u16(request.port);
        Ok(())
    };
    // Heard-from ids are advisory; send as many as fit
    let suffix = |buf: &mut BytesMut, room: usize| -> Result<()> {
        let fit = ((room - 2) / 16).min(request.heard_from.len());
        put_count(buf, fit, "lookup ids")?;
        for id in &request.heard_from[..fit] {
            wire::put_uuid(buf, id);
        }
        Ok(())
    };
    encode_split(buffers, trailer, &request.groups, &prefix, 2, &suffix, seal)
}

pub(crate) fn decode_request_body(mut body: Bytes) -> Result<MulticastRequest> {
    let host = wire::get_str(&mut body, "request host")?;
    let port = wire::get_u16(&mut body, "request port")?;
    let groups = get_groups(&mut body)?;
    let count = wire::get_u16(&mut body, "lookup id count")?;
    let heard_from = (0..count)
        .map(|_| wire::get_uuid(&mut body, "lookup id"))
        .collect::<Result<Vec<_>>>()?;
    wire::expect_end(&body, "multicast request")?;
    Ok(MulticastRequest {
        host,
        port,
        groups,
        heard_from,
    })
}

pub(crate) fn encode_announcement_body(
    announcement: &MulticastAnnouncement,
    buffers: &mut dyn DatagramBufferFactory,
    trailer: usize,
    seal: SealFn<'_>,
) -> Result<()> {
    let prefix = |buf: &mut BytesMut| -> Result<()> {
        buf.put_u64(announcement.sequence);
        wire::put_str(buf, &announcement.host)?;
        buf.put_u16(announcement.port);
        wire::put_uuid(buf, &announcement.registrar_id);
        Ok(())
    };
    encode_split(buffers, trailer, &announcement.groups, &prefix, 0, &|_, _| Ok(()), seal)
}

pub(crate) fn decode_announcement_body(mut body: Bytes) -> Result<MulticastAnnouncement> {
    let sequence = wire::get_u64(&mut body, "sequence number")?;
    let host = wire::get_str(&mut body, "announcement host")?;
    let port = wire::get_u16(&mut body, "announcement port")?;
    let registrar_id = wire::get_uuid(&mut body, "registrar id")?;
    let groups = get_groups(&mut body)?;
    wire::expect_end(&body, "multicast announcement")?;
    Ok(MulticastAnnouncement {
        sequence,
        host,
        port,
        registrar_id,
        groups,
    })
}

pub(crate) fn encode_response_body(response: &UnicastResponse) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    wire::put_str(&mut buf, &response.host)?;
    buf.put_u16(response.port);
    put_count(&mut buf, response.groups.len(), "groups")?;
    for group in &response.groups {
        wire::put_str(&mut buf, group)?;
    }
    wire::put_frame(&mut buf, &response.registrar)?;
    Ok(buf)
}

pub(crate) fn decode_response_body(mut body: Bytes) -> Result<UnicastResponse> {
    let host = wire::get_str(&mut body, "response host")?;
    let port = wire::get_u16(&mut body, "response port")?;
    let groups = get_groups(&mut body)?;
    let len = wire::get_u32(&mut body, "registrar length")? as usize;
    if body.len() != len {
        return Err(Error::malformed(format!(
            "registrar length {len} does not match remaining {} bytes",
            body.len()
        )));
    }
    Ok(UnicastResponse {
        host,
        port,
        groups,
        registrar: body,
    })
}

fn get_groups(body: &mut Bytes) -> Result<Vec<String>> {
    let count = wire::get_u16(body, "group count")?;
    (0..count).map(|_| wire::get_str(body, "group")).collect()
}
