// Signed discovery format - the plaintext bodies protected by Ed25519
// signatures.
//
// Multicast datagrams carry the signer's public key and a signature over
// the whole datagram (header included) as a 96-byte trailer. Unicast runs a
// nonce exchange first so the response signature is bound to this
// connection, and the client may authenticate itself the same way.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::constraint::{supports_transport, Constraint, ConstraintChecker, InvocationConstraints};
use crate::error::{Error, Result};
use crate::transport::{Deadline, DiscoveryStream};

use super::multicast::Datagram;
use super::plaintext::{
    decode_announcement_body, decode_request_body, decode_response_body, encode_announcement_body,
    encode_request_body, encode_response_body,
};
use super::subject::{fingerprint, ClientSubject, ClientSubjectChecker};
use super::wire;
use super::{
    DatagramBufferFactory, DiscoveryCodec, DiscoveryProvider, MulticastAnnouncement, MulticastRequest,
    UnicastResponse,
};

pub const FORMAT_NAME: &str = "net.jini.discovery.ed25519";

const KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const TRAILER_LEN: usize = KEY_LEN + SIGNATURE_LEN;

const CLIENT_PROOF: &[u8] = b"river discovery client proof";
const SERVER_PROOF: &[u8] = b"river discovery server response";

pub fn generate_identity() -> SigningKey {
    let mut seed = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
    SigningKey::from_bytes(&seed)
}

fn nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);
    nonce
}

/// Digest signed during the unicast exchange
fn transcript(context: &[u8], first: &[u8; 32], second: &[u8; 32], body: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(context);
    hasher.update(first);
    hasher.update(second);
    hasher.update(body);
    *hasher.finalize().as_bytes()
}

#[derive(Clone)]
pub struct SignedFormat {
    identity: Option<SigningKey>,
    trusted: HashSet<[u8; 32]>,
}

impl fmt::Debug for SignedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedFormat")
            .field(
                "identity",
                &self.identity.as_ref().map(|k| fingerprint(k.verifying_key().as_bytes())),
            )
            .field("trusted", &self.trusted.len())
            .finish()
    }
}

pub fn provider(format: SignedFormat) -> DiscoveryProvider {
    let format = Arc::new(format);
    DiscoveryProvider::new(format.clone(), format)
}

impl SignedFormat {
    /// `identity` signs what this node sends; `trusted` keys are the only
    /// peers accepted when server authentication is required.
    pub fn new(identity: Option<SigningKey>, trusted: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            identity,
            trusted: trusted.into_iter().map(|k| k.to_bytes()).collect(),
        }
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        self.identity.as_ref().map(SigningKey::verifying_key)
    }

    fn identity(&self, role: &str) -> Result<&SigningKey> {
        self.identity
            .as_ref()
            .ok_or_else(|| Error::Config(format!("{role} needs a signing identity")))
    }

    fn verify(
        &self,
        message: &[u8],
        key: &[u8; KEY_LEN],
        signature: &[u8; SIGNATURE_LEN],
        require_trusted: bool,
    ) -> Result<ClientSubject> {
        let verifying_key = VerifyingKey::from_bytes(key)
            .map_err(|e| Error::Authentication(format!("invalid signer key: {e}")))?;
        verifying_key
            .verify(message, &Signature::from_bytes(signature))
            .map_err(|_| Error::Authentication(format!("bad signature from {}", fingerprint(key))))?;
        if require_trusted && !self.trusted.contains(key) {
            return Err(Error::Authentication(format!(
                "signer {} is not trusted",
                fingerprint(key)
            )));
        }
        Ok(ClientSubject::new(&verifying_key))
    }

    /// Verifies a datagram's trailer and returns its body and signer.
    fn open(&self, datagram: &Datagram, require_trusted: bool) -> Result<(Bytes, ClientSubject)> {
        let bytes = datagram.bytes();
        if bytes.len() < datagram.header_len() + TRAILER_LEN {
            return Err(Error::malformed("datagram too short for signature"));
        }
        let signed_end = bytes.len() - TRAILER_LEN;
        let mut trailer = bytes.slice(signed_end..);
        let key = wire::get_array::<KEY_LEN>(&mut trailer, "signer key")?;
        let signature = wire::get_array::<SIGNATURE_LEN>(&mut trailer, "signature")?;
        let subject = self.verify(&bytes[..signed_end], &key, &signature, require_trusted)?;
        Ok((bytes.slice(datagram.header_len()..signed_end), subject))
    }
}

fn sealer(key: &SigningKey) -> impl FnMut(&mut BytesMut) -> Result<()> + '_ {
    move |buf: &mut BytesMut| {
        let signature = key.sign(&buf[..]);
        buf.put_slice(key.verifying_key().as_bytes());
        buf.put_slice(&signature.to_bytes());
        Ok(())
    }
}

impl ConstraintChecker for SignedFormat {
    fn format_name(&self) -> &str {
        FORMAT_NAME
    }

    fn supports(&self, constraint: &Constraint) -> bool {
        match constraint {
            Constraint::Integrity(true)
            | Constraint::ServerAuthentication(_)
            | Constraint::ClientAuthentication(_)
            | Constraint::Confidentiality(false)
            | Constraint::Delegation(false)
            | Constraint::AtomicInputValidation(_) => true,
            other => supports_transport(other),
        }
    }
}

#[async_trait]
impl DiscoveryCodec for SignedFormat {
    fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        buffers: &mut dyn DatagramBufferFactory,
        _constraints: &InvocationConstraints,
    ) -> Result<()> {
        let key = self.identity("signing multicast requests")?;
        encode_request_body(request, buffers, TRAILER_LEN, &mut sealer(key))
    }

    fn decode_multicast_request(
        &self,
        datagram: &Datagram,
        _constraints: &InvocationConstraints,
        subject_checker: &dyn ClientSubjectChecker,
    ) -> Result<MulticastRequest> {
        let (body, subject) = self.open(datagram, false)?;
        let request = decode_request_body(body)?;
        subject_checker.check_client_subject(Some(&subject))?;
        Ok(request)
    }

    fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        buffers: &mut dyn DatagramBufferFactory,
        _constraints: &InvocationConstraints,
    ) -> Result<()> {
        let key = self.identity("signing multicast announcements")?;
        encode_announcement_body(announcement, buffers, TRAILER_LEN, &mut sealer(key))
    }

    fn decode_multicast_announcement(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
    ) -> Result<MulticastAnnouncement> {
        let require_trusted = constraints.requires(&Constraint::ServerAuthentication(true));
        let (body, signer) = self.open(datagram, require_trusted)?;
        debug!("Announcement signed by {}", signer.fingerprint());
        decode_announcement_body(body)
    }

    async fn unicast_client(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &InvocationConstraints,
        deadline: &Deadline,
    ) -> Result<UnicastResponse> {
        let must_authenticate = constraints.requires(&Constraint::ClientAuthentication(true));
        let identity = if constraints.wants(&Constraint::ClientAuthentication(true)) {
            match &self.identity {
                Some(key) => Some(key),
                None if must_authenticate => {
                    return Err(Error::Config("client authentication needs a signing identity".into()))
                }
                None => None,
            }
        } else {
            None
        };

        let server_nonce: [u8; 32] = wire::read_exact(stream, deadline).await?;
        let client_nonce = nonce();

        let mut hello = BytesMut::with_capacity(32 + 1 + TRAILER_LEN);
        hello.put_slice(&client_nonce);
        match identity {
            Some(key) => {
                let proof = key.sign(&transcript(CLIENT_PROOF, &server_nonce, &client_nonce, &[]));
                hello.put_u8(1);
                hello.put_slice(key.verifying_key().as_bytes());
                hello.put_slice(&proof.to_bytes());
            }
            None => hello.put_u8(0),
        }
        wire::write_all(stream, &hello, deadline).await?;

        let body = wire::read_frame(stream, deadline).await?;
        let key: [u8; KEY_LEN] = wire::read_exact(stream, deadline).await?;
        let signature: [u8; SIGNATURE_LEN] = wire::read_exact(stream, deadline).await?;
        let server = self.verify(
            &transcript(SERVER_PROOF, &client_nonce, &server_nonce, &body),
            &key,
            &signature,
            constraints.requires(&Constraint::ServerAuthentication(true)),
        )?;
        debug!("Unicast response signed by {}", server.fingerprint());

        decode_response_body(body)
    }

    async fn unicast_server(
        &self,
        stream: &mut dyn DiscoveryStream,
        response: &UnicastResponse,
        constraints: &InvocationConstraints,
        subject_checker: &dyn ClientSubjectChecker,
        deadline: &Deadline,
    ) -> Result<()> {
        let key = self.identity("serving signed unicast discovery")?;

        let server_nonce = nonce();
        wire::write_all(stream, &server_nonce, deadline).await?;
        let client_nonce: [u8; 32] = wire::read_exact(stream, deadline).await?;

        let subject = match wire::read_u8(stream, deadline).await? {
            0 => None,
            1 => {
                let client_key: [u8; KEY_LEN] = wire::read_exact(stream, deadline).await?;
                let proof: [u8; SIGNATURE_LEN] = wire::read_exact(stream, deadline).await?;
                let message = transcript(CLIENT_PROOF, &server_nonce, &client_nonce, &[]);
                Some(self.verify(&message, &client_key, &proof, false)?)
            }
            other => return Err(Error::malformed(format!("bad client proof flag {other}"))),
        };
        if subject.is_none() && constraints.requires(&Constraint::ClientAuthentication(true)) {
            return Err(Error::AccessDenied("client did not authenticate".into()));
        }
        subject_checker.check_client_subject(subject.as_ref())?;

        let body = encode_response_body(response)?;
        let signature = key.sign(&transcript(SERVER_PROOF, &client_nonce, &server_nonce, &body));

        let mut reply = BytesMut::with_capacity(body.len() + 4 + TRAILER_LEN);
        wire::put_frame(&mut reply, &body)?;
        reply.put_slice(key.verifying_key().as_bytes());
        reply.put_slice(&signature.to_bytes());
        wire::write_all(stream, &reply, deadline).await
    }
}
