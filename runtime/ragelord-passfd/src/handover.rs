//! Handing a live descriptor to another process, with its envelope and an
//! optional JSON context describing session state.
//!
//! [`send_handle`] / [`receive_handle`] work on an established channel and
//! carry just the envelope. [`send_handover`] / [`receive_handover`] are the
//! one-shot path-based variant used when a server process passes its
//! connections to a replacement; the sender closes its copy only once the
//! handover succeeded. The payload is
//! `[envelope][context_len:u32 native][context JSON]`.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::channel::{AncillaryChannel, ChannelListener};
use crate::config::ChannelConfig;
use crate::envelope::{self, ENVELOPE_LEN, HandleEnvelope};
use crate::error::{ChannelError, HandoverError, ProtocolError, RehydrateError};
use crate::host::ResourceHandle;
use crate::rehydrate::Rehydrator;

const CONTEXT_LEN_BYTES: usize = 4;

/// Sends `fd` with its envelope. The caller keeps its copy.
pub fn send_handle(
    channel: &AncillaryChannel,
    fd: BorrowedFd<'_>,
    envelope: &HandleEnvelope,
) -> Result<(), ChannelError> {
    channel.send(fd, &envelope::encode(envelope))
}

/// Receives one descriptor and decodes its envelope. A malformed envelope
/// closes the descriptor and surfaces as [`ProtocolError::Envelope`].
pub fn receive_handle(channel: &AncillaryChannel) -> Result<(OwnedFd, HandleEnvelope), ChannelError> {
    let (fd, payload) = channel.receive()?;
    let envelope = envelope::decode(&payload).map_err(ProtocolError::from)?;
    Ok((fd, envelope))
}

/// A received descriptor with its envelope and context.
#[derive(Debug)]
pub struct Handover<C = serde_json::Value> {
    pub fd: OwnedFd,
    pub envelope: HandleEnvelope,
    pub context: C,
}

impl<C> Handover<C> {
    pub fn rehydrate(self, rehydrator: &Rehydrator) -> Result<(ResourceHandle, C), RehydrateError> {
        let handle = rehydrator.rehydrate(self.fd, self.envelope)?;
        Ok((handle, self.context))
    }
}

fn encode_payload(envelope: &HandleEnvelope, context: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ENVELOPE_LEN + CONTEXT_LEN_BYTES + context.len());
    payload.extend_from_slice(&envelope::encode(envelope));
    payload.extend_from_slice(&(context.len() as u32).to_ne_bytes());
    payload.extend_from_slice(context);
    payload
}

fn decode_payload(payload: &[u8]) -> Result<(HandleEnvelope, &[u8]), ProtocolError> {
    let (envelope, rest) = envelope::decode_prefix(payload)?;
    let Some((len, context)) = rest.split_first_chunk::<CONTEXT_LEN_BYTES>() else {
        return Err(ProtocolError::ShortPayload {
            needed: ENVELOPE_LEN + CONTEXT_LEN_BYTES,
            found: payload.len(),
        });
    };
    let declared = u32::from_ne_bytes(*len) as usize;
    if declared != context.len() {
        return Err(ProtocolError::ContextLength {
            declared,
            actual: context.len(),
        });
    }
    Ok((envelope, context))
}

/// Connects to `path` and sends `fd` with a probed envelope and `context`.
///
/// The caller keeps its copy of `fd` on every outcome. After `Ok` the
/// receiver holds its own descriptor for the same connection and the caller
/// usually closes its copy; after an error the connection is untouched and
/// can be served or handed over again.
pub fn send_handover<C: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    fd: BorrowedFd<'_>,
    context: &C,
) -> Result<(), HandoverError> {
    send_handover_with_config(path, fd, context, ChannelConfig::default())
}

pub fn send_handover_with_config<C: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    fd: BorrowedFd<'_>,
    context: &C,
    config: ChannelConfig,
) -> Result<(), HandoverError> {
    let envelope = envelope::probe(fd).map_err(HandoverError::Probe)?;
    let context = serde_json::to_vec(context)?;
    let payload = encode_payload(&envelope, &context);
    let channel = AncillaryChannel::connect_with_config(path.as_ref(), config)?;
    channel.send(fd, &payload)?;
    debug!(
        path = %path.as_ref().display(),
        kind = %envelope.kind(),
        context_len = context.len(),
        "handover sent"
    );
    Ok(())
}

/// The receiving end of a handover, bound before the sender connects.
/// Dropping it unlinks the socket path.
#[derive(Debug)]
pub struct HandoverReceiver {
    listener: ChannelListener,
}

impl HandoverReceiver {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, HandoverError> {
        Self::bind_with_config(path, ChannelConfig::default())
    }

    pub fn bind_with_config(
        path: impl AsRef<Path>,
        config: ChannelConfig,
    ) -> Result<Self, HandoverError> {
        Ok(Self {
            listener: ChannelListener::bind_with_config(path, config)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Accepts one sender and receives its handover.
    pub fn receive<C: DeserializeOwned>(self) -> Result<Handover<C>, HandoverError> {
        let channel = self.listener.accept()?;
        let (fd, payload) = channel.receive()?;
        drop(self);
        let (envelope, context) = decode_payload(&payload)?;
        let context = serde_json::from_slice(context)?;
        debug!(kind = %envelope.kind(), "handover received");
        Ok(Handover {
            fd,
            envelope,
            context,
        })
    }
}

/// Binds `path`, waits for one sender, and returns what it handed over. The
/// path is unlinked before returning.
pub fn receive_handover<C: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<Handover<C>, HandoverError> {
    HandoverReceiver::bind(path)?.receive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Family, HandleKind};
    use crate::error::DecodeError;
    use std::os::fd::AsFd;

    #[test]
    fn payload_layout() {
        let env = HandleEnvelope::new(HandleKind::Socket, Family::Inet6, true, 0);
        let payload = encode_payload(&env, b"{}");
        assert_eq!(payload.len(), ENVELOPE_LEN + CONTEXT_LEN_BYTES + 2);
        assert_eq!(decode_payload(&payload), Ok((env, &b"{}"[..])));
    }

    #[test]
    fn payload_errors() {
        let env = HandleEnvelope::new(HandleKind::Socket, Family::Inet, true, 0);
        let payload = encode_payload(&env, b"{\"a\":1}");

        assert_eq!(
            decode_payload(&payload[..ENVELOPE_LEN + 2]),
            Err(ProtocolError::ShortPayload {
                needed: ENVELOPE_LEN + CONTEXT_LEN_BYTES,
                found: ENVELOPE_LEN + 2
            })
        );
        assert_eq!(
            decode_payload(&payload[..payload.len() - 1]),
            Err(ProtocolError::ContextLength {
                declared: 7,
                actual: 6
            })
        );
        let mut bad = payload.clone();
        bad[0] = 7;
        assert_eq!(
            decode_payload(&bad),
            Err(ProtocolError::Envelope(DecodeError::UnknownVersion(7)))
        );
    }

    #[test]
    fn bad_envelope_on_channel_is_a_protocol_error() {
        let (tx, rx) = AncillaryChannel::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        let mut bytes = envelope::encode(&HandleEnvelope::new(
            HandleKind::Stream,
            Family::Unspecified,
            true,
            0,
        ));
        bytes[0] = 0;
        tx.send(file.as_fd(), &bytes).unwrap();
        assert!(matches!(
            receive_handle(&rx),
            Err(ChannelError::Protocol(ProtocolError::Envelope(
                DecodeError::UnknownVersion(0)
            )))
        ));
    }
}
