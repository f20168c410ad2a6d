//! Descriptor passing for ragelord.
//!
//! A live socket or stream moves between two cooperating processes over a
//! Unix-domain channel ([`channel`]), described by a fixed envelope
//! ([`envelope`]), and is rebuilt on the receiving side as a refcounted host
//! resource ([`rehydrate`], [`host`]). [`handover`] wraps the whole exchange
//! for the one-shot, path-based case with a JSON session context.
//!
//! Logging goes through `tracing`; this crate never installs a subscriber.
//! Set `RAGELORD_TRACE_PASSFD=1` to print every frame to stderr as well.

#[cfg(not(unix))]
compile_error!("ragelord-passfd requires a Unix target");

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handover;
pub mod host;
pub mod rehydrate;

pub use channel::{AncillaryChannel, ChannelListener};
pub use config::{ChannelConfig, PassfdConfig, Persistence};
pub use envelope::{ENVELOPE_LEN, Family, HandleEnvelope, HandleKind};
pub use error::{
    ChannelError, DecodeError, HandoverError, HostError, ProtocolError, RehydrateError,
};
pub use handover::{
    Handover, HandoverReceiver, receive_handle, receive_handover, send_handle, send_handover,
};
pub use host::{HostLimits, HostRuntime, ManagedHost, ResourceHandle, ResourceKind};
pub use rehydrate::Rehydrator;
