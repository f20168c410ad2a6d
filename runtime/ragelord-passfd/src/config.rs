//! Runtime knobs for the channel and the receiving side.
//!
//! Everything has a default; [`PassfdConfig::from_env`] overrides from
//! `RAGELORD_PASSFD_*` variables and falls back (with a warning) on values it
//! cannot parse.

use std::env;
use std::mem::size_of;
use std::os::raw::c_int;
use std::str::FromStr;

use tracing::warn;

use crate::envelope::HandleKind;

pub const MAX_PAYLOAD_ENV: &str = "RAGELORD_PASSFD_MAX_PAYLOAD";
pub const PERSISTENCE_ENV: &str = "RAGELORD_PASSFD_PERSISTENCE";
pub const SUPPORTED_KINDS_ENV: &str = "RAGELORD_PASSFD_SUPPORTED_KINDS";

pub const DEFAULT_MAX_PAYLOAD: usize = 4096;
/// Upper bound accepted for `max_payload`; frames carry a u32 length.
pub const MAX_PAYLOAD_CEILING: usize = 16 * 1024 * 1024;

/// Control-buffer bytes needed for exactly one descriptor.
pub fn single_descriptor_control_space() -> usize {
    // SAFETY: pure size arithmetic.
    unsafe { libc::CMSG_SPACE(size_of::<c_int>() as u32) as usize }
}

/// Whether rehydrated sockets are tagged with the volatile or the
/// persistent resource kind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Persistence {
    #[default]
    Volatile,
    Persistent,
}

impl FromStr for Persistence {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "volatile" => Ok(Self::Volatile),
            "persistent" => Ok(Self::Persistent),
            other => Err(format!("unknown persistence `{other}`")),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest payload a frame may carry, in bytes.
    pub max_payload: usize,
    /// Bytes of ancillary buffer offered to `recvmsg`.
    pub control_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            control_capacity: single_descriptor_control_space(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassfdConfig {
    pub channel: ChannelConfig,
    pub persistence: Persistence,
    pub supported_kinds: Vec<HandleKind>,
}

impl Default for PassfdConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            persistence: Persistence::default(),
            supported_kinds: vec![HandleKind::Socket, HandleKind::Stream],
        }
    }
}

impl PassfdConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(MAX_PAYLOAD_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(max) if (1..=MAX_PAYLOAD_CEILING).contains(&max) => {
                    config.channel.max_payload = max;
                }
                _ => warn!(
                    var = MAX_PAYLOAD_ENV,
                    value = %raw,
                    default = DEFAULT_MAX_PAYLOAD,
                    "ignoring invalid max payload"
                ),
            }
        }
        if let Some(raw) = lookup(PERSISTENCE_ENV) {
            match raw.parse::<Persistence>() {
                Ok(persistence) => config.persistence = persistence,
                Err(err) => warn!(var = PERSISTENCE_ENV, %err, "ignoring invalid persistence"),
            }
        }
        if let Some(raw) = lookup(SUPPORTED_KINDS_ENV) {
            match parse_kinds(&raw) {
                Ok(kinds) => config.supported_kinds = kinds,
                Err(err) => warn!(var = SUPPORTED_KINDS_ENV, %err, "ignoring invalid kind list"),
            }
        }
        config
    }
}

fn parse_kinds(raw: &str) -> Result<Vec<HandleKind>, String> {
    let mut kinds = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let kind = part.parse::<HandleKind>()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err("no handle kinds listed".to_string());
    }
    Ok(kinds)
}
