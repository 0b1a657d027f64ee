use std::collections::HashMap;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::location::Location;

bitflags! {
    /// Access bits declared on a channel in the system map.
    ///
    /// `WRITABLE` and `READABLE` may only be combined when `RANDOM` is also set: a channel that is
    /// both read and written sequentially would have no well-defined order of operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        /// The sandbox may read from this channel.
        const READABLE = 0b0000_0001;
        /// The sandbox may write to this channel.
        const WRITABLE = 0b0000_0010;
        /// Reads/writes may be issued in an order the engine may not assume to be sequential.
        const RANDOM   = 0b0000_0100;
        /// The channel carries CDR (billing) accounting, e.g. a fixed record device.
        const CDR      = 0b0000_1000;
        /// The channel is a network endpoint, handled by the sandbox itself.
        const NETWORK  = 0b0001_0000;
    }
}

impl AccessFlags {
    /// `WRITABLE` and `READABLE` may combine only under `RANDOM` (the resolver's invariant #2).
    pub fn is_valid_combination(self) -> bool {
        if self.contains(AccessFlags::WRITABLE | AccessFlags::READABLE) {
            self.contains(AccessFlags::RANDOM)
        } else {
            true
        }
    }
}

/// A single declared channel of a `JobSpec`: a mapping between a logical device name inside the
/// sandbox and a byte source/sink outside of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// The logical device name, as seen by the sandboxed executable.
    pub device: String,
    /// Where the channel's bytes live before resolution, if declared in the system map.
    pub path: Option<Location>,
    /// The local filesystem path this channel was resolved to. `None` until the `ChannelResolver`
    /// has run.
    pub lpath: Option<PathBuf>,
    /// The access bits declared for this channel.
    pub access: AccessFlags,
    /// The MIME type of the channel's content, used to decide whether to parse a CGI/HTTP
    /// preamble out of the channel's file on response assembly.
    pub content_type: String,
    /// The minimum size (bytes) a channel must reach before it is included in the response tar.
    pub min_size: u64,
    /// Object metadata attached to this channel (`x-object-meta-*` keys), if any.
    pub meta: Option<HashMap<String, String>>,
    /// The resolved size of the channel's file, filled in during response assembly.
    pub size: Option<u64>,
    /// Byte offset into the channel's file where the payload starts (after a CGI preamble).
    pub offset: Option<u64>,
    /// Free-form info bytes carried for the channel (e.g. the CGI status line), if parsed.
    pub info: Option<Vec<u8>>,
    /// A human-readable description of how this channel was resolved, propagated into the
    /// manifest `tag` field.
    pub path_info: Option<String>,
}

impl Channel {
    /// Build a channel declaration as it would appear straight out of the system map, with none of
    /// the resolution fields filled in yet.
    pub fn new(device: impl Into<String>, access: AccessFlags, content_type: impl Into<String>) -> Channel {
        Channel {
            device: device.into(),
            path: None,
            lpath: None,
            access,
            content_type: content_type.into(),
            min_size: 0,
            meta: None,
            size: None,
            offset: None,
            info: None,
            path_info: None,
        }
    }

    /// Whether this channel has been fully resolved, i.e. has a local path, is a network
    /// endpoint, or otherwise needs no local path.
    pub fn is_resolved(&self) -> bool {
        self.lpath.is_some() || self.access.contains(AccessFlags::NETWORK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_and_writable_require_random() {
        let rw = AccessFlags::READABLE | AccessFlags::WRITABLE;
        assert!(!rw.is_valid_combination());
        assert!((rw | AccessFlags::RANDOM).is_valid_combination());
        assert!(AccessFlags::READABLE.is_valid_combination());
        assert!(AccessFlags::WRITABLE.is_valid_combination());
    }

    #[test]
    fn unresolved_channel_is_not_resolved() {
        let ch = Channel::new("stdout", AccessFlags::WRITABLE, "text/plain");
        assert!(!ch.is_resolved());
        let net = Channel::new("net0", AccessFlags::NETWORK, "application/octet-stream");
        assert!(net.is_resolved());
    }
}
