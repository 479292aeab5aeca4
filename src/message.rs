//! Routing-relevant message metadata.
//!
//! The wire representation of a message is owned by the codec (see
//! [`codec`](crate::codec)); this module only carries the header fields the
//! routing layer inspects, plus the opaque payload bytes.

use std::time::Duration;

use bytes::Bytes;

/// Identifies a logical multi-party communication group.
///
/// One session may span multiple physical links, and one link may carry
/// traffic for many sessions.
pub type SessionId = u32;

/// The reserved session id for control traffic.
///
/// Links mapped under this id form a [`VirtualEndpoint`](crate::VirtualEndpoint)'s
/// control routes, available to any session lookup by default and never
/// counted as session references.
pub const CONTROL_SESSION: SessionId = 0;

/// A routed message.
///
/// Only the header fields the routing and queueing layer needs are present;
/// everything else lives in the opaque `payload`.
#[derive(Clone, Debug, Default)]
pub struct Message {
    /// Serial number assigned by the sender.
    pub serial: u32,
    /// The session this message belongs to, or [`CONTROL_SESSION`].
    pub session_id: SessionId,
    /// Unique name of the sender, if known.
    pub sender: Option<String>,
    /// Unique name of the destination. `None` means broadcast.
    pub destination: Option<String>,
    /// Interface name, for signals and method calls.
    pub interface: Option<String>,
    /// Member name within the interface.
    pub member: Option<String>,
    /// Whether the message was sent over an unreliable transport and may
    /// arrive out of order or more than once.
    pub unreliable: bool,
    /// Maximum time the message may sit in a transmit queue before it is
    /// considered undeliverable. `None` means it never expires.
    pub ttl: Option<Duration>,
    /// Marshalled message body.
    pub payload: Bytes,
}

impl Message {
    /// Returns `true` if the message has no specific destination.
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }
}

/// Requested session characteristics, used when selecting a link for a
/// session.
///
/// Candidate ranking by option compatibility and hop count needs metrics the
/// name exchange does not carry yet, so these options are currently recorded
/// but not consulted; see [`VirtualEndpoint::select_link`](crate::VirtualEndpoint::select_link).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionOpts {
    /// Whether the session requires reliable, in-order delivery.
    pub reliable: bool,
    /// Whether the session is multi-point (more than two participants).
    pub multipoint: bool,
}
