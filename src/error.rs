//! Error types used throughout busmux.
//!
//! Worker-side failures are never propagated across task boundaries; they are
//! recorded as a link's [`DisconnectReason`] (first cause wins) and terminate
//! the worker loop. Caller-facing operations return status values and never
//! panic for expected failure modes.

use std::{error, io};

use crate::message::Message;

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Error returned when enqueueing a message onto a link's transmit queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The link is shutting down and accepts no new traffic.
    #[error("link is closing")]
    Closing,
}

/// Error returned when delivering a message through a virtual endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliverError {
    /// No link is mapped for the requested session.
    #[error("no route for session")]
    NoRoute,
    /// Every candidate link reported that it is closing.
    #[error("all routes are closing")]
    Closing,
}

/// Error returned by session reference operations on a virtual endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The link is not reachable through one of the endpoint's control
    /// routes, or no candidate link exists.
    #[error("link has no control route on this endpoint")]
    NoRoute,
}

/// Error returned by [`Link::start`](crate::Link::start).
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The link was already started once.
    #[error("link already started")]
    AlreadyStarted,
    /// The session router rejected the endpoint registration.
    #[error("failed to register endpoint: {0}")]
    Register(#[source] BoxError),
}

/// Outcome of decoding one inbound message from the stream.
///
/// Everything except a successfully decoded [`Message`] is reported through
/// this error; the receive worker classifies each variant as transient or
/// link-fatal.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The message uses a compressed header this daemon cannot expand; the
    /// expansion rule must be requested from the sending endpoint.
    #[error("message requires header expansion")]
    NeedsHeaderExpansion(Message),
    /// The message's time-to-live elapsed before it was decoded.
    #[error("message time-to-live expired")]
    TtlExpired,
    /// The message carries an out-of-sequence serial number.
    #[error("invalid header serial")]
    InvalidSerial(Message),
    /// The remote peer closed the stream.
    #[error("stream closed by peer")]
    SocketClosed,
    /// The stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),
}

/// Outcome of handing an inbound message to the session router.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The message body does not match the expected signature. Transient;
    /// the message is discarded and the link keeps reading.
    #[error("signature mismatch")]
    SignatureMismatch,
    /// A method reply arrived with a serial no outstanding call matches.
    /// Transient; the message is discarded and the link keeps reading.
    #[error("unmatched reply serial")]
    UnmatchedReplySerial,
    /// The router found no endpoint for the destination.
    #[error("no route to destination")]
    NoRoute,
    /// Any other routing failure. Link-fatal.
    #[error("dispatch failed: {0}")]
    Other(BoxError),
}

/// Why a link disconnected; recorded by whichever worker failed first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote peer closed the stream.
    ClosedByPeer,
    /// The stream failed while reading or writing.
    Stream(String),
    /// The peer violated the protocol (e.g. an invalid serial outside the
    /// tolerated conditions).
    Protocol(String),
    /// The session router failed fatally while dispatching an inbound
    /// message.
    Dispatch(String),
}
