//! Collaborator traits for the message wire codec.
//!
//! The byte-level marshalling format is out of scope for this crate; a link
//! is handed one [`MessageSource`] and one [`MessageSink`] at construction
//! and never looks below them. Both traits are object safe, returning
//! [`BoxFuture`]s, so transports can be mixed freely behind `Box<dyn _>`.

use std::io;

use futures::future::BoxFuture;

use crate::{error::DecodeError, message::Message};

/// The read half of a link's stream, combined with the wire decoder.
pub trait MessageSource: Send {
    /// Waits for stream data and decodes exactly one message.
    ///
    /// The receive worker drops this future when the link is asked to stop,
    /// so implementations must be cancellation safe: a dropped `decode` call
    /// must not lose or tear a message that a later call would have
    /// returned.
    fn decode(&mut self) -> BoxFuture<'_, Result<Message, DecodeError>>;
}

/// The write half of a link's stream, combined with the wire encoder.
pub trait MessageSink: Send {
    /// Encodes and writes one message to the stream.
    ///
    /// Write failures are not retried; the first failure becomes the link's
    /// disconnect reason and stops both workers.
    ///
    /// The transmit worker drops this future when the link is asked to stop,
    /// so implementations must be cancellation safe: a dropped `encode` call
    /// may lose the message in flight (the link is dying anyway) but must
    /// leave the underlying stream and encoder state consistent.
    fn encode<'a>(&'a mut self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>>;
}
