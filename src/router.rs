//! Collaborator traits for the session router and endpoint lifecycle
//! listeners.
//!
//! The routing table for local objects lives outside this crate; links call
//! into it through [`SessionRouter`], passed in explicitly at
//! [`Link::start`](crate::Link::start) so the core stays testable against a
//! fake router.

use futures::future::BoxFuture;

use crate::{
    error::{BoxError, DispatchError},
    link::Link,
    message::Message,
};

/// The daemon's message router, as seen from a physical link.
pub trait SessionRouter: Send + Sync {
    /// Makes the link visible to routing. Called during link start, before
    /// the receive worker runs.
    fn register_endpoint(&self, link: &Link) -> Result<(), BoxError>;

    /// Removes the link from routing. Called synchronously when both of the
    /// link's workers have exited, before the exit listener fires, so no
    /// message can be routed to a link that is mid-teardown.
    fn unregister_endpoint(&self, link: &Link);

    /// Routes one inbound message that arrived over `source`.
    ///
    /// Dispatching may block on a destination's transmit queue, which is why
    /// this returns a future.
    fn dispatch<'a>(
        &'a self,
        msg: Message,
        source: &'a Link,
    ) -> BoxFuture<'a, Result<(), DispatchError>>;

    /// Asks the endpoint that sent `msg` for the header expansion rule the
    /// local daemon is missing.
    fn request_header_expansion<'a>(&'a self, msg: Message, source: &'a Link)
        -> BoxFuture<'a, ()>;
}

/// Observer notified when a link has fully shut down.
pub trait ExitListener: Send + Sync {
    /// Called exactly once per link, after both workers have exited and the
    /// link has been unregistered from the router.
    fn on_endpoint_exit(&self, link: &Link);
}
