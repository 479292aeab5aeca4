//! Per-link worker task loops.
//!
//! Each started link runs one transmit worker and one receive worker. Worker
//! errors never cross task boundaries: they are recorded as the link's
//! disconnect reason and end the loop, which cascades through
//! [`Link::task_exited`] to stop the sibling.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::{
    codec::{MessageSink, MessageSource},
    error::{DecodeError, DisconnectReason, DispatchError},
    link::{Link, LinkWorker},
    message::Message,
    router::SessionRouter,
};

/// Drains the transmit queue into the sink until stopped or a write fails.
pub(crate) async fn run_tx(link: Link, mut sink: Box<dyn MessageSink>) {
    trace!(name = %link.name(), "transmit worker started");
    let mut cause = None;

    'run: loop {
        // The stopping flag is set before the queue is notified, so checking
        // it on both sides of the wait cannot miss a shutdown.
        if link.is_stopping() {
            break 'run;
        }
        link.queue().wait_for_work().await;
        if link.is_stopping() {
            break 'run;
        }
        while let Some(msg) = link.queue().dequeue() {
            // A sink whose write never completes must not wedge shutdown.
            let written = tokio::select! {
                _ = link.tx_stopped() => break 'run,
                written = sink.encode(&msg) => written,
            };
            if let Err(err) = written {
                error!(name = %link.name(), %err, "message delivery failed");
                cause = Some(DisconnectReason::Stream(err.to_string()));
                break 'run;
            }
            if link.is_stopping() {
                break 'run;
            }
        }
    }

    // No producer may stay parked on a dead link.
    link.queue().close();
    link.task_exited(LinkWorker::Transmit, cause);
}

/// Reads, decodes and routes inbound messages until stopped or the stream
/// dies.
pub(crate) async fn run_rx(
    link: Link,
    mut source: Box<dyn MessageSource>,
    router: Arc<dyn SessionRouter>,
) {
    trace!(name = %link.name(), "receive worker started");
    let mut cause = None;

    'run: while !link.is_stopping() {
        let decoded = tokio::select! {
            _ = link.rx_stopped() => break 'run,
            decoded = source.decode() => decoded,
        };
        match decoded {
            Ok(msg) => match router.dispatch(msg, &link).await {
                Ok(()) => {}
                Err(
                    err @ (DispatchError::SignatureMismatch | DispatchError::UnmatchedReplySerial),
                ) => {
                    warn!(name = %link.name(), %err, "discarding inbound message");
                }
                Err(err) => {
                    error!(name = %link.name(), %err, "inbound dispatch failed");
                    cause = Some(DisconnectReason::Dispatch(err.to_string()));
                    break 'run;
                }
            },
            Err(DecodeError::NeedsHeaderExpansion(msg)) => {
                router.request_header_expansion(msg, &link).await;
            }
            Err(DecodeError::TtlExpired) => {
                debug!(name = %link.name(), "TTL expired, discarding inbound message");
            }
            Err(DecodeError::InvalidSerial(msg)) => {
                if tolerates_invalid_serial(&link, &msg) {
                    debug!(
                        name = %link.name(),
                        serial = msg.serial,
                        interface = msg.interface.as_deref(),
                        "invalid serial, discarding"
                    );
                } else {
                    error!(
                        name = %link.name(),
                        serial = msg.serial,
                        interface = msg.interface.as_deref(),
                        member = msg.member.as_deref(),
                        "invalid header serial"
                    );
                    cause = Some(DisconnectReason::Protocol("invalid header serial".into()));
                    break 'run;
                }
            }
            Err(DecodeError::SocketClosed) => {
                cause = Some(DisconnectReason::ClosedByPeer);
                break 'run;
            }
            Err(DecodeError::Stream(err)) => {
                error!(name = %link.name(), %err, "receive worker exiting");
                cause = Some(DisconnectReason::Stream(err.to_string()));
                break 'run;
            }
        }
    }

    link.task_exited(LinkWorker::Receive, cause);
}

/// Invalid serial numbers are tolerated for unreliable messages and for
/// broadcasts arriving over bus-to-bus links, because those can legitimately
/// be delivered out of order or more than once; control-plane interfaces on
/// the configured allow-list are also tolerated. Everything else drops the
/// connection.
fn tolerates_invalid_serial(link: &Link, msg: &Message) -> bool {
    msg.unreliable
        || (link.is_bus_to_bus() && msg.is_broadcast())
        || msg
            .interface
            .as_deref()
            .is_some_and(|interface| {
                link.serial_tolerant_interfaces()
                    .iter()
                    .any(|tolerated| tolerated == interface)
            })
}
