//! Physical bus-to-bus links.
//!
//! A [`Link`] owns one socket-level connection to a remote daemon: a bounded
//! transmit queue, a transmit worker task and a receive worker task. The two
//! workers die together — whichever exits first stops its sibling, and when
//! both have confirmed exit the link unregisters itself from the session
//! router and notifies its exit listener exactly once.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::{error, trace};

use crate::{
    codec::{MessageSink, MessageSource},
    config::LinkConfig,
    error::{DisconnectReason, EnqueueError, StartError},
    message::Message,
    queue::TxQueue,
    router::{ExitListener, SessionRouter},
    worker,
};

/// Lifecycle state of a [`Link`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Constructed but not yet started.
    Created,
    /// Both workers are running and the link is registered for routing.
    Running,
    /// Shutdown has begun; new traffic is rejected.
    Stopping,
    /// Both workers have fully exited and been joined.
    Joined,
}

/// Identifies one of a link's two worker tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkWorker {
    Transmit,
    Receive,
}

impl fmt::Display for LinkWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkWorker::Transmit => write!(f, "tx"),
            LinkWorker::Receive => write!(f, "rx"),
        }
    }
}

struct LinkIo {
    source: Box<dyn MessageSource>,
    sink: Box<dyn MessageSink>,
}

#[derive(Default)]
struct TaskHandles {
    tx: Option<JoinHandle<()>>,
    rx: Option<JoinHandle<()>>,
}

struct LinkShared {
    name: String,
    remote_guid: String,
    incoming: bool,
    bus_to_bus: AtomicBool,
    allow_remote: AtomicBool,
    serial_tolerant: Vec<String>,
    queue: TxQueue,
    state: Mutex<LinkState>,
    stopping: AtomicBool,
    /// Interrupts the receive worker's blocking decode.
    rx_stop: Notify,
    /// Interrupts the transmit worker's blocking write.
    tx_stop: Notify,
    /// Reaches 2 when both workers have reported exit.
    exit_count: AtomicU8,
    /// Number of live non-control session mappings pointing at this link.
    session_refs: AtomicUsize,
    /// First worker failure wins; later causes are ignored.
    disconnect: OnceLock<DisconnectReason>,
    io: Mutex<Option<LinkIo>>,
    router: Mutex<Option<Arc<dyn SessionRouter>>>,
    listener: Mutex<Option<Arc<dyn ExitListener>>>,
    tasks: Mutex<TaskHandles>,
}

/// Handle to a physical link. Cheap to clone; all clones refer to the same
/// underlying connection.
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl Link {
    /// Creates a link over an established stream.
    ///
    /// `incoming` records whether the connection was accepted rather than
    /// dialed, and is used only for diagnostics. The link owns the codec
    /// halves from here on; nothing runs until [`start`](Link::start).
    pub fn new(
        name: impl Into<String>,
        remote_guid: impl Into<String>,
        incoming: bool,
        source: Box<dyn MessageSource>,
        sink: Box<dyn MessageSink>,
        config: LinkConfig,
    ) -> Link {
        Link {
            shared: Arc::new(LinkShared {
                name: name.into(),
                remote_guid: remote_guid.into(),
                incoming,
                bus_to_bus: AtomicBool::new(false),
                allow_remote: AtomicBool::new(false),
                serial_tolerant: config.serial_tolerant_interfaces,
                queue: TxQueue::new(config.tx_queue_capacity, config.max_enqueue_wait),
                state: Mutex::new(LinkState::Created),
                stopping: AtomicBool::new(false),
                rx_stop: Notify::new(),
                tx_stop: Notify::new(),
                exit_count: AtomicU8::new(0),
                session_refs: AtomicUsize::new(0),
                disconnect: OnceLock::new(),
                io: Mutex::new(Some(LinkIo { source, sink })),
                router: Mutex::new(None),
                listener: Mutex::new(None),
                tasks: Mutex::new(TaskHandles::default()),
            }),
        }
    }

    /// Starts both workers and registers the link with the session router.
    ///
    /// The transmit worker starts first, then the endpoint is registered,
    /// then the receive worker starts — so no inbound message can be routed
    /// before the link is registered. If registration fails, everything
    /// started so far is unwound and the link is left unregistered.
    pub async fn start(
        &self,
        router: Arc<dyn SessionRouter>,
        is_bus_to_bus: bool,
        allow_remote: bool,
    ) -> Result<(), StartError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != LinkState::Created {
                return Err(StartError::AlreadyStarted);
            }
            *state = LinkState::Running;
        }
        trace!(name = %self.shared.name, is_bus_to_bus, allow_remote, "link starting");

        self.shared.bus_to_bus.store(is_bus_to_bus, Ordering::Release);
        self.shared.allow_remote.store(allow_remote, Ordering::Release);

        let LinkIo { source, sink } = self
            .shared
            .io
            .lock()
            .unwrap()
            .take()
            .ok_or(StartError::AlreadyStarted)?;
        *self.shared.router.lock().unwrap() = Some(router.clone());

        let tx = tokio::spawn(worker::run_tx(self.clone(), sink));
        self.shared.tasks.lock().unwrap().tx = Some(tx);

        if let Err(err) = router.register_endpoint(self) {
            error!(name = %self.shared.name, %err, "link start failed");
            self.stop();
            self.join().await;
            router.unregister_endpoint(self);
            return Err(StartError::Register(err));
        }

        let rx = tokio::spawn(worker::run_rx(self.clone(), source, router));
        self.shared.tasks.lock().unwrap().rx = Some(rx);
        Ok(())
    }

    /// Sets the listener notified when the link has fully exited.
    pub fn set_exit_listener(&self, listener: Arc<dyn ExitListener>) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }

    /// Appends an outbound message to the transmit queue, waiting for room
    /// if it is full.
    ///
    /// Fails fast with [`EnqueueError::Closing`] once shutdown has begun;
    /// new traffic on a dying link risks deadlock when teardown
    /// notifications are broadcast to the very link being closed.
    pub async fn enqueue(&self, msg: Message) -> Result<(), EnqueueError> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(EnqueueError::Closing);
        }
        self.shared.queue.enqueue(msg).await
    }

    /// Requests both workers to stop and releases every producer parked on
    /// the transmit queue. Idempotent; does not wait for the workers.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != LinkState::Joined {
                *state = LinkState::Stopping;
            }
        }
        trace!(name = %self.shared.name, "link stopping");
        self.shared.queue.close();
        self.shared.rx_stop.notify_one();
        self.shared.tx_stop.notify_one();
    }

    /// Waits until both workers have fully exited.
    pub async fn join(&self) {
        let (tx, rx) = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            (tasks.tx.take(), tasks.rx.take())
        };
        if let Some(tx) = tx {
            let _ = tx.await;
        }
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        *self.shared.state.lock().unwrap() = LinkState::Joined;
    }

    /// The link's stable unique name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// GUID of the remote daemon this link connects to.
    pub fn remote_guid(&self) -> &str {
        &self.shared.remote_guid
    }

    /// Whether the connection was accepted rather than dialed.
    pub fn is_incoming(&self) -> bool {
        self.shared.incoming
    }

    /// Whether the link carries daemon-to-daemon traffic.
    pub fn is_bus_to_bus(&self) -> bool {
        self.shared.bus_to_bus.load(Ordering::Acquire)
    }

    /// Whether untrusted remote traffic is allowed over this link.
    pub fn allows_remote(&self) -> bool {
        self.shared.allow_remote.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.lock().unwrap()
    }

    /// Whether shutdown has begun.
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Why the link disconnected, once a worker has failed. `None` while
    /// the link is healthy or after a clean stop.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.disconnect.get().cloned()
    }

    /// Whether two handles refer to the same underlying link.
    pub fn same_link(&self, other: &Link) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of live non-control session mappings pointing at this link.
    pub fn session_ref_count(&self) -> usize {
        self.shared.session_refs.load(Ordering::Acquire)
    }

    /// Records one more session mapping using this link.
    ///
    /// Called by [`VirtualEndpoint`](crate::VirtualEndpoint) while holding
    /// its own lock; the counter is atomic so it never serializes against
    /// the link's shutdown path.
    pub fn inc_session_refs(&self) {
        self.shared.session_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Records one fewer session mapping using this link.
    pub fn dec_session_refs(&self) {
        self.shared.session_refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn queue(&self) -> &TxQueue {
        &self.shared.queue
    }

    pub(crate) fn serial_tolerant_interfaces(&self) -> &[String] {
        &self.shared.serial_tolerant
    }

    pub(crate) async fn rx_stopped(&self) {
        self.shared.rx_stop.notified().await;
    }

    pub(crate) async fn tx_stopped(&self) {
        self.shared.tx_stop.notified().await;
    }

    /// Reports one worker's exit.
    ///
    /// The first exit forces the sibling worker to stop. When the second
    /// exit arrives the link unregisters from the router and fires the exit
    /// listener — exactly once, regardless of which worker exits first.
    pub(crate) fn task_exited(&self, which: LinkWorker, cause: Option<DisconnectReason>) {
        if let Some(cause) = cause {
            let _ = self.shared.disconnect.set(cause);
        }
        trace!(name = %self.shared.name, worker = %which, "link worker exited");

        // If one worker stops, the other must too.
        self.stop();

        if self.shared.exit_count.fetch_add(1, Ordering::AcqRel) + 1 == 2 {
            let router = self.shared.router.lock().unwrap().clone();
            if let Some(router) = router {
                router.unregister_endpoint(self);
            }
            let listener = self.shared.listener.lock().unwrap().clone();
            if let Some(listener) = listener {
                listener.on_endpoint_exit(self);
            }
            trace!(name = %self.shared.name, reason = ?self.shared.disconnect.get(), "link exited");
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.shared.name)
            .field("remote_guid", &self.shared.remote_guid)
            .field("state", &self.state())
            .finish()
    }
}
