//! Fake collaborators for exercising links end to end: a channel-backed
//! codec, a scriptable session router and a counting exit listener.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};

use busmux::{
    codec::{MessageSink, MessageSource},
    error::{BoxError, DecodeError, DispatchError},
    link::Link,
    message::{Message, SessionId},
    router::{ExitListener, SessionRouter},
};

/// Installs the global tracing subscriber for a test binary, honoring
/// `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn msg(serial: u32) -> Message {
    Message {
        serial,
        destination: Some(":dest.1".to_string()),
        ..Default::default()
    }
}

pub fn session_msg(serial: u32, session_id: SessionId) -> Message {
    Message {
        session_id,
        ..msg(serial)
    }
}

/// Inbound side of a fake stream: whatever the test pushes into the sender
/// comes out of `decode`. Closing the sender reads as the peer closing the
/// stream.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Message, DecodeError>>,
}

pub fn channel_source() -> (
    mpsc::UnboundedSender<Result<Message, DecodeError>>,
    Box<dyn MessageSource>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Box::new(ChannelSource { rx }))
}

impl MessageSource for ChannelSource {
    fn decode(&mut self) -> BoxFuture<'_, Result<Message, DecodeError>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(item) => item,
                None => Err(DecodeError::SocketClosed),
            }
        })
    }
}

/// Outbound side of a fake stream: encoded messages come out of the paired
/// receiver. Dropping the receiver reads as a broken pipe.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

pub fn channel_sink() -> (Box<dyn MessageSink>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(ChannelSink { tx }), rx)
}

impl MessageSink for ChannelSink {
    fn encode<'a>(&'a mut self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.tx
                .send(msg.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        })
    }
}

/// A sink that must be granted one permit per write, for tests that need the
/// transmit worker wedged mid-delivery.
pub struct GatedSink {
    tx: mpsc::UnboundedSender<Message>,
    gate: Arc<Semaphore>,
}

pub fn gated_sink(gate: Arc<Semaphore>) -> (Box<dyn MessageSink>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(GatedSink { tx, gate }), rx)
}

impl MessageSink for GatedSink {
    fn encode<'a>(&'a mut self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?;
            permit.forget();
            self.tx
                .send(msg.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        })
    }
}

/// Scriptable fake of the daemon's router: counts registrations, forwards
/// dispatched messages to the test, and can be told to fail upcoming
/// operations.
pub struct TestRouter {
    pub registered: AtomicUsize,
    pub unregistered: AtomicUsize,
    pub expansions: AtomicUsize,
    fail_register: bool,
    dispatch_script: Mutex<VecDeque<DispatchError>>,
    dispatched: mpsc::UnboundedSender<Message>,
}

impl TestRouter {
    pub fn new() -> (Arc<TestRouter>, mpsc::UnboundedReceiver<Message>) {
        Self::build(false)
    }

    pub fn failing_registration() -> (Arc<TestRouter>, mpsc::UnboundedReceiver<Message>) {
        Self::build(true)
    }

    fn build(fail_register: bool) -> (Arc<TestRouter>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(TestRouter {
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
            expansions: AtomicUsize::new(0),
            fail_register,
            dispatch_script: Mutex::new(VecDeque::new()),
            dispatched: tx,
        });
        (router, rx)
    }

    /// The next dispatch call returns `err` instead of routing the message.
    pub fn script_dispatch_error(&self, err: DispatchError) {
        self.dispatch_script.lock().unwrap().push_back(err);
    }
}

impl SessionRouter for TestRouter {
    fn register_endpoint(&self, _link: &Link) -> Result<(), BoxError> {
        if self.fail_register {
            return Err("registration refused".into());
        }
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_endpoint(&self, _link: &Link) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
    }

    fn dispatch<'a>(
        &'a self,
        msg: Message,
        _source: &'a Link,
    ) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            if let Some(err) = self.dispatch_script.lock().unwrap().pop_front() {
                return Err(err);
            }
            let _ = self.dispatched.send(msg);
            Ok(())
        })
    }

    fn request_header_expansion<'a>(
        &'a self,
        _msg: Message,
        _source: &'a Link,
    ) -> BoxFuture<'a, ()> {
        self.expansions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

/// Counts exit notifications and signals each one to the test.
pub struct CountingListener {
    pub exits: AtomicUsize,
    tx: mpsc::UnboundedSender<String>,
}

impl CountingListener {
    pub fn new() -> (Arc<CountingListener>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(CountingListener {
            exits: AtomicUsize::new(0),
            tx,
        });
        (listener, rx)
    }
}

impl ExitListener for CountingListener {
    fn on_endpoint_exit(&self, link: &Link) {
        self.exits.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(link.name().to_string());
    }
}
