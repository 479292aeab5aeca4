//! Virtual endpoints: the routing-layer representation of a remote peer.
//!
//! A [`VirtualEndpoint`] multiplexes traffic for many sessions over one or
//! more physical links to the peer. It maintains the session → link mapping
//! and the per-link session reference counts that decide when a link, or the
//! endpoint itself, may be torn down.
//!
//! All mapping mutations and reads take the endpoint's single lock. The lock
//! is never held across a call into a link's enqueue path — delivery copies
//! the candidate links out, releases the lock, then enqueues — so the
//! endpoint lock can never form a cycle with a link's queue lock.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use tracing::{debug, trace};

use crate::{
    error::{DeliverError, EnqueueError, RouteError},
    link::Link,
    message::{Message, SessionId, SessionOpts, CONTROL_SESSION},
};

#[derive(Default)]
struct RouteTable {
    /// Session id → links serving that session, in insertion order.
    /// Entries under [`CONTROL_SESSION`] are the control routes.
    links: BTreeMap<SessionId, Vec<Link>>,
    /// Set once the endpoint has ever carried a non-control session
    /// mapping. Such endpoints represent a remote daemon's bus controller
    /// and must survive transient session-less periods.
    had_refs: bool,
}

struct EndpointShared {
    unique_name: String,
    routes: Mutex<RouteTable>,
}

/// A remote logical peer reachable through one or more physical links.
///
/// Cheap to clone; all clones share the same route table.
#[derive(Clone)]
pub struct VirtualEndpoint {
    shared: Arc<EndpointShared>,
}

impl VirtualEndpoint {
    /// Creates an endpoint for `unique_name`, reachable over `control_link`.
    ///
    /// The link is inserted as a control route (session id 0).
    pub fn new(unique_name: impl Into<String>, control_link: &Link) -> VirtualEndpoint {
        let mut table = RouteTable::default();
        table
            .links
            .insert(CONTROL_SESSION, vec![control_link.clone()]);
        VirtualEndpoint {
            shared: Arc::new(EndpointShared {
                unique_name: unique_name.into(),
                routes: Mutex::new(table),
            }),
        }
    }

    /// Unique name of the remote peer this endpoint represents.
    pub fn unique_name(&self) -> &str {
        &self.shared.unique_name
    }

    /// Adds `link` as a control route if it is not one already.
    ///
    /// Returns whether the link was newly added.
    pub fn add_link(&self, link: &Link) -> bool {
        trace!(name = %self.shared.unique_name, link = %link.name(), "adding bus-to-bus link");
        let mut table = self.shared.routes.lock().unwrap();
        let routes = table.links.entry(CONTROL_SESSION).or_default();
        if routes.iter().any(|l| l.same_link(link)) {
            return false;
        }
        routes.push(link.clone());
        true
    }

    /// Removes every mapping that points at `link`, decrementing its
    /// session reference count once per removed non-control mapping.
    ///
    /// Returns whether the endpoint is now empty and eligible for removal:
    /// once the endpoint has ever carried session references, only
    /// non-control mappings count against emptiness; otherwise any mapping
    /// keeps it alive.
    pub fn remove_link(&self, link: &Link) -> bool {
        trace!(name = %self.shared.unique_name, link = %link.name(), "removing bus-to-bus link");
        let mut table = self.shared.routes.lock().unwrap();
        table.links.retain(|&id, routes| {
            routes.retain(|l| {
                if l.same_link(link) {
                    if id != CONTROL_SESSION {
                        l.dec_session_refs();
                    }
                    false
                } else {
                    true
                }
            });
            !routes.is_empty()
        });
        if table.had_refs {
            table.links.range(1..).next().is_none()
        } else {
            table.links.is_empty()
        }
    }

    /// Maps `session_id` to `link`, incrementing the link's session
    /// reference count.
    ///
    /// Fails without side effects if the link is not one of this endpoint's
    /// control routes.
    ///
    /// # Panics
    ///
    /// Panics if `session_id` is [`CONTROL_SESSION`]; control routes are
    /// managed through [`add_link`](VirtualEndpoint::add_link).
    pub fn add_session_ref(&self, session_id: SessionId, link: &Link) -> Result<(), RouteError> {
        assert_ne!(
            session_id, CONTROL_SESSION,
            "session id 0 is reserved for control routes"
        );
        trace!(
            name = %self.shared.unique_name,
            session_id,
            link = %link.name(),
            "adding session ref"
        );
        let mut table = self.shared.routes.lock().unwrap();
        let can_use = table
            .links
            .get(&CONTROL_SESSION)
            .is_some_and(|routes| routes.iter().any(|l| l.same_link(link)));
        if !can_use {
            return Err(RouteError::NoRoute);
        }
        link.inc_session_refs();
        table.links.entry(session_id).or_default().push(link.clone());
        table.had_refs = true;
        Ok(())
    }

    /// Selects a link for `session_id`, maps the session to it and returns
    /// it.
    ///
    /// Candidate ranking by option compatibility and hop count needs metrics
    /// the name exchange does not carry yet, so `opts` is currently ignored:
    /// the link already serving this session wins, else the first control
    /// route (insertion order breaks ties).
    ///
    /// # Panics
    ///
    /// Panics if `session_id` is [`CONTROL_SESSION`].
    pub fn select_link(
        &self,
        session_id: SessionId,
        _opts: Option<&SessionOpts>,
    ) -> Result<Link, RouteError> {
        assert_ne!(
            session_id, CONTROL_SESSION,
            "session id 0 is reserved for control routes"
        );
        let candidate = {
            let table = self.shared.routes.lock().unwrap();
            table
                .links
                .get(&session_id)
                .and_then(|routes| routes.first())
                .or_else(|| {
                    table
                        .links
                        .get(&CONTROL_SESSION)
                        .and_then(|routes| routes.first())
                })
                .cloned()
        };
        let link = candidate.ok_or(RouteError::NoRoute)?;
        self.add_session_ref(session_id, &link)?;
        Ok(link)
    }

    /// Removes one mapping for `session_id`, decrementing the mapped link's
    /// session reference count. Logged no-op if the session is not mapped.
    ///
    /// # Panics
    ///
    /// Panics if `session_id` is [`CONTROL_SESSION`].
    pub fn remove_session_ref(&self, session_id: SessionId) {
        assert_ne!(
            session_id, CONTROL_SESSION,
            "session id 0 is reserved for control routes"
        );
        trace!(name = %self.shared.unique_name, session_id, "removing session ref");
        let mut table = self.shared.routes.lock().unwrap();
        match table.links.get_mut(&session_id) {
            Some(routes) if !routes.is_empty() => {
                let link = routes.remove(0);
                link.dec_session_refs();
                if routes.is_empty() {
                    table.links.remove(&session_id);
                }
            }
            _ => {
                debug!(
                    name = %self.shared.unique_name,
                    session_id,
                    "no mapping found for session"
                );
            }
        }
    }

    /// Whether `link` is reachable as one of this endpoint's control routes
    /// and may therefore carry session traffic.
    pub fn can_use_route(&self, link: &Link) -> bool {
        let table = self.shared.routes.lock().unwrap();
        table
            .links
            .get(&CONTROL_SESSION)
            .is_some_and(|routes| routes.iter().any(|l| l.same_link(link)))
    }

    /// Whether the endpoint would still be reachable if every link to the
    /// daemon identified by `guid` disappeared.
    pub fn can_route_without(&self, guid: &str) -> bool {
        let table = self.shared.routes.lock().unwrap();
        table
            .links
            .values()
            .flatten()
            .any(|link| link.remote_guid() != guid)
    }

    /// First link mapped to `session_id`, plus the total number of links
    /// serving that session.
    pub fn link_for_session(&self, session_id: SessionId) -> (Option<Link>, usize) {
        let table = self.shared.routes.lock().unwrap();
        match table.links.get(&session_id) {
            Some(routes) => (routes.first().cloned(), routes.len()),
            None => (None, 0),
        }
    }

    /// The non-control sessions `link` currently serves.
    pub fn session_ids_for_link(&self, link: &Link) -> Vec<SessionId> {
        let table = self.shared.routes.lock().unwrap();
        table
            .links
            .range(1..)
            .filter(|(_, routes)| routes.iter().any(|l| l.same_link(link)))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Delivers `msg` on the session recorded in its header.
    pub async fn deliver(&self, msg: Message) -> Result<(), DeliverError> {
        let session_id = msg.session_id;
        self.deliver_on(msg, session_id).await
    }

    /// Delivers `msg` on `session_id`.
    ///
    /// Every link mapped to the session is tried in insertion order until
    /// one accepts the message; a link that reports it is closing is
    /// skipped, so a session transparently fails over while one of its
    /// links is mid-teardown. Fails only when no link accepted the message.
    pub async fn deliver_on(&self, msg: Message, session_id: SessionId) -> Result<(), DeliverError> {
        let candidates: Vec<Link> = {
            let table = self.shared.routes.lock().unwrap();
            table.links.get(&session_id).cloned().unwrap_or_default()
        };
        let mut status = Err(DeliverError::NoRoute);
        for link in candidates {
            match link.enqueue(msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(EnqueueError::Closing) => status = Err(DeliverError::Closing),
            }
        }
        status
    }
}

impl fmt::Debug for VirtualEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualEndpoint")
            .field("unique_name", &self.shared.unique_name)
            .finish()
    }
}
