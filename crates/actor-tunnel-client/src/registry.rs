//! Bookkeeping for actors, in-flight requests, WebSocket sessions and
//! unacknowledged messages.
//!
//! The registry is plain data. [`crate::TunnelClient`] keeps it behind a
//! single mutex and performs every side effect (resolving callers, closing
//! adapters, emitting frames) after the lock is released.

use http::Response;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

use actor_tunnel_proto::{MessageId, RequestId};

use crate::adapter::WebSocketAdapter;
use crate::body::{Body, BodySender};
use crate::error::TunnelError;

pub(crate) type Responder = oneshot::Sender<Result<Response<Body>, TunnelError>>;

/// Which side opened a request or session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Opened by the gateway, served by a local handler
    Inbound,
    /// Opened locally with `fetch` or `open_websocket`
    Outbound,
}

/// An HTTP exchange in flight.
///
/// For inbound requests `body` feeds the request body read by the handler.
/// For outbound requests `responder` resolves the caller once and `body`
/// then feeds the streamed response body.
pub(crate) struct PendingRequest {
    pub direction: Direction,
    pub actor_id: String,
    pub responder: Option<Responder>,
    pub body: Option<BodySender>,
    pub task: Option<AbortHandle>,
}

impl PendingRequest {
    pub fn inbound(actor_id: impl Into<String>, body: Option<BodySender>) -> Self {
        Self {
            direction: Direction::Inbound,
            actor_id: actor_id.into(),
            responder: None,
            body,
            task: None,
        }
    }

    pub fn outbound(actor_id: impl Into<String>, responder: Responder) -> Self {
        Self {
            direction: Direction::Outbound,
            actor_id: actor_id.into(),
            responder: Some(responder),
            body: None,
            task: None,
        }
    }
}

struct PendingMessage {
    request_id: RequestId,
    sent_at: Instant,
}

struct TunneledWebSocket {
    direction: Direction,
    adapter: WebSocketAdapter,
}

#[derive(Default)]
struct ActorMembers {
    requests: HashSet<RequestId>,
    websockets: HashSet<RequestId>,
}

/// Everything removed from the registry in one step
#[derive(Default)]
pub(crate) struct Evicted {
    pub requests: Vec<(RequestId, PendingRequest)>,
    pub websockets: Vec<(RequestId, WebSocketAdapter)>,
}

impl Evicted {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.websockets.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    actors: HashMap<String, ActorMembers>,
    owners: HashMap<RequestId, String>,
    requests: HashMap<RequestId, PendingRequest>,
    websockets: HashMap<RequestId, TunneledWebSocket>,
    messages: HashMap<MessageId, PendingMessage>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the actor was already registered
    pub fn register_actor(&mut self, actor_id: &str) -> bool {
        if self.actors.contains_key(actor_id) {
            return false;
        }
        self.actors.insert(actor_id.to_string(), ActorMembers::default());
        true
    }

    pub fn has_actor(&self, actor_id: &str) -> bool {
        self.actors.contains_key(actor_id)
    }

    /// Remove the actor together with every request and session it owns.
    ///
    /// Returns `None` if the actor was not registered.
    pub fn unregister_actor(&mut self, actor_id: &str) -> Option<Evicted> {
        let members = self.actors.remove(actor_id)?;
        let mut evicted = Evicted::default();

        for request_id in members.requests {
            self.owners.remove(&request_id);
            if let Some(pending) = self.requests.remove(&request_id) {
                evicted.requests.push((request_id, pending));
            }
        }
        for request_id in members.websockets {
            self.owners.remove(&request_id);
            if let Some(websocket) = self.websockets.remove(&request_id) {
                evicted.websockets.push((request_id, websocket.adapter));
            }
        }

        Some(evicted)
    }

    /// Insert an inbound request owned by a registered actor.
    ///
    /// Fails without inserting if the actor is gone or the id is taken.
    pub fn insert_actor_request(
        &mut self,
        request_id: RequestId,
        pending: PendingRequest,
    ) -> Result<(), PendingRequest> {
        if !self.actors.contains_key(&pending.actor_id) || self.requests.contains_key(&request_id)
        {
            return Err(pending);
        }
        let actor_id = pending.actor_id.clone();
        self.requests.insert(request_id, pending);
        self.track(&actor_id, request_id, false);
        Ok(())
    }

    /// Insert a request that no local actor owns
    pub fn insert_request(&mut self, request_id: RequestId, pending: PendingRequest) {
        self.requests.insert(request_id, pending);
    }

    pub fn request_mut(&mut self, request_id: &RequestId) -> Option<&mut PendingRequest> {
        self.requests.get_mut(request_id)
    }

    pub fn remove_request(&mut self, request_id: &RequestId) -> Option<PendingRequest> {
        let pending = self.requests.remove(request_id)?;
        self.untrack(request_id, false);
        Some(pending)
    }

    /// Attach the handler task serving an inbound request
    pub fn set_request_task(&mut self, request_id: &RequestId, task: AbortHandle) -> bool {
        match self.requests.get_mut(request_id) {
            Some(pending) => {
                pending.task = Some(task);
                true
            }
            None => false,
        }
    }

    /// Insert a session owned by a registered actor.
    ///
    /// Fails without inserting if the actor is gone or the id is taken.
    pub fn insert_actor_websocket(
        &mut self,
        request_id: RequestId,
        actor_id: &str,
        adapter: WebSocketAdapter,
    ) -> bool {
        if !self.actors.contains_key(actor_id) || self.websockets.contains_key(&request_id) {
            return false;
        }
        self.websockets.insert(
            request_id,
            TunneledWebSocket {
                direction: Direction::Inbound,
                adapter,
            },
        );
        self.track(actor_id, request_id, true);
        true
    }

    /// Insert a locally opened session
    pub fn insert_websocket(&mut self, request_id: RequestId, adapter: WebSocketAdapter) {
        self.websockets.insert(
            request_id,
            TunneledWebSocket {
                direction: Direction::Outbound,
                adapter,
            },
        );
    }

    /// The session `request_id`, if it was opened from `direction`
    pub fn websocket(
        &self,
        request_id: &RequestId,
        direction: Direction,
    ) -> Option<WebSocketAdapter> {
        self.websockets
            .get(request_id)
            .filter(|websocket| websocket.direction == direction)
            .map(|websocket| websocket.adapter.clone())
    }

    pub fn remove_websocket(&mut self, request_id: &RequestId) -> Option<WebSocketAdapter> {
        let websocket = self.websockets.remove(request_id)?;
        self.untrack(request_id, true);
        Some(websocket.adapter)
    }

    /// Remove the session `request_id` only if it was opened from `direction`
    pub fn remove_websocket_in(
        &mut self,
        request_id: &RequestId,
        direction: Direction,
    ) -> Option<WebSocketAdapter> {
        self.websocket(request_id, direction)?;
        self.remove_websocket(request_id)
    }

    pub fn record_message(&mut self, message_id: MessageId, request_id: RequestId, now: Instant) {
        self.messages.insert(
            message_id,
            PendingMessage {
                request_id,
                sent_at: now,
            },
        );
    }

    /// Returns false for unknown or already acknowledged messages
    pub fn ack(&mut self, message_id: &MessageId) -> bool {
        self.messages.remove(message_id).is_some()
    }

    /// Drop messages unacknowledged for longer than `timeout` and evict the
    /// requests and sessions they belong to.
    pub fn expire_messages(&mut self, now: Instant, timeout: Duration) -> (usize, Evicted) {
        let expired: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|(_, message)| now.saturating_duration_since(message.sent_at) > timeout)
            .map(|(message_id, _)| *message_id)
            .collect();

        let mut evicted = Evicted::default();
        for message_id in &expired {
            let Some(message) = self.messages.remove(message_id) else {
                continue;
            };
            let request_id = message.request_id;
            if let Some(pending) = self.remove_request(&request_id) {
                evicted.requests.push((request_id, pending));
            }
            if let Some(adapter) = self.remove_websocket(&request_id) {
                evicted.websockets.push((request_id, adapter));
            }
        }

        (expired.len(), evicted)
    }

    /// Empty every table, actors included
    pub fn drain(&mut self) -> Evicted {
        self.actors.clear();
        self.owners.clear();
        self.messages.clear();

        Evicted {
            requests: self.requests.drain().collect(),
            websockets: self
                .websockets
                .drain()
                .map(|(request_id, websocket)| (request_id, websocket.adapter))
                .collect(),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn active_websockets(&self) -> usize {
        self.websockets.len()
    }

    #[cfg(test)]
    fn unacked_messages(&self) -> usize {
        self.messages.len()
    }

    /// Record `request_id` as owned by `actor_id`, moving it out of any
    /// other actor's set so membership stays exclusive.
    fn track(&mut self, actor_id: &str, request_id: RequestId, websocket: bool) {
        if let Some(previous) = self.owners.get(&request_id).cloned() {
            if previous != actor_id {
                self.untrack(&request_id, websocket);
            }
        }

        if let Some(members) = self.actors.get_mut(actor_id) {
            let set = if websocket {
                &mut members.websockets
            } else {
                &mut members.requests
            };
            set.insert(request_id);
            self.owners.insert(request_id, actor_id.to_string());
        }
    }

    fn untrack(&mut self, request_id: &RequestId, websocket: bool) {
        let Some(actor_id) = self.owners.remove(request_id) else {
            return;
        };
        if let Some(members) = self.actors.get_mut(&actor_id) {
            if websocket {
                members.websockets.remove(request_id);
            } else {
                members.requests.remove(request_id);
            }
        }
    }

    #[cfg(test)]
    fn members(&self, actor_id: &str) -> Option<(usize, usize)> {
        self.actors
            .get(actor_id)
            .map(|members| (members.requests.len(), members.websockets.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn adapter(request_id: RequestId) -> WebSocketAdapter {
        WebSocketAdapter::new(request_id, Box::new(|_: Bytes, _| {}), Box::new(|_, _| {}))
    }

    #[test]
    fn test_register_actor_once() {
        let mut registry = Registry::new();
        assert!(registry.register_actor("actor-1"));
        assert!(!registry.register_actor("actor-1"));
        assert!(registry.has_actor("actor-1"));
        assert!(!registry.has_actor("actor-2"));
    }

    #[test]
    fn test_request_requires_registered_actor() {
        let mut registry = Registry::new();
        let request_id = RequestId::new();

        assert!(registry
            .insert_actor_request(request_id, PendingRequest::inbound("missing", None))
            .is_err());
        assert_eq!(registry.pending_requests(), 0);
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let mut registry = Registry::new();
        registry.register_actor("a");
        let request_id = RequestId::new();

        assert!(registry
            .insert_actor_request(request_id, PendingRequest::inbound("a", None))
            .is_ok());
        assert!(registry
            .insert_actor_request(request_id, PendingRequest::inbound("a", None))
            .is_err());
        assert_eq!(registry.pending_requests(), 1);
    }

    #[test]
    fn test_membership_is_exclusive() {
        let mut registry = Registry::new();
        registry.register_actor("a");
        registry.register_actor("b");
        let request_id = RequestId::new();

        registry.insert_actor_websocket(request_id, "a", adapter(request_id));
        registry.track("b", request_id, true);

        assert_eq!(registry.members("a"), Some((0, 0)));
        assert_eq!(registry.members("b"), Some((0, 1)));
    }

    #[test]
    fn test_remove_untracks_membership() {
        let mut registry = Registry::new();
        registry.register_actor("a");
        let request_id = RequestId::new();
        let ws_id = RequestId::new();

        registry
            .insert_actor_request(request_id, PendingRequest::inbound("a", None))
            .ok();
        registry.insert_actor_websocket(ws_id, "a", adapter(ws_id));
        assert_eq!(registry.members("a"), Some((1, 1)));

        assert!(registry.remove_request(&request_id).is_some());
        assert!(registry.remove_websocket(&ws_id).is_some());
        assert_eq!(registry.members("a"), Some((0, 0)));
        assert!(registry.remove_websocket(&ws_id).is_none());
    }

    #[test]
    fn test_websocket_lookup_matches_direction() {
        let mut registry = Registry::new();
        registry.register_actor("a");
        let inbound = RequestId::new();
        let outbound = RequestId::new();
        registry.insert_actor_websocket(inbound, "a", adapter(inbound));
        registry.insert_websocket(outbound, adapter(outbound));

        assert!(registry.websocket(&inbound, Direction::Inbound).is_some());
        assert!(registry.websocket(&inbound, Direction::Outbound).is_none());
        assert!(registry.websocket(&outbound, Direction::Outbound).is_some());
        assert!(registry.websocket(&outbound, Direction::Inbound).is_none());

        assert!(registry
            .remove_websocket_in(&outbound, Direction::Inbound)
            .is_none());
        assert_eq!(registry.active_websockets(), 2);
        assert!(registry
            .remove_websocket_in(&inbound, Direction::Inbound)
            .is_some());
        assert_eq!(registry.members("a"), Some((0, 0)));
    }

    #[test]
    fn test_unregister_evicts_everything_owned() {
        let mut registry = Registry::new();
        registry.register_actor("a");
        registry.register_actor("b");

        let a_request = RequestId::new();
        let a_ws = RequestId::new();
        let b_request = RequestId::new();
        registry
            .insert_actor_request(a_request, PendingRequest::inbound("a", None))
            .ok();
        registry.insert_actor_websocket(a_ws, "a", adapter(a_ws));
        registry
            .insert_actor_request(b_request, PendingRequest::inbound("b", None))
            .ok();

        let evicted = registry.unregister_actor("a").unwrap();
        assert_eq!(evicted.requests.len(), 1);
        assert_eq!(evicted.requests[0].0, a_request);
        assert_eq!(evicted.websockets.len(), 1);
        assert_eq!(evicted.websockets[0].0, a_ws);

        assert!(!registry.has_actor("a"));
        assert_eq!(registry.pending_requests(), 1);
        assert_eq!(registry.active_websockets(), 0);
        assert!(registry.unregister_actor("a").is_none());
    }

    #[test]
    fn test_expire_messages() {
        let mut registry = Registry::new();
        let now = Instant::now();
        let stale = RequestId::new();
        let fresh = RequestId::new();
        let (tx, _rx) = oneshot::channel();
        registry.insert_request(stale, PendingRequest::outbound("remote", tx));

        let stale_message = MessageId::new();
        registry.record_message(stale_message, stale, now);
        registry.record_message(MessageId::new(), fresh, now + Duration::from_secs(20));

        let (expired, evicted) =
            registry.expire_messages(now + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(expired, 1);
        assert_eq!(evicted.requests.len(), 1);
        assert_eq!(registry.unacked_messages(), 1);
        assert!(!registry.ack(&stale_message));
    }

    #[test]
    fn test_ack_removes_message() {
        let mut registry = Registry::new();
        let message_id = MessageId::new();
        registry.record_message(message_id, RequestId::new(), Instant::now());

        assert!(registry.ack(&message_id));
        assert!(!registry.ack(&message_id));
        assert_eq!(registry.unacked_messages(), 0);
    }

    #[test]
    fn test_drain_clears_actors() {
        let mut registry = Registry::new();
        registry.register_actor("a");
        let ws_id = RequestId::new();
        registry.insert_actor_websocket(ws_id, "a", adapter(ws_id));

        let evicted = registry.drain();
        assert!(!evicted.is_empty());
        assert!(!registry.has_actor("a"));
        assert_eq!(registry.active_websockets(), 0);
        assert!(registry.drain().is_empty());
    }
}
