//! Request bridge to the host application
//!
//! The [`Bridge`] owns the connection state machine and traffic statistics,
//! sends requests through a [`HostChannel`], and routes host-initiated
//! messages to subscriptions registered with [`Bridge::on`].
//!
//! Every request sent resolves to exactly one of: a reply (`success` true or
//! false), a timeout, or an error when the request never reached the host.
//! The bridge never retries.
//!
//! # Example
//!
//! ```ignore
//! let bridge = Arc::new(Bridge::new(channel).with_events(events_tx));
//! let restored = bridge.initialize(&config.plugin).await?;
//!
//! bridge.on("notify", "documentChangeNotice", |_req| Response::ok())?;
//!
//! match bridge.send_request(&Request::get("dataContextList")).await? {
//!     CallOutcome::Replied(resp) if resp.success => { /* ... */ }
//!     CallOutcome::Replied(resp) => { /* host said no */ }
//!     CallOutcome::TimedOut => { /* no answer */ }
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod events;
pub mod message;
pub mod registry;
pub mod stream;

pub use channel::{HostChannel, InboundHandler};
pub use connection::{ConnectionState, ConnectionStats};
pub use events::{event_channel, EventReceiver, EventSender, PluginEvent};
pub use message::{Action, CallOutcome, Request, Response};
pub use registry::{NotificationHandler, NotificationRegistry, Subscription};
pub use stream::StreamChannel;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::FrameDescriptor;
use crate::error::{Result, ResultExt, StackerError};

/// Resource holding the plugin's frame and persisted state
pub const INTERACTIVE_FRAME: &str = "interactiveFrame";

#[derive(Debug, Default)]
struct BridgeState {
    state: ConnectionState,
    stats: ConnectionStats,
    interactive_state: Option<Value>,
    /// The `get interactiveState` subscription is in place
    answers_state: bool,
}

/// Connection to the host
pub struct Bridge {
    channel: Arc<dyn HostChannel>,
    inner: Mutex<BridgeState>,
    registry: RwLock<NotificationRegistry>,
    events: Option<EventSender>,
}

impl Bridge {
    pub fn new(channel: Arc<dyn HostChannel>) -> Self {
        Self {
            channel,
            inner: Mutex::new(BridgeState::default()),
            registry: RwLock::new(NotificationRegistry::new()),
            events: None,
        }
    }

    /// Report warnings and failures on an event channel as well as the log
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PluginEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Event sender shared with other components, if one is configured
    pub fn event_sender(&self) -> Option<EventSender> {
        self.events.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats.clone()
    }

    /// Connect to the host and declare the plugin's frame.
    ///
    /// Fetches the persisted interactive state, then sends the frame
    /// declaration whether or not the fetch succeeded. Returns the restored
    /// state, or `None` on first run.
    ///
    /// If either request cannot be carried to the host the bridge goes back
    /// to uninitialized and `initialize` may be called again.
    pub async fn initialize(self: &Arc<Self>, frame: &FrameDescriptor) -> Result<Option<Value>> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Uninitialized => inner.state = ConnectionState::Initializing,
                ConnectionState::Closed => return Err(StackerError::ConnectionClosed),
                _ => return Err(StackerError::AlreadyInitialized),
            }
        }

        let result = self.bootstrap(frame).await;
        if let Err(e) = &result {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Initializing {
                inner.state = ConnectionState::Uninitialized;
            }
            drop(inner);
            tracing::warn!("Initialization failed: {}", e);
        }
        result
    }

    async fn bootstrap(self: &Arc<Self>, frame: &FrameDescriptor) -> Result<Option<Value>> {
        if !self.lock().answers_state {
            let weak = Arc::downgrade(self);
            let inbound: Weak<dyn InboundHandler> = weak.clone();
            self.channel.attach(inbound);
            self.on("^get$", "^interactiveState$", move |_req| {
                let state = weak
                    .upgrade()
                    .and_then(|bridge| bridge.interactive_state())
                    .unwrap_or_else(|| json!({}));
                Response::ok_with(state)
            })?;
            self.lock().answers_state = true;
        }

        let restored = match self
            .send_request(&Request::get(INTERACTIVE_FRAME))
            .await
            .context("Fetching interactive frame")?
        {
            CallOutcome::Replied(resp) if resp.success => extract_state(resp.values.as_ref()),
            CallOutcome::Replied(_) | CallOutcome::TimedOut => {
                tracing::warn!("Could not fetch interactive state, starting fresh");
                None
            }
        };
        self.lock().interactive_state = restored.clone();

        let outcome = self
            .send_request(&Request::update(INTERACTIVE_FRAME, frame.declaration()?))
            .await
            .context("Declaring interactive frame")?;
        if outcome.is_success() {
            tracing::info!("Initialized as '{}' ({})", frame.name, frame.title);
        }

        Ok(restored)
    }

    /// Send one request and wait for its outcome.
    ///
    /// On a closed connection nothing is sent and `ConnectionClosed` is
    /// returned. Before `initialize` the request is still sent, with a warning.
    pub async fn send_request(&self, request: &Request) -> Result<CallOutcome> {
        let label = request.describe();
        let message = serde_json::to_value(request)?;

        let Some(reply) = self.transmit(&label, message).await? else {
            return Ok(CallOutcome::TimedOut);
        };

        let response = serde_json::from_value::<Response>(reply).unwrap_or_else(|e| {
            Response::failure_with(format!("malformed reply: {}", e))
        });
        self.record_reply(&label, &request.resource, &response);
        Ok(CallOutcome::Replied(response))
    }

    /// Send a request and hand its outcome to `callback`.
    ///
    /// The callback runs exactly once when the request reached the channel:
    /// with the response, or with `None` on timeout. It does not run when the
    /// request was dropped or could not be transmitted; the error is returned
    /// instead.
    pub async fn send_request_with<F>(&self, request: Request, callback: F) -> Result<()>
    where
        F: FnOnce(&Request, Option<&Response>),
    {
        let outcome = self.send_request(&request).await?;
        callback(&request, outcome.reply());
        Ok(())
    }

    /// Send several requests as one message.
    ///
    /// Counted as a single request, succeeded only if every response did.
    pub async fn send_batch(&self, requests: &[Request]) -> Result<CallOutcome<Vec<Response>>> {
        let label = format!("batch of {}", requests.len());
        let message = serde_json::to_value(requests)?;

        let Some(reply) = self.transmit(&label, message).await? else {
            return Ok(CallOutcome::TimedOut);
        };

        let responses = parse_batch_reply(reply);
        let success = !responses.is_empty() && responses.iter().all(|r| r.success);
        let summary = if success {
            Response::ok()
        } else {
            let message = responses
                .iter()
                .find_map(Response::error_message)
                .unwrap_or("request was not successful")
                .to_string();
            Response::failure_with(message)
        };
        self.record_reply(&label, &label, &summary);
        Ok(CallOutcome::Replied(responses))
    }

    /// Send a request on a background task without waiting for the outcome.
    ///
    /// The returned handle can be awaited when a caller does need to know the
    /// request has been dealt with.
    pub fn post(self: &Arc<Self>, request: Request) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bridge.send_request(&request).await {
                tracing::debug!("Posted '{}' not delivered: {}", request.describe(), e);
            }
        })
    }

    /// Register a handler for host-initiated messages.
    ///
    /// Both patterns are regular expressions. Subscriptions are tried in
    /// registration order and only the first match runs.
    pub fn on<F>(&self, action: &str, resource: &str, handler: F) -> Result<()>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let subscription = Subscription::new(action, resource, Arc::new(handler))?;
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(subscription);
        Ok(())
    }

    /// Current interactive state blob
    pub fn interactive_state(&self) -> Option<Value> {
        self.lock().interactive_state.clone()
    }

    /// Replace the interactive state the bridge reports to the host
    pub fn set_interactive_state(&self, state: Value) {
        self.lock().interactive_state = Some(state);
    }

    /// Push the current interactive state to the host
    pub async fn save_interactive_state(&self) -> Result<CallOutcome> {
        let state = self.interactive_state().unwrap_or_else(|| json!({}));
        self.send_request(&Request::update(INTERACTIVE_FRAME, json!({ "state": state })))
            .await
    }

    /// Close the connection; later requests are dropped
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Closed {
            tracing::info!("Closing bridge (was {})", inner.state);
            inner.state = ConnectionState::Closed;
        }
    }

    /// Apply the state gate, count the send and hand the message to the channel
    async fn transmit(&self, label: &str, message: Value) -> Result<Option<Value>> {
        let uninitialized = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Closed => {
                    inner.stats.record_dropped();
                    None
                }
                state => {
                    inner.stats.record_sent(Utc::now());
                    Some(state == ConnectionState::Uninitialized)
                }
            }
        };

        match uninitialized {
            None => {
                tracing::warn!("Dropping '{}': connection closed", label);
                self.emit(PluginEvent::RequestDropped {
                    request: label.to_string(),
                });
                return Err(StackerError::ConnectionClosed);
            }
            Some(true) => {
                tracing::warn!("Sending '{}' before initialize", label);
                self.emit(PluginEvent::UninitializedSend {
                    request: label.to_string(),
                });
            }
            Some(false) => {}
        }

        tracing::trace!("-> {}", label);
        let result = self.channel.call(message).await;

        let mut inner = self.lock();
        match &result {
            Ok(Some(_)) => inner.state = inner.state.on_host_traffic(),
            Ok(None) => {
                inner.stats.record_timeout();
                drop(inner);
                tracing::warn!("'{}' timed out", label);
                self.emit(PluginEvent::RequestTimedOut {
                    request: label.to_string(),
                });
            }
            Err(e) => {
                inner.stats.record_transport_error();
                drop(inner);
                tracing::warn!("'{}' could not be sent: {}", label, e);
            }
        }
        result
    }

    fn record_reply(&self, label: &str, resource: &str, response: &Response) {
        self.lock().stats.record_reply(response.success, Utc::now());
        if response.success {
            tracing::trace!("<- {} ok", label);
        } else {
            let message = StackerError::host_failure(resource, response.error_message());
            tracing::warn!("{}", message);
            self.emit(PluginEvent::HostFailure {
                request: label.to_string(),
                message: response
                    .error_message()
                    .unwrap_or("request was not successful")
                    .to_string(),
            });
        }
    }

    fn dispatch(&self, request: &Request) -> Response {
        let handler = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(request);

        match handler {
            Some(handler) => handler(request),
            None => {
                self.lock().stats.record_unhandled();
                tracing::debug!("No handler for '{}'", request.describe());
                self.emit(PluginEvent::UnhandledNotification {
                    request: request.describe(),
                });
                Response::ok()
            }
        }
    }
}

impl InboundHandler for Bridge {
    fn handle(&self, message: Value) -> Value {
        {
            let mut inner = self.lock();
            inner.stats.record_received(Utc::now());
            inner.state = inner.state.on_host_traffic();
        }

        let response = match serde_json::from_value::<Request>(message) {
            Ok(request) => self.dispatch(&request),
            Err(e) => {
                tracing::warn!("Malformed host message: {}", e);
                Response::failure_with(format!("malformed request: {}", e))
            }
        };

        self.lock().stats.record_host_reply(response.success);
        serde_json::to_value(&response).unwrap_or_else(|_| json!({ "success": false }))
    }
}

/// Pull the persisted state out of a `get interactiveFrame` reply.
/// Missing, null and empty-object states all mean first run.
fn extract_state(values: Option<&Value>) -> Option<Value> {
    match values?.get("state")? {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        state => Some(state.clone()),
    }
}

fn parse_batch_reply(reply: Value) -> Vec<Response> {
    match reply {
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).unwrap_or_else(|e| {
                    Response::failure_with(format!("malformed reply: {}", e))
                })
            })
            .collect(),
        single => vec![serde_json::from_value(single)
            .unwrap_or_else(|e| Response::failure_with(format!("malformed reply: {}", e)))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::MockHostChannel;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bridge_with(mock: MockHostChannel) -> (Arc<Bridge>, EventReceiver) {
        let (tx, rx) = event_channel(64);
        (Arc::new(Bridge::new(Arc::new(mock)).with_events(tx)), rx)
    }

    fn request_of(message: &Value) -> Request {
        serde_json::from_value(message.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_closed_bridge_drops_requests() {
        let mut mock = MockHostChannel::new();
        mock.expect_call().times(0);
        let (bridge, events) = bridge_with(mock);

        bridge.close();
        for _ in 0..3 {
            let err = bridge
                .send_request(&Request::get("dataContextList"))
                .await
                .unwrap_err();
            assert!(matches!(err, StackerError::ConnectionClosed));
        }

        let stats = bridge.stats();
        assert_eq!(stats.requests_sent, 0);
        assert_eq!(stats.requests_dropped, 3);
        let dropped = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, PluginEvent::RequestDropped { .. }))
            .count();
        assert_eq!(dropped, 3);
    }

    #[tokio::test]
    async fn test_uninitialized_send_is_transmitted_with_warning() {
        let mut mock = MockHostChannel::new();
        mock.expect_call()
            .times(1)
            .returning(|_| Ok(Some(json!({"success": true}))));
        let (bridge, events) = bridge_with(mock);

        let outcome = bridge.send_request(&Request::get("dataContextList")).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(bridge.state(), ConnectionState::Active);
        assert!(matches!(
            events.try_recv(),
            Some(PluginEvent::UninitializedSend { .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_fetches_state_then_declares_frame() {
        let mut mock = MockHostChannel::new();
        let mut seq = Sequence::new();
        mock.expect_attach().times(1).return_const(());
        mock.expect_call()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|m| m["action"] == "get" && m["resource"] == INTERACTIVE_FRAME)
            .returning(|_| {
                Ok(Some(json!({
                    "success": true,
                    "values": {"state": {"version": 1, "sourceDataSet": "mammals"}}
                })))
            });
        mock.expect_call()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|m| {
                m["action"] == "update"
                    && m["resource"] == INTERACTIVE_FRAME
                    && m["values"]["name"] == "TidyData"
            })
            .returning(|_| Ok(Some(json!({"success": true}))));
        let (bridge, _events) = bridge_with(mock);

        let restored = bridge.initialize(&FrameDescriptor::default()).await.unwrap();
        assert_eq!(restored.unwrap()["sourceDataSet"], "mammals");
        assert_eq!(bridge.state(), ConnectionState::Active);
        assert_eq!(bridge.stats().requests_sent, 2);
    }

    #[tokio::test]
    async fn test_initialize_declares_frame_after_timeout() {
        let mut mock = MockHostChannel::new();
        mock.expect_attach().return_const(());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        mock.expect_call().times(2).returning(move |m| {
            let req = request_of(&m);
            seen.lock().unwrap().push(req.action);
            match req.action {
                Action::Get => Ok(None),
                _ => Ok(Some(json!({"success": true}))),
            }
        });
        let (bridge, _events) = bridge_with(mock);

        let restored = bridge.initialize(&FrameDescriptor::default()).await.unwrap();
        assert!(restored.is_none());
        assert_eq!(*calls.lock().unwrap(), vec![Action::Get, Action::Update]);
        assert_eq!(bridge.stats().replies_timed_out, 1);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_rejected() {
        let mut mock = MockHostChannel::new();
        mock.expect_attach().return_const(());
        mock.expect_call()
            .returning(|_| Ok(Some(json!({"success": true, "values": {}}))));
        let (bridge, _events) = bridge_with(mock);

        bridge.initialize(&FrameDescriptor::default()).await.unwrap();
        let err = bridge
            .initialize(&FrameDescriptor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StackerError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn test_initialize_can_be_retried_after_transport_error() {
        let mut mock = MockHostChannel::new();
        mock.expect_attach().times(1).return_const(());
        let attempts = AtomicUsize::new(0);
        mock.expect_call().times(3).returning(move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StackerError::Channel("pipe closed".to_string()))
            } else {
                Ok(Some(json!({"success": true, "values": {}})))
            }
        });
        let (bridge, _events) = bridge_with(mock);

        let err = bridge
            .initialize(&FrameDescriptor::default())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), StackerError::Channel(_)));
        assert_eq!(bridge.state(), ConnectionState::Uninitialized);

        let restored = bridge.initialize(&FrameDescriptor::default()).await.unwrap();
        assert!(restored.is_none());
        assert_eq!(bridge.state(), ConnectionState::Active);
        assert_eq!(bridge.registry.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exactly_one_callback_per_outcome() {
        let mut mock = MockHostChannel::new();
        mock.expect_call().returning(|m| {
            let req = request_of(&m);
            match req.resource.as_str() {
                "ok" => Ok(Some(json!({"success": true}))),
                "bad" => Ok(Some(json!({"success": false, "values": {"error": "no"}}))),
                _ => Ok(None),
            }
        });
        let (bridge, events) = bridge_with(mock);

        let fired = AtomicUsize::new(0);
        let mut seen = Vec::new();
        for resource in ["ok", "bad", "slow"] {
            bridge
                .send_request_with(Request::get(resource), |_req, resp| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    seen.push(resp.map(|r| r.success));
                })
                .await
                .unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(seen, vec![Some(true), Some(false), None]);

        let stats = bridge.stats();
        assert_eq!(stats.replies_succeeded, 1);
        assert_eq!(stats.replies_failed, 1);
        assert_eq!(stats.replies_timed_out, 1);

        let events = events.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, PluginEvent::HostFailure { message, .. } if message == "no")));
        assert!(events
            .iter()
            .any(|e| matches!(e, PluginEvent::RequestTimedOut { .. })));
    }

    #[tokio::test]
    async fn test_transport_error_is_counted() {
        let mut mock = MockHostChannel::new();
        mock.expect_call()
            .returning(|_| Err(StackerError::Channel("pipe closed".to_string())));
        let (bridge, _events) = bridge_with(mock);

        let err = bridge.send_request(&Request::get("x")).await.unwrap_err();
        assert!(matches!(err, StackerError::Channel(_)));
        let stats = bridge.stats();
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_batch_succeeds_only_if_all_succeed() {
        let mut mock = MockHostChannel::new();
        mock.expect_call().times(1).returning(|m| {
            assert!(m.is_array());
            Ok(Some(json!([
                {"success": true},
                {"success": false, "values": {"error": "bad case"}}
            ])))
        });
        let (bridge, _events) = bridge_with(mock);

        let outcome = bridge
            .send_batch(&[Request::get("a"), Request::get("b")])
            .await
            .unwrap();
        let responses = outcome.into_reply().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(bridge.stats().requests_sent, 1);
        assert_eq!(bridge.stats().replies_failed, 1);
    }

    #[test]
    fn test_first_matching_subscription_handles() {
        let (bridge, _events) = bridge_with(MockHostChannel::new());
        let h2_fired = Arc::new(AtomicUsize::new(0));
        let h2 = Arc::clone(&h2_fired);

        bridge
            .on("notify", "dataContextChangeNotice", |_| {
                Response::ok_with(json!({"handler": 1}))
            })
            .unwrap();
        bridge
            .on("notify", "dataContextChangeNotice", move |_| {
                h2.fetch_add(1, Ordering::SeqCst);
                Response::ok()
            })
            .unwrap();

        let reply = bridge.handle(json!({
            "action": "notify",
            "resource": "dataContextChangeNotice[mammals]"
        }));
        assert_eq!(reply["values"]["handler"], 1);
        assert_eq!(h2_fired.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.stats().host_replies_succeeded, 1);
        assert_eq!(bridge.state(), ConnectionState::Active);
    }

    #[test]
    fn test_unmatched_notification_replies_success() {
        let (bridge, events) = bridge_with(MockHostChannel::new());

        let reply = bridge.handle(json!({"action": "notify", "resource": "somethingNew"}));
        assert_eq!(reply, json!({"success": true}));
        assert_eq!(bridge.stats().host_unhandled, 1);
        assert!(matches!(
            events.try_recv(),
            Some(PluginEvent::UnhandledNotification { .. })
        ));
    }

    #[test]
    fn test_malformed_inbound_message() {
        let (bridge, _events) = bridge_with(MockHostChannel::new());

        let reply = bridge.handle(json!({"hello": "world"}));
        assert_eq!(reply["success"], false);
        let stats = bridge.stats();
        assert_eq!(stats.host_requests, 1);
        assert_eq!(stats.host_replies_failed, 1);
    }

    #[test]
    fn test_extract_state() {
        assert!(extract_state(None).is_none());
        assert!(extract_state(Some(&json!({}))).is_none());
        assert!(extract_state(Some(&json!({"state": null}))).is_none());
        assert!(extract_state(Some(&json!({"state": {}}))).is_none());
        assert_eq!(
            extract_state(Some(&json!({"state": {"a": 1}}))),
            Some(json!({"a": 1}))
        );
    }
}
