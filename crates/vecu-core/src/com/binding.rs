//! Transport binding.
//!
//! Owns the lifecycle of the underlying messaging application: one binding
//! per process, bound to a single application identity, with exactly one
//! event-routing thread. Servers offer services and publish notifications;
//! clients request services and subscribe to events through refcounted
//! subscription tokens. The concrete wire transport attaches beneath this
//! layer; the binding itself routes messages through its event loop to the
//! registered handlers.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use super::{
    Availability, ClientId, ComError, ComResult, DEFAULT_EVENT_GROUP, EventGroupId, EventId,
    InstanceId, Message, MessageKind, MethodId, ServiceId, SubscriptionToken,
};

/// Environment variable holding pre-request hints:
/// `"service:instance:event[@group],…"`, integers accept `0x…` hex.
pub const REQUEST_EVENTS_ENV: &str = "SOMEIP_REQUEST_EVENTS";

/// Environment variable pointing at the transport's application table.
pub const APP_TABLE_ENV: &str = "VSOMEIP_CONFIGURATION";

type NotificationHandler = Arc<dyn Fn(ServiceId, InstanceId, EventId, &[u8]) + Send + Sync>;
type RpcHandler = Arc<dyn Fn(&Binding, &Message) + Send + Sync>;
type LegacyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
type EventCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
type AvailabilityCallback = Arc<dyn Fn(Availability) + Send + Sync>;

enum Command {
    Deliver(Message),
    Availability {
        service: ServiceId,
        instance: InstanceId,
        up: bool,
    },
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct SubMeta {
    service: ServiceId,
    instance: InstanceId,
    group: EventGroupId,
    event: EventId,
}

struct AvailabilityListener {
    service: ServiceId,
    instance: InstanceId,
    callback: AvailabilityCallback,
}

struct BindingState {
    app_name: String,
    running: bool,
    client_id: ClientId,
    auto_subscribe: bool,
    default_event_group: EventGroupId,
    notification_handlers: Vec<NotificationHandler>,
    rpc_handlers: Vec<RpcHandler>,
    legacy_handler: Option<LegacyHandler>,
    dispatcher_installed: bool,
    subscriptions: HashMap<(ServiceId, InstanceId, EventId), HashMap<u64, EventCallback>>,
    token_meta: HashMap<u64, SubMeta>,
    availability_listeners: Vec<(u64, AvailabilityListener)>,
    offered_services: HashSet<(ServiceId, InstanceId)>,
    offered_events: HashSet<(ServiceId, InstanceId, EventId)>,
    requested_services: HashSet<(ServiceId, InstanceId)>,
    requested_events: HashSet<(ServiceId, InstanceId, EventId)>,
    subscribed_groups: HashSet<(ServiceId, InstanceId, EventGroupId)>,
}

impl Default for BindingState {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            running: false,
            client_id: 0,
            auto_subscribe: false,
            default_event_group: DEFAULT_EVENT_GROUP,
            notification_handlers: Vec::new(),
            rpc_handlers: Vec::new(),
            legacy_handler: None,
            dispatcher_installed: false,
            subscriptions: HashMap::new(),
            token_meta: HashMap::new(),
            availability_listeners: Vec::new(),
            offered_services: HashSet::new(),
            offered_events: HashSet::new(),
            requested_services: HashSet::new(),
            requested_events: HashSet::new(),
            subscribed_groups: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<BindingState>,
    tx: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_token: AtomicU64,
}

/// Cheap cloneable handle to the process's messaging binding.
///
/// Obtain the process-wide instance via [`Binding::global`] and initialize
/// it once with [`init`](Binding::init); components receive a handle
/// explicitly rather than reaching for the global themselves.
#[derive(Clone, Default)]
pub struct Binding {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Binding> = OnceLock::new();

impl Binding {
    /// Create a binding that has not been initialized yet.
    ///
    /// Production code uses [`Binding::global`]; separate instances exist
    /// for tests, where the one-thread-per-process rule is per binding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide binding instance.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Initialize the binding under `app_name` and start the event loop.
    ///
    /// Idempotent per process: the first call creates the messaging
    /// application and starts the routing thread; a repeated call with the
    /// same name is a no-op, and a call with a different name is logged and
    /// ignored without changing state.
    pub fn init(&self, app_name: &str) {
        {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            if st.running {
                if st.app_name != app_name {
                    warn!(
                        current = %st.app_name,
                        requested = %app_name,
                        "binding already initialized, ignoring init with different name"
                    );
                }
                return;
            }

            st.running = true;
            st.app_name = app_name.to_string();
            st.client_id = client_id_from_app_table(app_name).unwrap_or(0);

            let (tx, rx) = mpsc::channel();
            *self.inner.tx.lock().expect("binding tx lock poisoned") = Some(tx);

            let me = self.clone();
            let handle = std::thread::Builder::new()
                .name("vecu-com-events".to_string())
                .spawn(move || event_loop(&me, &rx))
                .expect("failed to spawn binding event loop");
            *self
                .inner
                .thread
                .lock()
                .expect("binding thread lock poisoned") = Some(handle);

            info!(app = %app_name, client_id = st.client_id, "binding initialized");
        }

        self.apply_env_requests();
    }

    /// Stop the event loop and join its thread. Further operations are
    /// inert. Must not be called from a handler.
    pub fn shutdown(&self) {
        let handle = {
            let mut tx = self.inner.tx.lock().expect("binding tx lock poisoned");
            let Some(sender) = tx.take() else { return };
            let _ = sender.send(Command::Stop);
            self.inner
                .thread
                .lock()
                .expect("binding thread lock poisoned")
                .take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.running = false;
        st.subscriptions.clear();
        st.token_meta.clear();
        st.offered_services.clear();
        st.offered_events.clear();
        st.requested_services.clear();
        st.requested_events.clear();
        st.subscribed_groups.clear();
        info!(app = %st.app_name, "binding shut down");
    }

    /// Application name this binding was initialized under.
    #[must_use]
    pub fn app_name(&self) -> String {
        self.inner
            .state
            .lock()
            .expect("binding lock poisoned")
            .app_name
            .clone()
    }

    /// Transport-assigned client id of this application.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.inner
            .state
            .lock()
            .expect("binding lock poisoned")
            .client_id
    }

    // ---- Server side ----

    /// Publish a service; if `event` is given, the event is offered under
    /// `group` (or the default group).
    ///
    /// # Errors
    ///
    /// [`ComError::TransportError`] if the binding is not running.
    pub fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: Option<EventId>,
        group: Option<EventGroupId>,
    ) -> ComResult<()> {
        {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            if !st.running {
                return Err(ComError::TransportError);
            }
            st.offered_services.insert((service, instance));
            if let Some(event) = event {
                st.offered_events.insert((service, instance, event));
                let group = group.unwrap_or(st.default_event_group);
                debug!("offered event {event:#06x} under group {group:#06x}");
            }
        }
        info!("offered service {service:#06x}:{instance:#06x}");
        self.post(Command::Availability {
            service,
            instance,
            up: true,
        });
        Ok(())
    }

    /// Withdraw a previously offered service and its events.
    pub fn stop_offer_service(&self, service: ServiceId, instance: InstanceId) {
        {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            st.offered_services.remove(&(service, instance));
            st.offered_events
                .retain(|(s, i, _)| !(*s == service && *i == instance));
        }
        self.post(Command::Availability {
            service,
            instance,
            up: false,
        });
    }

    /// Publish an event notification reliably.
    ///
    /// The event is lazily offered exactly once per (service, instance,
    /// event) under the default group if it has not been offered yet.
    ///
    /// # Errors
    ///
    /// [`ComError::TransportError`] if the binding is not running.
    pub fn send_notification(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: &[u8],
    ) -> ComResult<()> {
        let client = {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            if !st.running {
                return Err(ComError::TransportError);
            }
            if st.offered_events.insert((service, instance, event)) {
                debug!(
                    "lazily offered event {event:#06x} under group {:#06x}",
                    st.default_event_group
                );
            }
            st.client_id
        };

        let delivered = self.post(Command::Deliver(Message {
            kind: MessageKind::Notification,
            service,
            instance,
            method: event,
            client,
            payload: payload.to_vec(),
        }));
        if delivered {
            Ok(())
        } else {
            Err(ComError::TransportError)
        }
    }

    // ---- Client side ----

    /// Request a (service, instance) from the transport.
    ///
    /// # Errors
    ///
    /// [`ComError::TransportError`] if the binding is not running.
    pub fn request_service(&self, service: ServiceId, instance: InstanceId) -> ComResult<()> {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        if !st.running {
            return Err(ComError::TransportError);
        }
        st.requested_services.insert((service, instance));
        debug!("requested service {service:#06x}:{instance:#06x}");
        Ok(())
    }

    /// Release a previously requested service.
    pub fn release_service(&self, service: ServiceId, instance: InstanceId) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.requested_services.remove(&(service, instance));
    }

    /// Request an event so the transport routes its frames to this
    /// application. Must precede
    /// [`subscribe_to_event`](Self::subscribe_to_event).
    pub fn request_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        groups: &[EventGroupId],
        reliable: bool,
    ) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.requested_events.insert((service, instance, event));
        debug!(?groups, reliable, "requested event {event:#06x}");
    }

    /// Release an event so the transport stops routing its frames.
    pub fn release_event(&self, service: ServiceId, instance: InstanceId, event: EventId) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.requested_events.remove(&(service, instance, event));
    }

    /// Subscribe to `group` for a previously requested event.
    pub fn subscribe_to_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
        event: EventId,
    ) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        if !st.requested_events.contains(&(service, instance, event)) {
            warn!("subscribing to event {event:#06x} that was not requested");
        }
        st.subscribed_groups.insert((service, instance, group));
        debug!("subscribed to event {event:#06x} in group {group:#06x}");
    }

    /// Unsubscribe `group` for an event.
    pub fn unsubscribe_from_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
        _event: EventId,
    ) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.subscribed_groups.remove(&(service, instance, group));
    }

    // ---- Token-level subscriptions ----

    /// Subscribe a callback to an event, returning a token for teardown.
    ///
    /// The physical event request is held while at least one token
    /// references the (service, instance, event); the first subscription
    /// requests and subscribes the event explicitly.
    pub fn subscribe_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
        event: EventId,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            st.subscriptions
                .entry((service, instance, event))
                .or_default()
                .insert(token, Arc::new(callback));
            st.token_meta.insert(
                token,
                SubMeta {
                    service,
                    instance,
                    group,
                    event,
                },
            );
        }

        self.ensure_dispatcher_installed();
        self.request_event(service, instance, event, &[group], true);
        self.subscribe_to_event(service, instance, group, event);

        SubscriptionToken::new(token)
    }

    /// Tear down one subscription. When the last token for an event is
    /// removed, the group is unsubscribed and the event released.
    pub fn unsubscribe_event(&self, token: SubscriptionToken) {
        let teardown = {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            let Some(meta) = st.token_meta.remove(&token.value()) else {
                return;
            };
            let key = (meta.service, meta.instance, meta.event);
            let last = match st.subscriptions.get_mut(&key) {
                Some(map) => {
                    map.remove(&token.value());
                    if map.is_empty() {
                        st.subscriptions.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            };
            last.then_some(meta)
        };

        if let Some(meta) = teardown {
            self.unsubscribe_from_event(meta.service, meta.instance, meta.group, meta.event);
            self.release_event(meta.service, meta.instance, meta.event);
        }
    }

    // ---- Handlers ----

    /// Append a notification handler to the fan-out list. Delivery order
    /// is registration order.
    pub fn register_notification_handler(
        &self,
        handler: impl Fn(ServiceId, InstanceId, EventId, &[u8]) + Send + Sync + 'static,
    ) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.notification_handlers.push(Arc::new(handler));
    }

    /// Append an RPC handler receiving requests and responses.
    pub fn register_rpc_handler(
        &self,
        handler: impl Fn(&Binding, &Message) + Send + Sync + 'static,
    ) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.rpc_handlers.push(Arc::new(handler));
    }

    /// Install the legacy single payload handler, used as a fallback only
    /// while no notification handlers are registered.
    pub fn register_handler(&self, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.legacy_handler = Some(Arc::new(handler));
    }

    // ---- Availability ----

    /// Register a listener for availability changes of (service, instance).
    pub fn register_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        callback: impl Fn(Availability) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.availability_listeners.push((
            token,
            AvailabilityListener {
                service,
                instance,
                callback: Arc::new(callback),
            },
        ));
        SubscriptionToken::new(token)
    }

    /// Remove an availability listener.
    pub fn remove_availability_handler(&self, token: SubscriptionToken) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.availability_listeners
            .retain(|(t, _)| *t != token.value());
    }

    /// Subscribe to the configured default group whenever a service becomes
    /// available. Off by default; implicit subscription routes frames
    /// nobody asked for.
    pub fn enable_auto_subscribe(&self, enable: bool, default_group: EventGroupId) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        st.auto_subscribe = enable;
        st.default_event_group = default_group;
    }

    // ---- RPC ----

    /// Send a fire-and-forget request to a method.
    ///
    /// # Errors
    ///
    /// [`ComError::TransportError`] if the binding is not running.
    pub fn send_request(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        payload: &[u8],
    ) -> ComResult<()> {
        let client = {
            let st = self.inner.state.lock().expect("binding lock poisoned");
            if !st.running {
                return Err(ComError::TransportError);
            }
            st.client_id
        };

        let delivered = self.post(Command::Deliver(Message::request(
            service,
            instance,
            method,
            client,
            payload.to_vec(),
        )));
        if delivered {
            Ok(())
        } else {
            Err(ComError::TransportError)
        }
    }

    /// Send the response to a request.
    ///
    /// # Errors
    ///
    /// [`ComError::TransportError`] if the binding is not running.
    pub fn send_response(&self, request: &Message, payload: &[u8]) -> ComResult<()> {
        let delivered = self.post(Command::Deliver(Message::response_to(
            request,
            payload.to_vec(),
        )));
        if delivered {
            Ok(())
        } else {
            Err(ComError::TransportError)
        }
    }

    // ---- Internals ----

    fn post(&self, command: Command) -> bool {
        let tx = self.inner.tx.lock().expect("binding tx lock poisoned");
        tx.as_ref().is_some_and(|tx| tx.send(command).is_ok())
    }

    /// Install the token-subscription dispatcher as a notification handler,
    /// exactly once.
    fn ensure_dispatcher_installed(&self) {
        let mut st = self.inner.state.lock().expect("binding lock poisoned");
        if st.dispatcher_installed {
            return;
        }
        st.dispatcher_installed = true;

        // Weak, or the handler stored inside the state would keep the
        // binding alive forever.
        let weak = Arc::downgrade(&self.inner);
        st.notification_handlers
            .push(Arc::new(move |service, instance, event, payload| {
                if let Some(inner) = weak.upgrade() {
                    Binding { inner }.dispatch_to_subscribers(service, instance, event, payload);
                }
            }));
    }

    fn dispatch_to_subscribers(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: &[u8],
    ) {
        let callbacks: Vec<EventCallback> = {
            let st = self.inner.state.lock().expect("binding lock poisoned");
            match st.subscriptions.get(&(service, instance, event)) {
                Some(map) => map.values().map(Arc::clone).collect(),
                None => return,
            }
        };
        for cb in callbacks {
            cb(payload);
        }
    }

    fn dispatch_message(&self, msg: &Message) {
        match msg.kind {
            MessageKind::Notification => {
                let (handlers, legacy) = {
                    let st = self.inner.state.lock().expect("binding lock poisoned");
                    (st.notification_handlers.clone(), st.legacy_handler.clone())
                };
                if handlers.is_empty() {
                    if let Some(legacy) = legacy {
                        legacy(&msg.payload);
                    }
                } else {
                    for handler in handlers {
                        handler(msg.service, msg.instance, msg.method, &msg.payload);
                    }
                }
            }
            MessageKind::Request | MessageKind::Response => {
                let handlers = {
                    let st = self.inner.state.lock().expect("binding lock poisoned");
                    st.rpc_handlers.clone()
                };
                for handler in handlers {
                    handler(self, msg);
                }
            }
        }
    }

    fn dispatch_availability(&self, service: ServiceId, instance: InstanceId, up: bool) {
        let (callbacks, auto_subscribe, group) = {
            let st = self.inner.state.lock().expect("binding lock poisoned");
            let callbacks: Vec<AvailabilityCallback> = st
                .availability_listeners
                .iter()
                .filter(|(_, l)| l.service == service && l.instance == instance)
                .map(|(_, l)| Arc::clone(&l.callback))
                .collect();
            (callbacks, st.auto_subscribe, st.default_event_group)
        };

        if up && auto_subscribe {
            let mut st = self.inner.state.lock().expect("binding lock poisoned");
            st.subscribed_groups.insert((service, instance, group));
            debug!("auto-subscribed to group {group:#06x} on {service:#06x}:{instance:#06x}");
        }

        let availability = if up {
            Availability::Available
        } else {
            Availability::NotAvailable
        };
        for cb in callbacks {
            cb(availability);
        }
    }

    /// Pre-request and pre-subscribe the events listed in
    /// [`REQUEST_EVENTS_ENV`]. Malformed entries are logged and skipped.
    fn apply_env_requests(&self) {
        let Ok(raw) = std::env::var(REQUEST_EVENTS_ENV) else {
            return;
        };
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match parse_event_hint(part) {
                Some((service, instance, event, group)) => {
                    self.request_event(service, instance, event, &[group], true);
                    self.subscribe_to_event(service, instance, group, event);
                    info!(hint = %part, "pre-requested event from environment");
                }
                None => warn!(hint = %part, "malformed event hint, skipping"),
            }
        }
    }

    #[cfg(test)]
    fn is_event_requested(&self, service: ServiceId, instance: InstanceId, event: EventId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .requested_events
            .contains(&(service, instance, event))
    }

    #[cfg(test)]
    fn is_group_subscribed(
        &self,
        service: ServiceId,
        instance: InstanceId,
        group: EventGroupId,
    ) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .subscribed_groups
            .contains(&(service, instance, group))
    }
}

fn event_loop(binding: &Binding, rx: &Receiver<Command>) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Stop => break,
            Command::Deliver(msg) => binding.dispatch_message(&msg),
            Command::Availability {
                service,
                instance,
                up,
            } => binding.dispatch_availability(service, instance, up),
        }
    }
}

/// Parse one `service:instance:event[@group]` hint.
fn parse_event_hint(hint: &str) -> Option<(ServiceId, InstanceId, EventId, EventGroupId)> {
    let (triple, group) = match hint.split_once('@') {
        Some((triple, group)) => (triple, parse_u16(group)?),
        None => (hint, DEFAULT_EVENT_GROUP),
    };

    let mut parts = triple.split(':');
    let service = parse_u16(parts.next()?)?;
    let instance = parse_u16(parts.next()?)?;
    let event = parse_u16(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((service, instance, event, group))
}

fn parse_u16(text: &str) -> Option<u16> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// Find this application's client id in the transport's application table.
fn client_id_from_app_table(app_name: &str) -> Option<ClientId> {
    let path = std::env::var(APP_TABLE_ENV).ok()?;
    client_id_from_file(Path::new(&path), app_name)
}

fn client_id_from_file(path: &Path, app_name: &str) -> Option<ClientId> {
    let text = std::fs::read_to_string(path).ok()?;
    let table: serde_json::Value = serde_json::from_str(&text).ok()?;
    for app in table.get("applications")?.as_array()? {
        if app.get("name").and_then(serde_json::Value::as_str) == Some(app_name) {
            return match app.get("id")? {
                serde_json::Value::String(s) => parse_u16(s),
                serde_json::Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
                _ => None,
            };
        }
    }
    None
}
