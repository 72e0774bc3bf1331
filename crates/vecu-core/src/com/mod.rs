//! Service-oriented communication.
//!
//! The [`binding`] submodule owns the lifecycle of the underlying messaging
//! application and routes messages; [`facade`] provides the
//! transport-agnostic Proxy/Skeleton layer on top of it, with payloads
//! serialized through [`codec`].

pub mod binding;
pub mod codec;
pub mod facade;

pub use binding::Binding;
pub use codec::Codec;
pub use facade::{EventDesc, MethodDesc, Proxy, ServiceDesc, Skeleton};

/// Service identifier.
pub type ServiceId = u16;
/// Service instance identifier.
pub type InstanceId = u16;
/// Method identifier.
pub type MethodId = u16;
/// Event identifier.
pub type EventId = u16;
/// Event group identifier.
pub type EventGroupId = u16;
/// Transport-assigned client identifier of an application.
pub type ClientId = u16;

/// Event group used when none is configured.
pub const DEFAULT_EVENT_GROUP: EventGroupId = 0x0001;

/// Availability of a (service, instance) as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// No availability information yet.
    Unknown,
    /// The service is not offered.
    NotAvailable,
    /// The service is offered.
    Available,
}

/// Error kinds reported by communication operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ComError {
    /// The service is not available.
    #[error("service not found")]
    NotFound,

    /// The peer or transport is busy.
    #[error("busy")]
    Busy,

    /// The operation timed out.
    #[error("timeout")]
    Timeout,

    /// The transport failed or is shut down.
    #[error("transport error")]
    TransportError,

    /// An argument was rejected.
    #[error("invalid argument")]
    InvalidArg,
}

/// Result type used throughout the communication APIs.
pub type ComResult<T> = Result<T, ComError>;

/// Opaque handle naming a single subscription or availability listener.
///
/// Tokens are monotonic per process and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Numeric value of the token.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Message kind on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Method invocation expecting a response.
    Request,
    /// Reply to a request.
    Response,
    /// Event notification.
    Notification,
}

/// A message as delivered by the binding's event loop.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Target service.
    pub service: ServiceId,
    /// Target instance.
    pub instance: InstanceId,
    /// Method id for requests/responses, event id for notifications.
    pub method: MethodId,
    /// Client id of the sending application.
    pub client: ClientId,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a request message.
    #[must_use]
    pub fn request(
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        client: ClientId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: MessageKind::Request,
            service,
            instance,
            method,
            client,
            payload,
        }
    }

    /// Build the response to a request, carrying `payload`.
    #[must_use]
    pub fn response_to(request: &Self, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            service: request.service,
            instance: request.instance,
            method: request.method,
            client: request.client,
            payload,
        }
    }
}
