//! Proxy/Skeleton facade.
//!
//! Transport-agnostic client and server surfaces parameterized by a service
//! descriptor. The facade performs no I/O of its own; every operation
//! delegates to the [`Binding`] handle given at construction.

use std::marker::PhantomData;

use super::binding::Binding;
use super::codec::Codec;
use super::{ComResult, EventGroupId, EventId, InstanceId, MethodId, ServiceId, SubscriptionToken};

/// Compile-time description of a service.
pub trait ServiceDesc {
    /// Service identifier.
    const SERVICE_ID: ServiceId;
    /// Instance identifier.
    const INSTANCE_ID: InstanceId;
    /// Application name proxies register under by default.
    const DEFAULT_CLIENT: &'static str;
    /// Application name skeletons register under by default.
    const DEFAULT_SERVER: &'static str;
}

/// Compile-time description of one event of a service.
pub trait EventDesc {
    /// Payload type carried by the event.
    type Payload: Codec;
    /// Event identifier.
    const ID: EventId;
    /// Event group the event is delivered in.
    const GROUP: EventGroupId;
}

/// Compile-time description of one method of a service.
pub trait MethodDesc {
    /// Request payload type.
    type Request: Codec;
    /// Response payload type.
    type Response: Codec;
    /// Method identifier.
    const ID: MethodId;
}

/// Client-side handle to a service.
pub struct Proxy<D: ServiceDesc> {
    binding: Binding,
    _desc: PhantomData<D>,
}

impl<D: ServiceDesc> Proxy<D> {
    /// Create a proxy under the descriptor's default client name.
    #[must_use]
    pub fn new(binding: Binding) -> Self {
        Self::with_app_name(binding, D::DEFAULT_CLIENT)
    }

    /// Create a proxy under an explicit application name.
    #[must_use]
    pub fn with_app_name(binding: Binding, app_name: &str) -> Self {
        binding.init(app_name);
        Self {
            binding,
            _desc: PhantomData,
        }
    }

    /// Request the service from the transport.
    ///
    /// # Errors
    ///
    /// [`super::ComError::TransportError`] if the binding is not running.
    pub fn request_service(&self) -> ComResult<()> {
        self.binding.request_service(D::SERVICE_ID, D::INSTANCE_ID)
    }

    /// Release the service.
    pub fn release_service(&self) {
        self.binding.release_service(D::SERVICE_ID, D::INSTANCE_ID);
    }

    /// Subscribe to an event; the callback receives decoded payloads.
    pub fn subscribe<E: EventDesc>(
        &self,
        callback: impl Fn(E::Payload) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.binding.subscribe_event(
            D::SERVICE_ID,
            D::INSTANCE_ID,
            E::GROUP,
            E::ID,
            move |bytes| callback(E::Payload::decode(bytes)),
        )
    }

    /// Tear down a subscription created with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.binding.unsubscribe_event(token);
    }

    /// Invoke a method asynchronously.
    ///
    /// Requests are fire-and-forget on this transport; `on_done` is invoked
    /// once the request is handed off, with a default-decoded response.
    ///
    /// # Errors
    ///
    /// [`super::ComError::TransportError`] if the binding is not running.
    pub fn call<M: MethodDesc>(
        &self,
        request: &M::Request,
        on_done: impl FnOnce(ComResult<M::Response>) + Send + 'static,
    ) -> ComResult<()> {
        self.binding
            .send_request(D::SERVICE_ID, D::INSTANCE_ID, M::ID, &request.encode())?;
        on_done(Ok(M::Response::decode(&[])));
        Ok(())
    }
}

/// Server-side handle to a service.
pub struct Skeleton<D: ServiceDesc> {
    binding: Binding,
    _desc: PhantomData<D>,
}

impl<D: ServiceDesc> Skeleton<D> {
    /// Create a skeleton under the descriptor's default server name.
    #[must_use]
    pub fn new(binding: Binding) -> Self {
        Self::with_app_name(binding, D::DEFAULT_SERVER)
    }

    /// Create a skeleton under an explicit application name.
    #[must_use]
    pub fn with_app_name(binding: Binding, app_name: &str) -> Self {
        binding.init(app_name);
        Self {
            binding,
            _desc: PhantomData,
        }
    }

    /// Offer the service.
    ///
    /// # Errors
    ///
    /// [`super::ComError::TransportError`] if the binding is not running.
    pub fn offer(&self) -> ComResult<()> {
        self.binding
            .offer_service(D::SERVICE_ID, D::INSTANCE_ID, None, None)
    }

    /// Withdraw the service.
    pub fn stop(&self) {
        self.binding
            .stop_offer_service(D::SERVICE_ID, D::INSTANCE_ID);
    }

    /// Publish an event to subscribers.
    ///
    /// # Errors
    ///
    /// [`super::ComError::TransportError`] if the binding is not running.
    pub fn notify<E: EventDesc>(&self, value: &E::Payload) -> ComResult<()> {
        self.binding
            .send_notification(D::SERVICE_ID, D::INSTANCE_ID, E::ID, &value.encode())
    }
}
