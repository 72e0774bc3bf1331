//! Application-side supervision client.
//!
//! Reports alive beats and checkpoints to the Execution Manager over the
//! transport. Both reports are fire-and-forget.

use tracing::debug;

use super::ids;
use crate::com::binding::Binding;
use crate::com::ComResult;

/// Handle an application uses to report into its supervisor.
#[derive(Debug)]
pub struct SupervisionClient {
    binding: Binding,
    app_name: String,
}

impl SupervisionClient {
    /// Create a client for `app_name`, initializing the binding under that
    /// name if it is not initialized yet.
    #[must_use]
    pub fn new(binding: Binding, app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        binding.init(&app_name);
        Self { binding, app_name }
    }

    /// Request the PHM service on its well-known service and instance.
    ///
    /// # Errors
    ///
    /// [`crate::com::ComError::TransportError`] if the binding is not
    /// running.
    pub fn connect(&self) -> ComResult<()> {
        self.binding.request_service(ids::SERVICE, ids::INSTANCE)
    }

    /// Report an alive beat for the current supervision cycle.
    ///
    /// # Errors
    ///
    /// [`crate::com::ComError::TransportError`] if the binding is not
    /// running.
    pub fn report_alive(&self) -> ComResult<()> {
        debug!(app = %self.app_name, "reporting alive");
        self.binding
            .send_request(ids::SERVICE, ids::INSTANCE, ids::METHOD_ALIVE, &[])
    }

    /// Report a checkpoint, encoded as a 4-byte big-endian id.
    ///
    /// # Errors
    ///
    /// [`crate::com::ComError::TransportError`] if the binding is not
    /// running.
    pub fn report_checkpoint(&self, id: u32) -> ComResult<()> {
        debug!(app = %self.app_name, checkpoint = id, "reporting checkpoint");
        self.binding.send_request(
            ids::SERVICE,
            ids::INSTANCE,
            ids::METHOD_CHECKPOINT,
            &id.to_be_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::com::MessageKind;

    #[test]
    fn test_reports_arrive_on_well_known_ids() {
        let binding = Binding::new();
        let client = SupervisionClient::new(binding.clone(), "sensor_app");
        client.connect().unwrap();

        let (tx, rx) = mpsc::channel();
        binding.register_rpc_handler(move |_, msg| {
            if msg.kind == MessageKind::Request {
                tx.send((msg.service, msg.instance, msg.method, msg.payload.clone()))
                    .unwrap();
            }
        });

        client.report_alive().unwrap();
        let (service, instance, method, payload) =
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((service, instance, method), (0x7A01, 0x0001, 0x0001));
        assert!(payload.is_empty());

        client.report_checkpoint(0x1001).unwrap();
        let (_, _, method, payload) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(method, 0x0002);
        assert_eq!(payload, vec![0x00, 0x00, 0x10, 0x01]);

        binding.shutdown();
    }
}
