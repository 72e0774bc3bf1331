//! PHM message routing.
//!
//! One RPC handler on the transport receives every message addressed to the
//! PHM service and dispatches it to the supervisor of the sending
//! application, keyed by the transport client id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use vecu_core::com::{Binding, ClientId, Message, MessageKind};
use vecu_core::phm::{self, PhmSupervisor};

/// Supervisors by app id, shared between the routing handler (transport
/// thread) and the Execution Manager's tick loop.
pub type SupervisorMap = HashMap<String, Arc<Mutex<PhmSupervisor>>>;

/// Route one transport message to the matching supervisor.
///
/// Requests to the alive method record an alive beat; requests to the
/// checkpoint method with an exactly 4-byte payload record the big-endian
/// checkpoint id, other payload lengths are dropped. Every request is
/// acknowledged with an empty response, including those from unknown
/// clients or to unknown methods.
pub fn dispatch_phm_message(
    supervisors: &SupervisorMap,
    client_map: &HashMap<ClientId, String>,
    binding: &Binding,
    msg: &Message,
) {
    if msg.kind != MessageKind::Request
        || msg.service != phm::ids::SERVICE
        || msg.instance != phm::ids::INSTANCE
    {
        return;
    }

    let supervisor = client_map
        .get(&msg.client)
        .and_then(|app_id| supervisors.get(app_id).map(|s| (app_id, s)));
    let Some((app_id, supervisor)) = supervisor else {
        warn!(client = msg.client, "dropping PHM message from unknown client");
        let _ = binding.send_response(msg, &[]);
        return;
    };

    match msg.method {
        phm::ids::METHOD_ALIVE => {
            debug!(app = %app_id, "alive");
            supervisor.lock().expect("supervisor lock poisoned").on_alive();
        }
        phm::ids::METHOD_CHECKPOINT => {
            if let Ok(raw) = <[u8; 4]>::try_from(msg.payload.as_slice()) {
                let id = u32::from_be_bytes(raw);
                debug!(app = %app_id, checkpoint = id, "checkpoint");
                supervisor
                    .lock()
                    .expect("supervisor lock poisoned")
                    .on_checkpoint(id);
            }
        }
        other => {
            debug!(app = %app_id, method = other, "unknown PHM method");
        }
    }
    let _ = binding.send_response(msg, &[]);
}

/// Install the PHM routing handler on the binding.
pub fn register_phm_handler(
    binding: &Binding,
    supervisors: Arc<SupervisorMap>,
    client_map: Arc<HashMap<ClientId, String>>,
) {
    binding.register_rpc_handler(move |binding, msg| {
        dispatch_phm_message(&supervisors, &client_map, binding, msg);
    });
}
