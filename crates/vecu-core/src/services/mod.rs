//! Domain service descriptors.
//!
//! Shared between the providers and consumers of the platform's demo
//! services, so both sides agree on identifiers and payload forms.

use crate::com::{EventDesc, EventGroupId, EventId, InstanceId, ServiceDesc, ServiceId};
use crate::per::{KeyValueStorage, PerResult};

/// Vehicle speed service.
pub struct SpeedService;

impl ServiceDesc for SpeedService {
    const SERVICE_ID: ServiceId = 0x1234;
    const INSTANCE_ID: InstanceId = 0x0001;
    const DEFAULT_CLIENT: &'static str = "speed_client";
    const DEFAULT_SERVER: &'static str = "sensor_provider";
}

/// Periodic vehicle speed event, text-encoded km/h.
pub struct SpeedEvent;

impl EventDesc for SpeedEvent {
    type Payload = f32;
    const ID: EventId = 0x8001;
    const GROUP: EventGroupId = 0x0001;
}

/// Outcome of handling one speed event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedEventOutcome {
    /// Parsed speed value.
    pub speed: f32,
    /// Whether the configured maximum was exceeded.
    pub exceeded: bool,
}

/// Parse a text speed payload. Non-numeric input yields `0.0`.
#[must_use]
pub fn parse_speed_payload(text: &str) -> f32 {
    text.trim().parse().unwrap_or(0.0)
}

/// Handle one speed event: persist the last seen speed and report whether
/// the threshold was exceeded.
///
/// # Errors
///
/// Propagates storage errors from persisting `last_speed`.
pub fn handle_speed_event(
    kv: &KeyValueStorage,
    payload_text: &str,
    max_allowed_speed: f32,
) -> PerResult<SpeedEventOutcome> {
    let speed = parse_speed_payload(payload_text);
    kv.set_value("last_speed", speed.to_string().as_bytes())?;
    Ok(SpeedEventOutcome {
        speed,
        exceeded: speed > max_allowed_speed,
    })
}
