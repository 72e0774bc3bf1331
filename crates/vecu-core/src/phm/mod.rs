//! Platform Health Management.
//!
//! Supervision of application liveness via periodic cycles: applications
//! report alive beats and numeric checkpoints through the transport, and a
//! per-application supervisor evaluates each cycle against the configured
//! requirements.

pub mod client;
pub mod supervisor;

pub use client::SupervisionClient;
pub use supervisor::{PhmSupervisor, SupervisionConfig};

/// Well-known transport identifiers of the PHM service.
pub mod ids {
    use crate::com::{InstanceId, MethodId, ServiceId};

    /// Service id the Execution Manager offers PHM under.
    pub const SERVICE: ServiceId = 0x7A01;
    /// Instance id of the PHM service.
    pub const INSTANCE: InstanceId = 0x0001;
    /// Method id for `report_alive` (empty payload).
    pub const METHOD_ALIVE: MethodId = 0x0001;
    /// Method id for `report_checkpoint` (4-byte big-endian id).
    pub const METHOD_CHECKPOINT: MethodId = 0x0002;
}
