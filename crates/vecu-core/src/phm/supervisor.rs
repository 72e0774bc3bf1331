//! Supervision state machine.
//!
//! One supervisor per supervised application. The owner drives
//! [`maintenance_tick`](PhmSupervisor::maintenance_tick) from an external
//! clock; alive beats and checkpoints arrive via
//! [`on_alive`](PhmSupervisor::on_alive) /
//! [`on_checkpoint`](PhmSupervisor::on_checkpoint).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Supervision requirements for one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Length of one supervision cycle in milliseconds.
    #[serde(default = "default_cycle_ms")]
    pub supervision_cycle_ms: u64,

    /// Unhealthy cycles tolerated before a violation is reported.
    #[serde(default = "default_allowed_missed")]
    pub allowed_missed_cycles: u32,

    /// Checkpoint ids that must all be seen within a cycle.
    #[serde(default)]
    pub required_checkpoints: Vec<u32>,
}

const fn default_cycle_ms() -> u64 {
    1000
}

const fn default_allowed_missed() -> u32 {
    3
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            supervision_cycle_ms: default_cycle_ms(),
            allowed_missed_cycles: default_allowed_missed(),
            required_checkpoints: Vec::new(),
        }
    }
}

/// Callback invoked when an application exceeds its allowed missed cycles.
pub type ViolationCallback = Box<dyn Fn(&str) + Send>;

/// Per-application supervision state machine.
///
/// Single-writer: the owner invokes `on_*` and `maintenance_tick` under one
/// lock or from one thread. At each cycle rollover the cycle is either
/// healthy (missed counter resets) or missed; on exceeding the allowance
/// exactly one violation is reported and the counter resets. The per-cycle
/// scratch is cleared on every rollover.
pub struct PhmSupervisor {
    cfg: SupervisionConfig,
    cycle_start: Option<Instant>,
    last_healthy: Option<Instant>,
    got_alive: bool,
    seen_checkpoints: Vec<u32>,
    missed_cycles: u32,
    on_violation: Option<ViolationCallback>,
}

impl std::fmt::Debug for PhmSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhmSupervisor")
            .field("cfg", &self.cfg)
            .field("missed_cycles", &self.missed_cycles)
            .field("got_alive", &self.got_alive)
            .field("seen_checkpoints", &self.seen_checkpoints)
            .finish_non_exhaustive()
    }
}

impl PhmSupervisor {
    /// Create a supervisor with the given requirements.
    #[must_use]
    pub fn new(cfg: SupervisionConfig) -> Self {
        Self {
            cfg,
            cycle_start: None,
            last_healthy: None,
            got_alive: false,
            seen_checkpoints: Vec::new(),
            missed_cycles: 0,
            on_violation: None,
        }
    }

    /// Register the callback invoked on a supervision violation.
    pub fn set_violation_callback(&mut self, cb: impl Fn(&str) + Send + 'static) {
        self.on_violation = Some(Box::new(cb));
    }

    /// Record an alive beat for the current cycle.
    pub fn on_alive(&mut self) {
        self.got_alive = true;
    }

    /// Record a checkpoint for the current cycle.
    pub fn on_checkpoint(&mut self, id: u32) {
        self.seen_checkpoints.push(id);
    }

    /// Evaluate the supervision cycle against the current time.
    pub fn maintenance_tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Evaluate the supervision cycle at `now`.
    ///
    /// The first tick only establishes the cycle start. Afterwards, every
    /// tick past the cycle boundary evaluates the elapsed cycle and starts
    /// the next one.
    pub fn tick_at(&mut self, now: Instant) {
        let Some(cycle_start) = self.cycle_start else {
            self.cycle_start = Some(now);
            self.last_healthy = Some(now);
            return;
        };

        let cycle_len = Duration::from_millis(self.cfg.supervision_cycle_ms);
        if now.duration_since(cycle_start) < cycle_len {
            return;
        }

        let cps_ok = self
            .cfg
            .required_checkpoints
            .iter()
            .all(|cp| self.seen_checkpoints.contains(cp));
        let healthy = if self.cfg.required_checkpoints.is_empty() {
            self.got_alive
        } else {
            self.got_alive && cps_ok
        };

        if healthy {
            self.missed_cycles = 0;
            self.last_healthy = Some(now);
        } else {
            self.missed_cycles += 1;
            warn!(missed = self.missed_cycles, "missed supervision cycle");
            if self.missed_cycles > self.cfg.allowed_missed_cycles {
                if let Some(cb) = &self.on_violation {
                    cb("supervision violation");
                }
                self.missed_cycles = 0;
            }
        }

        // Start the next cycle.
        self.cycle_start = Some(now);
        self.got_alive = false;
        self.seen_checkpoints.clear();
    }

    /// Number of consecutively missed cycles so far.
    #[must_use]
    pub fn missed_cycles(&self) -> u32 {
        self.missed_cycles
    }

    /// Whether an alive beat was received in the current cycle.
    #[must_use]
    pub fn alive_seen_this_cycle(&self) -> bool {
        self.got_alive
    }

    /// Checkpoints recorded in the current cycle.
    #[must_use]
    pub fn checkpoints_seen_this_cycle(&self) -> &[u32] {
        &self.seen_checkpoints
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_supervisor(cfg: SupervisionConfig) -> (PhmSupervisor, Arc<AtomicU32>) {
        let violations = Arc::new(AtomicU32::new(0));
        let mut sup = PhmSupervisor::new(cfg);
        let counter = Arc::clone(&violations);
        sup.set_violation_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sup, violations)
    }

    fn ticks(start: Instant, cycle_ms: u64) -> impl Iterator<Item = Instant> {
        // One tick just past each cycle boundary.
        (1u64..).map(move |n| start + Duration::from_millis(n * cycle_ms + 1))
    }

    #[test]
    fn test_healthy_cycles_never_violate() {
        let (mut sup, violations) = counting_supervisor(SupervisionConfig {
            supervision_cycle_ms: 10,
            allowed_missed_cycles: 1,
            ..SupervisionConfig::default()
        });

        let start = Instant::now();
        sup.tick_at(start);
        for now in ticks(start, 10).take(5) {
            sup.on_alive();
            sup.tick_at(now);
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(sup.missed_cycles(), 0);
    }

    #[test]
    fn test_missing_alive_violates() {
        let (mut sup, violations) = counting_supervisor(SupervisionConfig {
            supervision_cycle_ms: 10,
            allowed_missed_cycles: 1,
            ..SupervisionConfig::default()
        });

        let start = Instant::now();
        sup.tick_at(start);
        for now in ticks(start, 10).take(3) {
            sup.tick_at(now);
        }

        assert!(violations.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_exactly_one_violation_per_exceedance() {
        let (mut sup, violations) = counting_supervisor(SupervisionConfig {
            supervision_cycle_ms: 10,
            allowed_missed_cycles: 1,
            ..SupervisionConfig::default()
        });

        let start = Instant::now();
        sup.tick_at(start);
        // Two missed cycles cross allowed_missed_cycles = 1 once.
        for now in ticks(start, 10).take(2) {
            sup.tick_at(now);
        }
        assert_eq!(violations.load(Ordering::SeqCst), 1);
        // Counter reset: the next single miss alone does not violate again.
        sup.tick_at(start + Duration::from_millis(31));
        assert_eq!(violations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_required_checkpoints_gate_health() {
        let (mut sup, violations) = counting_supervisor(SupervisionConfig {
            supervision_cycle_ms: 10,
            allowed_missed_cycles: 0,
            required_checkpoints: vec![1001, 1002],
        });

        let start = Instant::now();
        sup.tick_at(start);

        // Alive but no checkpoints: one violation.
        sup.on_alive();
        sup.tick_at(start + Duration::from_millis(11));
        assert_eq!(violations.load(Ordering::SeqCst), 1);

        // Alive plus both checkpoints: healthy, no further violation.
        sup.on_alive();
        sup.on_checkpoint(1001);
        sup.on_checkpoint(1002);
        sup.tick_at(start + Duration::from_millis(22));
        assert_eq!(violations.load(Ordering::SeqCst), 1);
        assert_eq!(sup.missed_cycles(), 0);
    }

    #[test]
    fn test_scratch_cleared_on_rollover() {
        let (mut sup, violations) = counting_supervisor(SupervisionConfig {
            supervision_cycle_ms: 10,
            allowed_missed_cycles: 0,
            required_checkpoints: vec![5],
        });

        let start = Instant::now();
        sup.tick_at(start);
        sup.on_alive();
        sup.on_checkpoint(5);
        sup.tick_at(start + Duration::from_millis(11));
        assert_eq!(violations.load(Ordering::SeqCst), 0);

        // Checkpoint from the previous cycle must not carry over.
        sup.on_alive();
        sup.tick_at(start + Duration::from_millis(22));
        assert_eq!(violations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mid_cycle_tick_does_not_evaluate() {
        let (mut sup, violations) = counting_supervisor(SupervisionConfig {
            supervision_cycle_ms: 1000,
            allowed_missed_cycles: 0,
            ..SupervisionConfig::default()
        });

        let start = Instant::now();
        sup.tick_at(start);
        sup.tick_at(start + Duration::from_millis(10));
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }
}
