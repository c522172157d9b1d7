//! Prometheus metrics for the up/down trader.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_gauge, CounterVec, Gauge, GaugeVec, HistogramVec, IntGauge,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use updown_core::EngineEvent;

/// Fill ingestion outcomes.
/// Labels: outcome (applied/duplicate/rejected/ignored)
pub static FILLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_fills_total",
        "Fill events by ingestion outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Position state transitions.
pub static TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_transitions_total",
        "Position state transitions",
        &["from", "to"]
    )
    .unwrap()
});

/// Order actions by side.
/// Labels: side (entry/exit), action (submitted/accepted/rejected/cancelled)
pub static ORDER_ACTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_order_actions_total",
        "Order actions by side",
        &["side", "action"]
    )
    .unwrap()
});

/// Outstanding orders across all cycles.
pub static ORDERS_OUTSTANDING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "updown_orders_outstanding",
        "Orders currently outstanding at the venue"
    )
    .unwrap()
});

/// Stops by error class.
pub static STOPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("updown_stops_total", "Emergency stops", &["class"]).unwrap()
});

/// Exit-only directives by reason.
pub static EXIT_ONLY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_exit_only_total",
        "Exit-only directives issued",
        &["reason"]
    )
    .unwrap()
});

/// Entry proposals blocked by a gate.
pub static GATE_BLOCKED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_gate_blocked_total",
        "Entry proposals blocked",
        &["gate"]
    )
    .unwrap()
});

/// Account-level projected exposure in collateral units.
pub static ACCOUNT_EXPOSURE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "updown_account_exposure",
        "Projected exposure across all cycles"
    )
    .unwrap()
});

/// Per-cycle ledger inventory.
pub static INVENTORY: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "updown_inventory",
        "Confirmed inventory per cycle token",
        &["cycle"]
    )
    .unwrap()
});

/// Sanity mismatches between reported position and ledger.
pub static SANITY_ALERTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_sanity_alerts_total",
        "Reported-position sanity alerts",
        &["cycle"]
    )
    .unwrap()
});

/// Claim steps by backend and outcome.
/// Labels: backend (CUSTOM/SAFE/UNKNOWN/none), outcome
pub static CLAIMS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "updown_claims_total",
        "Redemption claim steps",
        &["backend", "outcome"]
    )
    .unwrap()
});

/// Remote call latency in milliseconds.
pub static REMOTE_CALL_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "updown_remote_call_ms",
        "Remote call latency in milliseconds",
        &["op"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap()
});

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record the counters implied by an engine event.
    pub fn record_event(event: &EngineEvent) {
        match event {
            EngineEvent::Transition { from, to, .. } => {
                TRANSITIONS_TOTAL
                    .with_label_values(&[&from.to_string(), &to.to_string()])
                    .inc();
            }
            EngineEvent::FillApplied {
                cycle, inventory, ..
            } => {
                FILLS_TOTAL.with_label_values(&["applied"]).inc();
                INVENTORY
                    .with_label_values(&[&cycle.to_string()])
                    .set(to_f64(*inventory));
            }
            EngineEvent::FillDuplicate { .. } => {
                FILLS_TOTAL.with_label_values(&["duplicate"]).inc();
            }
            EngineEvent::FillRejected { .. } => {
                FILLS_TOTAL.with_label_values(&["rejected"]).inc();
            }
            EngineEvent::FillIgnored { .. } => {
                FILLS_TOTAL.with_label_values(&["ignored"]).inc();
            }
            EngineEvent::OrderSubmitted { side, .. } => {
                Self::order_action(&side.to_string(), "submitted");
            }
            EngineEvent::OrderAccepted { side, .. } => {
                Self::order_action(&side.to_string(), "accepted");
            }
            EngineEvent::OrderRejected { side, .. } => {
                Self::order_action(&side.to_string(), "rejected");
            }
            EngineEvent::OrderCancelled { side, .. } => {
                Self::order_action(&side.to_string(), "cancelled");
            }
            EngineEvent::StopTriggered { class, .. } => {
                STOPS_TOTAL.with_label_values(&[&class.to_string()]).inc();
            }
            EngineEvent::CancelUnconfirmed { client_ids, .. } => {
                ORDER_ACTIONS_TOTAL
                    .with_label_values(&["any", "cancel_unconfirmed"])
                    .inc_by(client_ids.len() as f64);
            }
            EngineEvent::ExitOnly { reason, .. } => {
                EXIT_ONLY_TOTAL.with_label_values(&[reason]).inc();
            }
            EngineEvent::SanityAlert { cycle, .. } => {
                SANITY_ALERTS_TOTAL
                    .with_label_values(&[&cycle.to_string()])
                    .inc();
            }
            EngineEvent::ClaimRegistered { .. } => {
                Self::claim("none", "registered");
            }
            EngineEvent::ClaimSubmitted { backend, .. } => {
                Self::claim(&backend.to_string(), "submitted");
            }
            EngineEvent::ClaimAttemptFailed { backend, .. } => {
                Self::claim(&backend.to_string(), "failed");
            }
            EngineEvent::ClaimConfirmed { backend, .. } => {
                Self::claim(&backend.to_string(), "confirmed");
            }
            EngineEvent::ClaimDiscrepancy { .. } => {
                Self::claim("none", "discrepancy");
            }
            EngineEvent::ClaimEscalated { .. } => {
                Self::claim("none", "escalated");
            }
            EngineEvent::ClaimWorthless { .. } => {
                Self::claim("none", "worthless");
            }
            EngineEvent::CycleClosed { cycle, .. } => {
                INVENTORY.with_label_values(&[&cycle.to_string()]).set(0.0);
            }
        }
    }

    /// Record an order action.
    pub fn order_action(side: &str, action: &str) {
        ORDER_ACTIONS_TOTAL.with_label_values(&[side, action]).inc();
    }

    /// Adjust the outstanding order count by one cycle's change.
    pub fn orders_outstanding_delta(delta: i64) {
        ORDERS_OUTSTANDING.add(delta);
    }

    /// Record an entry blocked by a gate.
    pub fn gate_blocked(gate: &str) {
        GATE_BLOCKED_TOTAL.with_label_values(&[gate]).inc();
    }

    /// Update account-level exposure.
    pub fn account_exposure(exposure: Decimal) {
        ACCOUNT_EXPOSURE.set(to_f64(exposure));
    }

    /// Record a claim step.
    pub fn claim(backend: &str, outcome: &str) {
        CLAIMS_TOTAL.with_label_values(&[backend, outcome]).inc();
    }

    /// Record remote call latency.
    pub fn remote_call(op: &str, latency_ms: f64) {
        REMOTE_CALL_MS.with_label_values(&[op]).observe(latency_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use updown_core::{CycleId, PositionState};

    #[test]
    fn test_record_transition_increments() {
        let labels = ["IDLE", "ENTRY_PENDING"];
        let before = TRANSITIONS_TOTAL.with_label_values(&labels).get();
        Metrics::record_event(&EngineEvent::Transition {
            cycle: CycleId(9),
            from: PositionState::Idle,
            to: PositionState::EntryPending,
            trigger: "test".to_string(),
            at_ms: 0,
        });
        let after = TRANSITIONS_TOTAL.with_label_values(&labels).get();
        assert!(after >= before + 1.0);
    }

    #[test]
    fn test_account_exposure_gauge() {
        Metrics::account_exposure(rust_decimal_macros::dec!(2.25));
        assert!((ACCOUNT_EXPOSURE.get() - 2.25).abs() < 1e-9);
    }
}
