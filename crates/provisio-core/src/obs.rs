//! Structured lifecycle events for provisioning sequences.
//!
//! Events are emitted at `info!` (failures at `warn!`) with an `event`
//! field, so JSON output can be filtered on it.

use tracing::{info, warn, Span};

use crate::phase::LifecyclePhase;

/// Span covering one provisioning sequence; attach it with
/// `tracing::Instrument` so every event inside carries the sequence fields.
pub fn sequence_span(kind: &str, driver: &str, name: &str) -> Span {
    let sequence_id = uuid::Uuid::new_v4();
    tracing::info_span!(
        "provisio.sequence",
        %sequence_id,
        kind = %kind,
        driver = %driver,
        name = %name,
    )
}

pub fn emit_phase_entered(phase: LifecyclePhase, record_id: Option<i64>) {
    info!(event = "phase.entered", phase = %phase, record_id = ?record_id);
}

pub fn emit_phase_failed(phase: LifecyclePhase, operation: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "phase.failed",
        phase = %phase,
        operation = %operation,
        error = %error,
    );
}

pub fn emit_sequence_finished(record_id: Option<i64>, duration_ms: u64, success: bool) {
    info!(
        event = "sequence.finished",
        record_id = ?record_id,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_plugin_address(plugin: &dyn std::fmt::Display, address: &str) {
    info!(event = "plugin.address", plugin = %plugin, address = %address);
}
