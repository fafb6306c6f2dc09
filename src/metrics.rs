use tracing::trace;

// Lightweight metrics helpers that stay safe when no recorder is installed.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_tasks(outcome: &'static str) {
    trace!(
        target = "pagecraft.metrics",
        outcome = outcome,
        "tasks_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "pagecraft.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn degraded(stage: &'static str, reason: &str) {
    trace!(
        target = "pagecraft.metrics",
        stage = stage,
        reason = reason,
        "stage_degraded_inc"
    );
}
