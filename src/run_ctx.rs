//! Ambient run-identifier propagation.
//!
//! Every log emission along a pipeline run's logical control flow should
//! carry that run's UUID, the structural equivalent of the original's
//! `contextvars.ContextVar`-based `current_run_id`/`add_run_id` processor
//! (`original_source/backend/app/utils/logger.py`). Rust has no implicit
//! per-task context that survives a `tokio::spawn` boundary the way a
//! Python `ContextVar` does, so this module uses a `tracing::Span` entered
//! once for the duration of the orchestrator's `run()` call and re-entered
//! explicitly inside every spawned child task closure — copy-into-task
//! semantics, per SPEC_FULL.md §5.

use uuid::Uuid;

/// Build the `tracing::Span` that should be entered for the lifetime of one
/// pipeline run. Every log record emitted while the span (or a clone of its
/// id re-entered in a spawned task) is active is tagged `run_id = ...`.
pub fn run_span(run_id: Uuid) -> tracing::Span {
    tracing::info_span!("pipeline_run", run_id = %run_id)
}

/// Wrap a future so it carries `run_id` into a spawned task.
///
/// `tokio::spawn(in_run(run_id, async { .. }))` is the copy-into-task
/// equivalent of the original's `ContextVar` surviving across
/// `asyncio.gather`: the child inherits the parent's run id explicitly
/// rather than relying on ambient propagation.
pub fn in_run<F: std::future::Future>(
    run_id: Uuid,
    fut: F,
) -> tracing::instrument::Instrumented<F> {
    use tracing::Instrument;
    fut.instrument(run_span(run_id))
}
