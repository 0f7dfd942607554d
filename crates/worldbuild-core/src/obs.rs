//! Structured observability hooks for build run lifecycle events.
//!
//! This module provides:
//! - Run-scoped and solution-scoped tracing spans, attached to async work
//!   with [`tracing::Instrument`]
//! - Emission functions for key lifecycle events: run start/finish, prepare,
//!   build, retry, rollback, missing targets and failed pushes
//!
//! Events are emitted at `info!` level unless they report a failure.
//! Verbosity follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{error, info, warn, Span};

use crate::build_result::BuildResultType;

/// Span covering one orchestrator run.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// orchestrator_work.instrument(run_span("run-123", BuildResultType::Ci)).await;
/// // every event inside carries run_id = "run-123"
/// ```
pub fn run_span(run_id: &str, build_type: BuildResultType) -> Span {
    tracing::info_span!("worldbuild.run", run_id = %run_id, build_type = %build_type)
}

/// Span covering the work on one solution.
pub fn solution_span(name: &str, index: usize) -> Span {
    tracing::info_span!("solution", name = %name, index = index)
}

pub fn emit_run_started(run_id: &str, build_type: BuildResultType, solutions: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        build_type = %build_type,
        solutions = solutions,
    );
}

/// Emit event: run finished with duration, built solution count and status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, built: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        built = built,
        success = success,
    );
}

pub fn emit_solution_prepared(
    name: &str,
    commit_sha: &str,
    version: Option<&semver::Version>,
    must_build: bool,
) {
    info!(
        event = "solution.prepared",
        solution = %name,
        commit_sha = %commit_sha,
        version = ?version.map(ToString::to_string),
        must_build = must_build,
    );
}

pub fn emit_solution_built(name: &str, version: &semver::Version, attempts: u32) {
    info!(
        event = "solution.built",
        solution = %name,
        version = %version,
        attempts = attempts,
    );
}

pub fn emit_solution_skipped(name: &str, reason: &str) {
    info!(event = "solution.skipped", solution = %name, reason = %reason);
}

/// Emit event: upstream solutions were built at versions Prepare did not see.
pub fn emit_upgrades_realigned(name: &str, upgrades: usize) {
    info!(event = "solution.upgrades_realigned", solution = %name, upgrades = upgrades);
}

/// Emit event: a build step asked to be retried on a new commit.
pub fn emit_retry_scheduled(name: &str, attempt: u32, commit_sha: &str) {
    warn!(
        event = "solution.retry",
        solution = %name,
        attempt = attempt,
        commit_sha = %commit_sha,
    );
}

pub fn emit_solution_failed(name: &str, error: &dyn std::fmt::Display) {
    error!(event = "solution.failed", solution = %name, error = %error);
}

/// Emit event: a repository was reset to its pre-run commit.
pub fn emit_rollback_performed(name: &str, repository: &str, commit_sha: &str) {
    warn!(
        event = "rollback.performed",
        solution = %name,
        repository = %repository,
        commit_sha = %commit_sha,
    );
}

pub fn emit_rollback_failed(name: &str, repository: &str, error: &dyn std::fmt::Display) {
    error!(
        event = "rollback.failed",
        solution = %name,
        repository = %repository,
        error = %error,
    );
}

pub fn emit_artifact_target_missing(artifact: &str) {
    error!(event = "result.target_missing", artifact = %artifact);
}

/// Emit event: pushing to one artifact repository failed (warning level,
/// other targets keep what they received).
pub fn emit_push_failed(target: &str, count: usize, error: &dyn std::fmt::Display) {
    warn!(event = "push.failed", target = %target, count = count, error = %error);
}

pub fn emit_pushed(target: &str, count: usize) {
    info!(event = "push.completed", target = %target, count = count);
}
