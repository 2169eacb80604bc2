//! Cosmetic progress estimation
//!
//! Backends that do not stream progress still get a moving bar: the stage is
//! looked up from how long the current attempt has been running. A value the
//! provider reports always wins over the estimate.

use kiln_core::JobKind;
use std::time::Duration;

/// Stage shown while waiting for a queue slot
pub const STAGE_QUEUED: &str = "Queued for processing...";

/// Stage shown while outputs are fetched and uploaded
pub const STAGE_FINALIZING: &str = "Finalizing outputs...";

/// Stage shown once a job is done
pub const STAGE_COMPLETED: &str = "Completed";

/// (seconds elapsed, progress, stage)
type Stage = (u64, u8, &'static str);

const PROMPT_STAGES: &[Stage] = &[
    (0, 5, "Loading model..."),
    (8, 10, "Generating..."),
    (20, 40, "Generating..."),
    (40, 70, "Refining details..."),
    (70, 85, "Processing..."),
];

const ROTATION_STAGES: &[Stage] = &[
    (0, 5, "Downloading input image..."),
    (5, 10, "Preprocessing image..."),
    (15, 15, "Loading SV3D model..."),
    (30, 20, "Generating orbital views..."),
    (90, 60, "Processing rotations..."),
    (150, 85, "Processing rotations..."),
];

/// Estimated `(progress, stage)` for a job that has been running `elapsed`
pub fn estimate(kind: JobKind, elapsed: Duration) -> (u8, &'static str) {
    let table = if kind.is_rotation() {
        ROTATION_STAGES
    } else {
        PROMPT_STAGES
    };
    let secs = elapsed.as_secs();
    table
        .iter()
        .rev()
        .find(|(at, _, _)| secs >= *at)
        .map(|(_, progress, stage)| (*progress, *stage))
        .unwrap_or((0, STAGE_QUEUED))
}

/// Prefer provider-reported values, fill gaps from the estimate, never go backwards
pub fn merge(
    kind: JobKind,
    elapsed: Duration,
    current: u8,
    reported: Option<u8>,
    reported_stage: Option<&str>,
) -> (u8, String) {
    let (estimated, estimated_stage) = estimate(kind, elapsed);
    let progress = reported.unwrap_or(estimated).min(99).max(current);
    let stage = reported_stage.unwrap_or(estimated_stage).to_string();
    (progress, stage)
}
