//! Outward notification surface
//!
//! The server reports pass lifecycle and terminal status through this trait
//! instead of owning any UI. Every method defaults to a no-op so embedders
//! implement only what they surface.

use hotpatch_core::PatchOutcome;
use std::path::Path;
use tracing::info;

pub trait ServerEvents: Send + Sync {
    /// Transient progress line ("Compiling 3 files...").
    fn status(&self, message: &str) {
        let _ = message;
    }

    fn compile_started(&self) {}

    /// Exactly one terminal report per pass.
    fn compile_finished(&self, outcome: &PatchOutcome, message: &str) {
        let _ = (outcome, message);
    }

    fn bring_to_front(&self) {}

    fn play_sound(&self, path: &Path) {
        let _ = path;
    }

    fn clear_log(&self) {}
}

/// Used when nothing richer is installed.
pub struct NullEvents;

impl ServerEvents for NullEvents {}

/// Routes every event into the log.
pub struct LogEvents;

impl ServerEvents for LogEvents {
    fn status(&self, message: &str) {
        info!(target: "hotpatch::status", "{}", message);
    }

    fn compile_started(&self) {
        info!(target: "hotpatch::status", "compile started");
    }

    fn compile_finished(&self, outcome: &PatchOutcome, message: &str) {
        if outcome.is_error() {
            tracing::error!(target: "hotpatch::status", "{}", message);
        } else {
            info!(target: "hotpatch::status", "{}", message);
        }
    }

    fn bring_to_front(&self) {
        info!(target: "hotpatch::status", "bring-to-front requested");
    }

    fn play_sound(&self, path: &Path) {
        info!(target: "hotpatch::status", sound = %path.display(), "play sound");
    }

    fn clear_log(&self) {
        info!(target: "hotpatch::status", "log cleared");
    }
}
