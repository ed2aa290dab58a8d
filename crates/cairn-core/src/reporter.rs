use tracing::{error, info, warn};

use cairn_types::mac::Mac;

/// Callbacks the core emits while running a task. Implementations decide
/// where the events go; the default writes structured log lines.
pub trait Reporter: Send + Sync {
    fn task_start(&self, kind: &str, name: &str);
    fn task_done(&self);
    fn task_warning(&self, message: &str);
    fn task_failed(&self, code: i32, message: &str);
    fn with_snapshot_id(&self, mac: Mac);
    fn with_repository_name(&self, name: &str);
}

/// Reporter that writes through `tracing`.
#[derive(Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn task_start(&self, kind: &str, name: &str) {
        info!(kind, name, "task started");
    }

    fn task_done(&self) {
        info!("task done");
    }

    fn task_warning(&self, message: &str) {
        warn!("task warning: {message}");
    }

    fn task_failed(&self, code: i32, message: &str) {
        error!(code, "task failed: {message}");
    }

    fn with_snapshot_id(&self, mac: Mac) {
        info!(snapshot = %mac, "task snapshot");
    }

    fn with_repository_name(&self, name: &str) {
        info!(repository = name, "task repository");
    }
}
