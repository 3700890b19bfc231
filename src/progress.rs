//! One-shot ingestion progress reporting for the CLI.
//!
//! Reports observable progress while the one-shot CLI variant drives a
//! single task to completion, so users see what stage is running and the
//! final outcome. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use crate::models::{Event, EventLevel, Task};
use std::io::{IsTerminal, Write};

/// Reports task progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit one event as it is appended to the task log.
    fn report_event(&self, event: &Event);
    /// Emit the final task outcome once it reaches a terminal status.
    fn report_finished(&self, task: &Task);
}

/// Human-friendly progress on stderr: `[clean] figure_summary_done: ...`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report_event(&self, event: &Event) {
        let marker = match event.level {
            EventLevel::Info => " ",
            EventLevel::Warn => "!",
            EventLevel::Error => "x",
        };
        let line = format!("{marker} [{}] {}: {}\n", event.stage, event.tag, event.message);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }

    fn report_finished(&self, task: &Task) {
        let succeeded = task.files.iter().filter(|f| f.status == crate::models::FileStatus::Succeeded).count();
        let failed = task.files.iter().filter(|f| f.status == crate::models::FileStatus::Failed).count();
        let skipped = task.files.iter().filter(|f| f.status == crate::models::FileStatus::Skipped).count();
        let line = format!(
            "task {} finished: {} (succeeded={succeeded}, failed={failed}, skipped={skipped})\n",
            task.task_id, task.status
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report_event(&self, event: &Event) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
            let _ = std::io::stderr().lock().flush();
        }
    }

    fn report_finished(&self, task: &Task) {
        let obj = serde_json::json!({
            "event": "finished",
            "task_id": task.task_id,
            "status": task.status,
            "summary": task.summary(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report_event(&self, _event: &Event) {}
    fn report_finished(&self, _task: &Task) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Poll `handle`'s task for new events and report them, then report the
/// final outcome once the status becomes terminal. Used by the one-shot CLI
/// path, which has no HTTP client polling `GET /tasks/{id}/events` for it.
pub async fn watch(handle: &crate::pipeline::TaskHandle, reporter: &dyn ProgressReporter) {
    let mut last_seq = 0u64;
    loop {
        let (status, new_events) = {
            let task = handle.task.lock().expect("task lock poisoned");
            let new_events: Vec<Event> = task.events.iter().filter(|e| e.seq > last_seq).cloned().collect();
            (task.status, new_events)
        };
        for event in &new_events {
            reporter.report_event(event);
            last_seq = last_seq.max(event.seq);
        }
        if status.is_terminal() {
            let task = handle.task.lock().expect("task lock poisoned").clone();
            reporter.report_finished(&task);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}
