use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Append-only CSV metrics: `timestamp,gantry,series,event`.
///
/// Series follow the scheme `compile-packages`,
/// `compile-packages::wait::<release>/<package>` and
/// `compile-packages::run::<release>/<package>`, with `start`/`done` events
/// bracketing each phase.
pub struct Metrics {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Metrics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Stamp an event. Metrics are best-effort: failures are logged, never
    /// propagated into the build.
    pub fn stamp(&self, series: &str, event: &str) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let line = format!(
            "{},gantry,{series},{event}\n",
            chrono::Utc::now().to_rfc3339()
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("cannot stamp metrics to {}: {e}", self.path.display());
        }
    }
}
