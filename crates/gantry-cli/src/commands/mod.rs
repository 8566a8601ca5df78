pub mod build_images;
pub mod completions;

use console::Style;
use gantry_compiler::{ProgressLog, ProgressState};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_COMPILE_ERROR: u8 = 3;

/// Global options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub work_dir: PathBuf,
    pub manifest: PathBuf,
    pub releases: Vec<PathBuf>,
    pub dev_cache_dir: Option<PathBuf>,
    pub light_opinions: Option<PathBuf>,
    pub dark_opinions: Option<PathBuf>,
    pub repository: String,
    pub registry: String,
    pub organization: String,
    pub engine: String,
    pub workers: Option<usize>,
    pub metrics: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub cache_read_only: bool,
}

impl GlobalOptions {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        })
    }
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Renders compile progress with color-coded state words, one line per
/// transition.
pub struct ConsoleLog;

impl ProgressLog for ConsoleLog {
    fn line(&self, state: ProgressState, message: &str) {
        let style = match state {
            ProgressState::Result => Style::new().yellow(),
            ProgressState::Done => Style::new().green(),
            ProgressState::Killed => Style::new().red(),
            _ => Style::new().magenta(),
        };
        println!("{:8} {message}", style.apply_to(state.as_str()));
    }
}

/// Parse repeated `--add-label key=value` arguments.
pub fn parse_labels(
    labels: &[String],
) -> Result<std::collections::BTreeMap<String, String>, String> {
    let mut parsed = std::collections::BTreeMap::new();
    for label in labels {
        match label.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                parsed.insert(key.to_owned(), value.to_owned());
            }
            _ => {
                return Err(format!(
                    "invalid label format '{label}'. Use: --add-label \"foo=bar\""
                ))
            }
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_key_value_pairs() {
        let labels = parse_labels(&["a=1".to_owned(), "b=two=parts".to_owned()]).unwrap();
        assert_eq!(labels["a"], "1");
        assert_eq!(labels["b"], "two=parts");
    }

    #[test]
    fn malformed_label_is_rejected() {
        assert!(parse_labels(&["no-equals".to_owned()]).is_err());
        assert!(parse_labels(&["=value".to_owned()]).is_err());
    }

    #[test]
    fn worker_count_defaults_to_parallelism() {
        let globals = GlobalOptions::default();
        assert!(globals.worker_count() >= 1);
        let fixed = GlobalOptions {
            workers: Some(7),
            ..GlobalOptions::default()
        };
        assert_eq!(fixed.worker_count(), 7);
    }
}
