//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and tests that want to
//! see them call `init_tracing` once at startup.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-link.log";

/// Rotated log files kept next to the current one.
const KEEP_ROTATED: u32 = 3;

const DEFAULT_FILTER: &str = "mcp_link=info,warn";

/// Platform-standard directory for log output.
///
/// - macOS: `~/Library/Application Support/mcp-link/`
/// - Linux: `$XDG_DATA_HOME/mcp-link/` (fallback `~/.local/share/mcp-link/`)
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-link\`
///
/// Falls back to `~/.mcp-link/` when no data directory can be resolved.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-link");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-link")
}

/// Install the global tracing subscriber.
///
/// With a `log_dir`, rotates existing logs (`mcp-link.log` → `.1` → `.2` →
/// `.3`) and writes a fresh file through a line-flushing writer. Without one,
/// logs go to stderr. The filter comes from `RUST_LOG`, defaulting to
/// `mcp_link=info,warn`.
///
/// Returns the log file path when logging to a file. Calling this when a
/// global subscriber is already installed leaves the existing one in place.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let Some(log_dir) = log_dir else {
        let _ = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, KEEP_ROTATED);

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== mcp-link logging started ==="
        );
    }
    Ok(Some(log_path))
}

/// Rotate log files: `mcp-link.log` → `mcp-link.log.1` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files in the chain are
/// skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// Wraps a log file and flushes after every write so each line reaches disk
/// even if the process dies.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
