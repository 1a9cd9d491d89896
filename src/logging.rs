//! Logging initialisation for sandbox-vm.
//!
//! Two layers of logging exist:
//!
//! - The process-wide subscriber installed by [`init`]. It writes to stderr
//!   (never stdout, which belongs to the guest console) filtered by
//!   `RUST_LOG`. When `SANDBOX_VM_LOG=1` is set, logs are also written to the
//!   OS log directory under `sandbox-vm/sandbox-vm.log`.
//! - A per-VM [`VmLog`] that appends debug-level records to the `log` file
//!   inside the VM's data directory while the VM is being started or stopped.

use std::path::Path;

use tracing::{Dispatch, error};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::vm::data_dir::open_append;

pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> LogGuard {
    let file_guard = if std::env::var("SANDBOX_VM_LOG").as_deref() == Ok("1") {
        let dir = log_dir().unwrap_or_else(|| std::path::PathBuf::from("/tmp"));
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, "sandbox-vm.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}

fn log_dir() -> Option<std::path::PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        let mut p = std::path::PathBuf::from(xdg);
        p.push("sandbox-vm");
        return Some(p);
    }
    let home = std::env::var("HOME").ok()?;
    let mut p = std::path::PathBuf::from(home);
    #[cfg(target_os = "macos")]
    {
        p.push("Library");
        p.push("Logs");
    }
    #[cfg(not(target_os = "macos"))]
    {
        p.push(".local");
        p.push("share");
    }
    p.push("sandbox-vm");
    Some(p)
}

/// Logger for one VM.
pub struct VmLog {
    dispatch: Dispatch,
    to_file: bool,
    _guard: Option<WorkerGuard>,
}

impl VmLog {
    /// Append to `path`. If the file cannot be opened, fall back to the
    /// current default dispatcher and report the failure there at error level.
    pub fn open(path: &Path) -> Self {
        match open_append(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                let subscriber = fmt()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_max_level(tracing::Level::DEBUG)
                    .finish();
                Self {
                    dispatch: Dispatch::new(subscriber),
                    to_file: true,
                    _guard: Some(guard),
                }
            }
            Err(e) => {
                let log = Self::fallback();
                tracing::dispatcher::with_default(&log.dispatch, || {
                    error!(path = %path.display(), error = %e, "could not create log file, using default logger");
                });
                log
            }
        }
    }

    /// Whatever dispatcher is current for this thread.
    pub fn fallback() -> Self {
        Self {
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
            to_file: false,
            _guard: None,
        }
    }

    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            to_file: false,
            _guard: None,
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn is_file_backed(&self) -> bool {
        self.to_file
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl std::fmt::Debug for VmLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLog").field("to_file", &self.to_file).finish()
    }
}
