//! Terminal and per-session file logging.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

use crate::error::{Error, Result};

type SessionLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

/// Writer threads and the handle used to move the file log to a new session.
struct ActiveLog {
    _stdout: Mutex<WorkerGuard>,
    session: Mutex<WorkerGuard>,
    swap: reload::Handle<SessionLayer, Registry>,
}

static ACTIVE_LOG: OnceLock<ActiveLog> = OnceLock::new();

fn session_writer(op_dir: &Path, op_name: &str) -> Result<(NonBlocking, WorkerGuard, PathBuf)> {
    let log_dir = op_dir.join("logs");
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(op_name)
        .filename_suffix("log")
        .build(&log_dir)
        .map_err(|e| Error::config(format!("cannot open log file in {log_dir:?}: {e}")))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((writer, guard, log_dir.join(format!("{op_name}.log"))))
}

fn session_layer(writer: NonBlocking) -> SessionLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

/// Set up file and terminal logging for a session.
///
/// Logs go to stdout and to `<op_dir>/logs/<op_name>.log`.
/// The level defaults to `info` and can be overridden with `RUST_LOG`.
/// Calling again in the same process moves the file log to the new session.
/// Returns the path of the log file.
pub fn init_logging(op_dir: &Path, op_name: &str) -> Result<PathBuf> {
    let (writer, guard, log_path) = session_writer(op_dir, op_name)?;

    if let Some(active) = ACTIVE_LOG.get() {
        let mut current = active
            .session
            .lock()
            .map_err(|_| Error::config("log writer lock poisoned"))?;
        active
            .swap
            .modify(|layer| *layer = session_layer(writer))
            .map_err(|e| Error::config(format!("cannot switch log file: {e}")))?;
        // The old writer flushes as its guard drops
        *current = guard;
        return Ok(log_path);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::config(format!("bad log filter: {e}")))?;
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let (file_layer, swap) = reload::Layer::new(session_layer(writer));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(filter)
        .with(
            fmt::layer()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_writer(stdout_writer)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| Error::config(format!("logging already set up elsewhere: {e}")))?;

    ACTIVE_LOG.get_or_init(|| ActiveLog {
        _stdout: Mutex::new(stdout_guard),
        session: Mutex::new(guard),
        swap,
    });
    Ok(log_path)
}
