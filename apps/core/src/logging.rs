use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "stepshell.log";
const ARCHIVE_PREFIX: &str = "stepshell-";
const MAX_LOG_BYTES: u64 = 1_000_000;
const MAX_ARCHIVES: usize = 5;
const FILTER_ENV: &str = "STEPSHELL_LOG";
const FORMAT_ENV: &str = "STEPSHELL_LOG_FORMAT";

static LOGGING_INIT: OnceLock<()> = OnceLock::new();
static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

pub fn logs_dir() -> PathBuf {
    crate::config::stable_app_data_dir().join("logs")
}

/// Installs the global subscriber: a rotating file under [`logs_dir`] plus
/// stderr. Safe to call more than once.
pub fn init() -> Result<(), std::io::Error> {
    if LOGGING_INIT.get().is_some() {
        return Ok(());
    }

    let log_dir = logs_dir();
    fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_if_needed(&log_path, &log_dir)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (compact_file, json_file) = if json {
        (
            None,
            Some(fmt::layer().json().with_ansi(false).with_writer(Mutex::new(file))),
        )
    } else {
        (
            Some(fmt::layer().compact().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        )
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(compact_file)
        .with(json_file)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
    if let Err(err) = result {
        eprintln!("[stepshell] tracing init skipped: {err}");
    }

    let _ = LOGGING_INIT.set(());
    install_panic_hook();
    Ok(())
}

fn rotate_if_needed(log_path: &Path, log_dir: &Path) -> Result<(), std::io::Error> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err),
    };
    if size < MAX_LOG_BYTES {
        return Ok(());
    }

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    fs::rename(log_path, log_dir.join(format!("{ARCHIVE_PREFIX}{stamp}.log")))?;
    prune_old_archives(log_dir)
}

fn archive_stamp(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(ARCHIVE_PREFIX)?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

fn prune_old_archives(log_dir: &Path) -> Result<(), std::io::Error> {
    let mut archives: Vec<(u64, PathBuf)> = fs::read_dir(log_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter_map(|path| archive_stamp(&path).map(|stamp| (stamp, path)))
        .collect();
    if archives.len() <= MAX_ARCHIVES {
        return Ok(());
    }

    archives.sort_unstable_by_key(|(stamp, _)| std::cmp::Reverse(*stamp));
    for (_, stale) in archives.drain(MAX_ARCHIVES..) {
        if let Err(error) = fs::remove_file(&stale) {
            tracing::debug!(path = %stale.display(), %error, "could not remove old log");
        }
    }
    Ok(())
}

// Panics are logged before the default report runs.
fn install_panic_hook() {
    PANIC_HOOK_INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            let message = match (payload.downcast_ref::<&str>(), payload.downcast_ref::<String>()) {
                (Some(text), _) => text.to_string(),
                (None, Some(text)) => text.clone(),
                (None, None) => "non-string panic payload".to_string(),
            };
            match info.location() {
                Some(at) => tracing::error!(file = at.file(), line = at.line(), %message, "panic"),
                None => tracing::error!(%message, "panic"),
            }
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::{logs_dir, prune_old_archives};

    #[test]
    fn logs_dir_uses_stable_app_data_layout() {
        let dir = logs_dir();
        assert!(dir
            .to_string_lossy()
            .to_ascii_lowercase()
            .contains("stepshell"));
    }

    #[test]
    fn prune_keeps_newest_archives() {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("stepshell-log-prune-{unique}"));
        std::fs::create_dir_all(&dir).unwrap();
        for stamp in [1, 2, 3, 4, 5, 6, 70] {
            std::fs::write(dir.join(format!("stepshell-{stamp}.log")), b"x").unwrap();
        }
        std::fs::write(dir.join("stepshell.log"), b"live").unwrap();

        prune_old_archives(&dir).unwrap();

        assert!(!dir.join("stepshell-1.log").exists());
        assert!(!dir.join("stepshell-2.log").exists());
        assert!(dir.join("stepshell-3.log").exists());
        assert!(dir.join("stepshell-70.log").exists());
        assert!(dir.join("stepshell.log").exists());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
