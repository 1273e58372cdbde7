use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::{self, CliAction};
use crate::host::{default_shell_host, ShellHost};
use crate::instance::{forward_bang, CopyDataSink, InstanceError, InstanceToken, INSTANCE_MUTEX_NAME};
use crate::shell::{Shell, ShellError, ShellOptions, ShellParts};
use crate::watchdog::{
    HangDetector, Heartbeat, RecoveryWatchdog, WatchdogExit, DEFAULT_POLL_INTERVAL, SHUTDOWN_TIMEOUT,
};

const NOTICE_TITLE: &str = "StepShell";
const PREVIOUS_INSTANCE: &str =
    "A previous instance of StepShell was detected.\nAre you sure you want to continue?";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("instance check failed: {0}")]
    Instance(#[from] InstanceError),
    #[error("failed to start the watchdog: {0}")]
    Watchdog(#[source] std::io::Error),
}

impl RuntimeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Shell(ShellError::ConfigNotFound(_)) => 2,
            Self::Shell(ShellError::ClassRegistration(_)) => 3,
            Self::Shell(ShellError::WindowCreation(_)) => 4,
            Self::Instance(_) | Self::Watchdog(_) => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited,
    Declined,
    Forwarded,
    Headless,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Forwarded => 1,
            Self::Exited | Self::Declined | Self::Headless => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    Forwarded { delivered: bool },
    Start(ShellOptions),
}

pub fn app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn prepare(line: &str, app_dir: &Path, host: &dyn ShellHost, sink: &dyn CopyDataSink) -> Result<Prepared, RuntimeError> {
    match cli::parse_command_line(line, app_dir) {
        CliAction::Forward { command, args } => {
            let delivered = forward_bang(sink, &command, &args);
            Ok(Prepared::Forwarded { delivered })
        }
        CliAction::Start {
            config_path,
            startup_mode,
        } => {
            if !config_path.is_file() {
                let error = ShellError::ConfigNotFound(config_path);
                host.notify(
                    NOTICE_TITLE,
                    &format!("{error}.\nPlease verify the location of the file, and try again."),
                );
                return Err(error.into());
            }
            tracing::info!(config = %config_path.display(), ?startup_mode, "starting");
            Ok(Prepared::Start(ShellOptions {
                app_dir: app_dir.to_path_buf(),
                config_path,
                startup_mode,
            }))
        }
    }
}

pub fn build_shell(options: ShellOptions, parts: ShellParts) -> Result<Option<Shell>, RuntimeError> {
    let shell = Shell::new(options, parts)?;
    if !shell.check_other_shell() {
        tracing::info!("start declined while another shell is running");
        return Ok(None);
    }
    Ok(Some(shell))
}

/// Takes the single-instance token and tunes minimized windows for this
/// run. `None` means the operator declined to run beside a previous instance.
pub fn claim_instance(name: &str, host: &dyn ShellHost) -> Result<Option<InstanceToken>, RuntimeError> {
    let token = InstanceToken::acquire(name)?;
    if token.already_existed() && !host.confirm(NOTICE_TITLE, PREVIOUS_INSTANCE) {
        tracing::info!(name, "start declined beside a previous instance");
        return Ok(None);
    }

    if !host.hide_minimized_windows() {
        tracing::debug!("minimized window arrangement unchanged");
    }
    Ok(Some(token))
}

pub fn run(args: &[String]) -> Result<RunOutcome, RuntimeError> {
    let heartbeat = Heartbeat::new();
    let watchdog = RecoveryWatchdog::spawn(
        Box::new(HangDetector::logging(Arc::clone(&heartbeat))),
        DEFAULT_POLL_INTERVAL,
    )
    .map_err(RuntimeError::Watchdog)?;

    let host = default_shell_host();
    let result = run_shell(args, &host, &heartbeat);

    if let Err(RuntimeError::Shell(error)) = &result {
        if !matches!(error, ShellError::ConfigNotFound(_)) {
            host.notify(NOTICE_TITLE, &error.to_string());
        }
    }

    match watchdog.shutdown(SHUTDOWN_TIMEOUT) {
        WatchdogExit::Graceful => {}
        WatchdogExit::TimedOut => tracing::warn!("watchdog abandoned at exit"),
    }
    match &result {
        Ok(outcome) => tracing::info!(?outcome, "stepshell exiting"),
        Err(error) => tracing::error!(%error, "stepshell exiting"),
    }
    result
}

fn run_shell(args: &[String], host: &Arc<dyn ShellHost>, heartbeat: &Heartbeat) -> Result<RunOutcome, RuntimeError> {
    let app_dir = app_dir();
    let line = cli::join_args(args);
    let sink = forward_sink();

    let options = match prepare(&line, &app_dir, host.as_ref(), sink.as_ref())? {
        Prepared::Forwarded { .. } => return Ok(RunOutcome::Forwarded),
        Prepared::Start(options) => options,
    };

    let Some(token) = claim_instance(INSTANCE_MUTEX_NAME, host.as_ref())? else {
        return Ok(RunOutcome::Declined);
    };

    let parts = ShellParts::new(Arc::clone(host)).with_capabilities(probe_capabilities());
    let Some(shell) = build_shell(options, parts)? else {
        return Ok(RunOutcome::Declined);
    };

    let outcome = run_main_window(&shell, heartbeat)?;
    drop(shell);
    drop(token);
    Ok(outcome)
}

#[cfg(target_os = "windows")]
fn forward_sink() -> Box<dyn CopyDataSink> {
    match crate::windows_shell::RunningInstance::find() {
        Some(instance) => Box::new(instance),
        None => Box::new(crate::instance::NoInstance),
    }
}

#[cfg(not(target_os = "windows"))]
fn forward_sink() -> Box<dyn CopyDataSink> {
    Box::new(crate::instance::NoInstance)
}

#[cfg(target_os = "windows")]
fn probe_capabilities() -> crate::host::Capabilities {
    crate::windows_shell::probe_capabilities()
}

#[cfg(not(target_os = "windows"))]
fn probe_capabilities() -> crate::host::Capabilities {
    crate::host::Capabilities::default()
}

#[cfg(target_os = "windows")]
fn run_main_window(shell: &Shell, heartbeat: &Heartbeat) -> Result<RunOutcome, RuntimeError> {
    use crate::event_loop::run_loop;
    use crate::windows_shell::{MainWindow, NativePump};

    let window = MainWindow::create()?;
    window.attach(shell);
    shell.start(window.handle());

    let stats = run_loop(shell, &mut NativePump, heartbeat);
    tracing::info!(
        window_messages = stats.window_messages,
        completions = stats.completions,
        faults = shell.faults(),
        "main loop finished"
    );

    shell.shutdown();
    window.detach();
    drop(window);
    Ok(RunOutcome::Exited)
}

#[cfg(not(target_os = "windows"))]
fn run_main_window(shell: &Shell, _heartbeat: &Heartbeat) -> Result<RunOutcome, RuntimeError> {
    tracing::info!(
        config = %shell.options().config_path.display(),
        "headless host: no native shell window on this platform"
    );
    println!("[stepshell] non-windows runtime mode: configuration checked, no shell window");
    Ok(RunOutcome::Headless)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockShellHost;
    use crate::instance::NoInstance;
    use crate::startup::{MockStartupScheduler, StartupMode};

    #[test]
    fn exit_codes_are_distinct_per_fatal_error() {
        let codes = [
            RuntimeError::Shell(ShellError::ConfigNotFound(PathBuf::new())).exit_code(),
            RuntimeError::Shell(ShellError::ClassRegistration(String::new())).exit_code(),
            RuntimeError::Shell(ShellError::WindowCreation(String::new())).exit_code(),
            RuntimeError::Instance(InstanceError::Mutex(5)).exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4, 5]);
        assert_eq!(RunOutcome::Forwarded.exit_code(), 1);
        assert_eq!(RunOutcome::Declined.exit_code(), 0);
    }

    #[test]
    fn missing_config_notifies_and_maps_to_exit_2() {
        let host = MockShellHost::default();
        let dir = std::env::temp_dir().join("stepshell-runtime-missing");
        let error = prepare("", &dir, &host, &NoInstance).unwrap_err();

        assert_eq!(error.exit_code(), 2);
        assert_eq!(host.notices().len(), 1);
        assert!(host.notices()[0].contains("step.rc"));
    }

    #[test]
    fn bang_on_command_line_forwards_without_starting() {
        let host = MockShellHost::default();
        let prepared = prepare("!Recycle", Path::new("."), &host, &NoInstance).unwrap();
        assert_eq!(prepared, Prepared::Forwarded { delivered: false });
        assert!(host.notices().is_empty());
    }

    #[test]
    fn declining_under_another_shell_builds_nothing() {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("stepshell-runtime-{unique}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("step.rc"), "").unwrap();

        let host = Arc::new(MockShellHost::default());
        host.add_named_window("Shell_TrayWnd", crate::messages::WindowHandle(0x77));
        host.set_confirm_answer(false);

        let options = match prepare("-nostartup", &dir, host.as_ref(), &NoInstance).unwrap() {
            Prepared::Start(options) => options,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(options.startup_mode, StartupMode::DontRun);

        let parts = ShellParts::new(host.clone()).with_startup(MockStartupScheduler::default());
        assert!(build_shell(options, parts).unwrap().is_none());
        assert_eq!(host.prompts().len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }
}
