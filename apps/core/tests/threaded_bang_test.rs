use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stepshell_core::bang::{BangContext, BangDispatch, BangHandler};
use stepshell_core::event_loop::{run_loop, ScriptedPump};
use stepshell_core::host::MockShellHost;
use stepshell_core::messages::WindowHandle;
use stepshell_core::module_manager::MockModuleLoader;
use stepshell_core::shell::{Shell, ShellOptions, ShellParts};
use stepshell_core::startup::{MockStartupScheduler, StartupMode};
use stepshell_core::watchdog::Heartbeat;

const MAIN: WindowHandle = WindowHandle(0x3000);

#[derive(Default)]
struct Counted {
    executed: AtomicUsize,
    completed: AtomicUsize,
}

struct CountingBang(Arc<Counted>);

impl BangHandler for CountingBang {
    fn execute(&self, _ctx: &BangContext<'_>, _args: &str) {
        std::thread::sleep(Duration::from_millis(5));
        self.0.executed.fetch_add(1, Ordering::SeqCst);
    }

    fn complete(&self, ctx: &BangContext<'_>, args: &str) {
        assert_eq!(ctx.main_window, MAIN);
        assert_eq!(args, "payload");
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn shell_with_host(label: &str) -> (Shell, Arc<MockShellHost>, PathBuf) {
    let unique = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("stepshell-{label}-{unique}"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("step.rc"), "").unwrap();

    let host = Arc::new(MockShellHost::default());
    let parts = ShellParts::new(host.clone())
        .with_module_loader(MockModuleLoader::default())
        .with_startup(MockStartupScheduler::default());
    let shell = Shell::new(
        ShellOptions {
            app_dir: dir.clone(),
            config_path: dir.join("step.rc"),
            startup_mode: StartupMode::DontRun,
        },
        parts,
    )
    .unwrap();
    shell.start(MAIN);
    (shell, host, dir)
}

#[test]
fn threaded_completions_run_once_each_on_the_loop() {
    let (shell, host, dir) = shell_with_host("threaded");
    let counted = Arc::new(Counted::default());
    shell
        .register_bang("!Slow", CountingBang(counted.clone()), true)
        .unwrap();

    for _ in 0..4 {
        let dispatch = shell.parse_bang_command(WindowHandle::NULL, "!slow", "payload").unwrap();
        assert_eq!(dispatch, BangDispatch::Spawned);
    }

    let heartbeat = Heartbeat::new();
    let mut pump = ScriptedPump::new(host.clone(), MAIN).with_idle_wait(Duration::from_millis(500));
    let mut completions = 0;
    while completions < 4 {
        let stats = run_loop(&shell, &mut pump, &heartbeat);
        assert!(stats.thread_messages > 0, "no worker woke the loop");
        completions += stats.completions;
    }

    assert_eq!(completions, 4);
    assert_eq!(counted.executed.load(Ordering::SeqCst), 4);
    assert_eq!(counted.completed.load(Ordering::SeqCst), 4);
    assert_eq!(shell.threaded_in_flight(), 0);
    assert_eq!(shell.process_completions(), 0);

    drop(shell);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn unknown_bang_is_reported_not_fatal() {
    let (shell, _host, dir) = shell_with_host("unknown-bang");
    assert_eq!(
        shell.parse_bang_command(WindowHandle::NULL, "!NoSuchThing", "").unwrap(),
        BangDispatch::NotFound
    );
    assert_eq!(shell.faults(), 0);
    drop(shell);
    let _ = std::fs::remove_dir_all(dir);
}
