use std::sync::Arc;
use std::time::Instant;

use crate::envelope::BangEnvelope;
use crate::host::MockShellHost;
use crate::messages::WindowHandle;
use crate::module_manager::MockModuleLoader;
use crate::shell::{Shell, ShellOptions, ShellParts, ShellRequest};
use crate::startup::{MockStartupScheduler, StartupMode};

fn p95_ms(samples: &mut [f64]) -> f64 {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let last = samples.len().saturating_sub(1);
    let idx = ((last as f64) * 0.95).round() as usize;
    samples[idx.min(last)]
}

fn running_shell() -> (Shell, std::path::PathBuf) {
    let unique = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("stepshell-perf-{unique}"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("step.rc"), "").unwrap();

    let host = Arc::new(MockShellHost::default());
    let parts = ShellParts::new(host)
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
    shell.start(WindowHandle(0x100));
    (shell, dir)
}

#[test]
fn broadcast_to_64_windows_p95_under_5ms() {
    let (shell, dir) = running_shell();
    for window in 0..64 {
        shell.handle_message(ShellRequest::RegisterMessages {
            window: WindowHandle(0x1000 + window),
            ids: vec![0x7000, 0x7001],
        });
    }

    let mut samples = Vec::with_capacity(200);
    for i in 0..200 {
        let start = Instant::now();
        shell.handle_message(ShellRequest::Other {
            id: 0x7000 + (i % 2),
            wparam: i as usize,
            lparam: 0,
        });
        samples.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let p95 = p95_ms(&mut samples);
    assert!(p95 < 5.0, "broadcast p95 was {p95:.3}ms");
    drop(shell);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn inline_bang_dispatch_p95_under_2ms() {
    let (shell, dir) = running_shell();
    shell
        .register_bang("!Noop", |_: &crate::bang::BangContext<'_>, _: &str| {}, false)
        .unwrap();
    let bytes = BangEnvelope::new(WindowHandle::NULL, "!noop", "a b c").encode();

    let mut samples = Vec::with_capacity(500);
    for _ in 0..500 {
        let start = Instant::now();
        shell.handle_message(ShellRequest::BangCommand(bytes.clone()));
        samples.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let p95 = p95_ms(&mut samples);
    assert!(p95 < 2.0, "bang dispatch p95 was {p95:.3}ms");
    assert_eq!(shell.faults(), 0);
    drop(shell);
    let _ = std::fs::remove_dir_all(dir);
}
