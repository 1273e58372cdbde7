use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HANG_THRESHOLD: Duration = Duration::from_secs(10);

pub trait RecoveryPolicy: Send {
    fn check(&mut self);
}

#[derive(Debug, Default)]
pub struct Heartbeat {
    busy: AtomicBool,
    beats: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(&self) -> BeatGuard<'_> {
        self.beats.fetch_add(1, Ordering::SeqCst);
        self.busy.store(true, Ordering::SeqCst);
        BeatGuard { heartbeat: self }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }
}

pub struct BeatGuard<'a> {
    heartbeat: &'a Heartbeat,
}

impl Drop for BeatGuard<'_> {
    fn drop(&mut self) {
        self.heartbeat.busy.store(false, Ordering::SeqCst);
    }
}

type HangAction = Box<dyn FnMut(Duration) + Send>;

pub struct HangDetector {
    heartbeat: Arc<Heartbeat>,
    threshold: Duration,
    on_hang: HangAction,
    watching: Option<(u64, Instant)>,
    reported: bool,
}

impl HangDetector {
    pub fn new(heartbeat: Arc<Heartbeat>, threshold: Duration, on_hang: impl FnMut(Duration) + Send + 'static) -> Self {
        Self {
            heartbeat,
            threshold,
            on_hang: Box::new(on_hang),
            watching: None,
            reported: false,
        }
    }

    pub fn logging(heartbeat: Arc<Heartbeat>) -> Self {
        Self::new(heartbeat, DEFAULT_HANG_THRESHOLD, |stalled| {
            tracing::error!(stalled_ms = stalled.as_millis() as u64, "main thread is not responding");
        })
    }
}

impl RecoveryPolicy for HangDetector {
    fn check(&mut self) {
        if !self.heartbeat.is_busy() {
            self.watching = None;
            self.reported = false;
            return;
        }

        let beat = self.heartbeat.beats();
        match self.watching {
            Some((seen, since)) if seen == beat => {
                let stalled = since.elapsed();
                if stalled >= self.threshold && !self.reported {
                    self.reported = true;
                    (self.on_hang)(stalled);
                }
            }
            _ => {
                self.watching = Some((beat, Instant::now()));
                self.reported = false;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Graceful,
    TimedOut,
}

pub struct RecoveryWatchdog;

impl RecoveryWatchdog {
    pub fn spawn(
        mut policy: Box<dyn RecoveryPolicy>,
        poll_interval: Duration,
    ) -> std::io::Result<WatchdogHandle> {
        let (quit_tx, quit_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let thread = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                loop {
                    match quit_rx.recv_timeout(poll_interval) {
                        Err(RecvTimeoutError::Timeout) => policy.check(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let _ = done_tx.send(());
            })?;

        tracing::debug!("watchdog started");
        Ok(WatchdogHandle {
            quit: quit_tx,
            done: done_rx,
            thread: Some(thread),
        })
    }
}

pub struct WatchdogHandle {
    quit: Sender<()>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Asks the watchdog to quit and waits up to `timeout`. A watchdog that
    /// does not answer is terminated where the platform allows it, otherwise
    /// left detached.
    pub fn shutdown(mut self, timeout: Duration) -> WatchdogExit {
        let _ = self.quit.try_send(());
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                tracing::info!("watchdog stopped");
                WatchdogExit::Graceful
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(thread) = self.thread.take() {
                    force_terminate(thread);
                }
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "watchdog did not stop in time");
                WatchdogExit::TimedOut
            }
        }
    }
}

#[cfg(target_os = "windows")]
fn force_terminate(thread: JoinHandle<()>) {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::System::Threading::TerminateThread;

    let ok = unsafe { TerminateThread(thread.as_raw_handle() as _, 1) };
    if ok == 0 {
        tracing::warn!("TerminateThread failed; watchdog left running");
    }
    drop(thread);
}

#[cfg(not(target_os = "windows"))]
fn force_terminate(thread: JoinHandle<()>) {
    tracing::warn!("forced thread termination unavailable; watchdog detached");
    drop(thread);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Stuck;

    impl RecoveryPolicy for Stuck {
        fn check(&mut self) {
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl RecoveryPolicy for Counting {
        fn check(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn responsive_watchdog_stops_gracefully() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = RecoveryWatchdog::spawn(Box::new(Counting(ticks.clone())), Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(handle.shutdown(SHUTDOWN_TIMEOUT), WatchdogExit::Graceful);
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn stuck_watchdog_does_not_block_exit() {
        let handle = RecoveryWatchdog::spawn(Box::new(Stuck), Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let exit = handle.shutdown(Duration::from_millis(100));

        assert_eq!(exit, WatchdogExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn hang_detector_fires_once_per_stall() {
        let heartbeat = Heartbeat::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut detector = HangDetector::new(heartbeat.clone(), Duration::ZERO, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            let _beat = heartbeat.begin();
            detector.check();
            detector.check();
            detector.check();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        detector.check();
        {
            let _beat = heartbeat.begin();
            detector.check();
            detector.check();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn idle_main_thread_never_counts_as_hung() {
        let heartbeat = Heartbeat::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut detector = HangDetector::new(heartbeat.clone(), Duration::ZERO, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(heartbeat.begin());
        for _ in 0..5 {
            detector.check();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
