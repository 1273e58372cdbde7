use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::host::MockShellHost;
use crate::messages::{WindowHandle, LM_THREAD_BANGCOMMAND};
use crate::shell::{Shell, ShellRequest};
use crate::watchdog::Heartbeat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent<M> {
    Thread(u32),
    Window(M),
}

pub trait MessagePump {
    type Message;

    fn next(&mut self) -> Option<LoopEvent<Self::Message>>;
    fn dispatch(&mut self, shell: &Shell, message: Self::Message);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub window_messages: u64,
    pub thread_messages: u64,
    pub completions: u64,
}

pub fn run_loop<P: MessagePump>(shell: &Shell, pump: &mut P, heartbeat: &Heartbeat) -> LoopStats {
    let mut stats = LoopStats::default();
    tracing::debug!("main loop started");

    while let Some(event) = pump.next() {
        let _beat = heartbeat.begin();
        match event {
            LoopEvent::Thread(LM_THREAD_BANGCOMMAND) => {
                stats.thread_messages += 1;
                stats.completions += shell.process_completions() as u64;
            }
            LoopEvent::Thread(id) => {
                stats.thread_messages += 1;
                tracing::debug!(id, "ignored thread message");
            }
            LoopEvent::Window(message) => {
                stats.window_messages += 1;
                pump.dispatch(shell, message);
            }
        }
    }

    tracing::debug!(
        window_messages = stats.window_messages,
        completions = stats.completions,
        "main loop ended"
    );
    stats
}

/// In-process pump over a [`MockShellHost`]: replays messages the shell posts
/// to its own window, turns host wake-ups into thread messages and feeds
/// scripted requests once the posted queue is empty. Ends when the shell asks
/// to quit or nothing is left.
pub struct ScriptedPump {
    host: Arc<MockShellHost>,
    main_window: WindowHandle,
    script: VecDeque<ShellRequest>,
    posted_cursor: usize,
    seen_wakes: usize,
    idle_wait: Duration,
}

impl ScriptedPump {
    pub fn new(host: Arc<MockShellHost>, main_window: WindowHandle) -> Self {
        let posted_cursor = host.posted().len();
        Self {
            host,
            main_window,
            script: VecDeque::new(),
            posted_cursor,
            seen_wakes: 0,
            idle_wait: Duration::ZERO,
        }
    }

    pub fn push(&mut self, request: ShellRequest) -> &mut Self {
        self.script.push_back(request);
        self
    }

    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    fn next_posted(&mut self) -> Option<ShellRequest> {
        let posted = self.host.posted();
        while let Some(message) = posted.get(self.posted_cursor) {
            self.posted_cursor += 1;
            if message.window == self.main_window {
                return Some(ShellRequest::from_raw(message.id, message.wparam, message.lparam));
            }
        }
        None
    }

    fn take_wake(&mut self) -> bool {
        if self.host.wakes() > self.seen_wakes {
            self.seen_wakes += 1;
            true
        } else {
            false
        }
    }
}

impl MessagePump for ScriptedPump {
    type Message = ShellRequest;

    fn next(&mut self) -> Option<LoopEvent<ShellRequest>> {
        if self.host.quit_requests() > 0 {
            return None;
        }
        if self.take_wake() {
            return Some(LoopEvent::Thread(LM_THREAD_BANGCOMMAND));
        }
        if let Some(request) = self.next_posted() {
            return Some(LoopEvent::Window(request));
        }
        if let Some(request) = self.script.pop_front() {
            return Some(LoopEvent::Window(request));
        }

        let deadline = Instant::now() + self.idle_wait;
        while Instant::now() < deadline {
            if self.take_wake() {
                return Some(LoopEvent::Thread(LM_THREAD_BANGCOMMAND));
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        None
    }

    fn dispatch(&mut self, shell: &Shell, message: ShellRequest) {
        shell.handle_message(message);
    }
}
