use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::messages::WindowHandle;

pub trait ShellHost: Send + Sync {
    fn post_message(&self, window: WindowHandle, id: u32, wparam: usize, lparam: isize) -> bool;
    fn send_message(&self, window: WindowHandle, id: u32, wparam: usize, lparam: isize) -> isize;
    fn is_window(&self, window: WindowHandle) -> bool;
    fn find_window(&self, class: &str, title: Option<&str>) -> Option<WindowHandle>;
    fn desktop_window(&self) -> WindowHandle;
    /// Makes minimized windows hide instead of docking. Idempotent.
    fn hide_minimized_windows(&self) -> bool;

    fn wake_main_thread(&self);
    fn post_quit(&self);
    fn log_off(&self) -> bool;
    fn register_window_message(&self, name: &str) -> u32;
    /// Sends a zero-terminated string by pointer in lParam.
    fn send_text(&self, window: WindowHandle, id: u32, wparam: usize, text: &str) -> isize;
    /// Hides or re-shows the top-level windows modules created on the shell
    /// thread, leaving `main_window` alone.
    fn set_module_windows_visible(&self, main_window: WindowHandle, visible: bool);

    fn confirm(&self, title: &str, text: &str) -> bool;
    fn notify(&self, title: &str, text: &str);
    fn is_shift_down(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellHookAction {
    Register,
    Unregister,
}

/// Optional OS entry points, probed once at startup. A missing entry is a
/// normal state and the dependent feature is skipped.
#[derive(Default)]
pub struct Capabilities {
    pub shell_hook: Option<Box<dyn Fn(WindowHandle, ShellHookAction) -> bool>>,
    pub shell_hook_message: Option<u32>,
    pub set_shell_window: Option<Box<dyn Fn(WindowHandle) -> bool>>,
    pub shutdown_dialog: Option<Box<dyn Fn(WindowHandle)>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("shell_hook", &self.shell_hook.is_some())
            .field("shell_hook_message", &self.shell_hook_message)
            .field("set_shell_window", &self.set_shell_window.is_some())
            .field("shutdown_dialog", &self.shutdown_dialog.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedMessage {
    pub window: WindowHandle,
    pub id: u32,
    pub wparam: usize,
    pub lparam: isize,
}

#[derive(Default)]
struct MockHostState {
    posted: Vec<PostedMessage>,
    sent: Vec<PostedMessage>,
    replies: HashMap<WindowHandle, isize>,
    dead_windows: HashSet<WindowHandle>,
    named_windows: HashMap<String, WindowHandle>,
    prompts: Vec<String>,
    notices: Vec<String>,
    confirm_answer: bool,
    shift_down: bool,
    log_off_result: bool,
    quit_requests: usize,
    wakes: usize,
    texts: Vec<(WindowHandle, u32, String)>,
    modules_visible: Option<bool>,
    visibility_changes: usize,
    registered_messages: Vec<String>,
    minimize_tuned: usize,
}

pub const MOCK_DESKTOP_WINDOW: WindowHandle = WindowHandle(0x0001_0010);

pub struct MockShellHost {
    state: Mutex<MockHostState>,
}

impl Default for MockShellHost {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockHostState {
                confirm_answer: true,
                log_off_result: true,
                ..MockHostState::default()
            }),
        }
    }
}

impl MockShellHost {
    fn with_state<R>(&self, f: impl FnOnce(&mut MockHostState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn posted(&self) -> Vec<PostedMessage> {
        self.with_state(|s| s.posted.clone())
    }

    pub fn take_posted(&self) -> Vec<PostedMessage> {
        self.with_state(|s| std::mem::take(&mut s.posted))
    }

    pub fn sent(&self) -> Vec<PostedMessage> {
        self.with_state(|s| s.sent.clone())
    }

    pub fn set_reply(&self, window: WindowHandle, value: isize) {
        self.with_state(|s| {
            s.replies.insert(window, value);
        });
    }

    pub fn destroy_window(&self, window: WindowHandle) {
        self.with_state(|s| {
            s.dead_windows.insert(window);
        });
    }

    pub fn add_named_window(&self, class: &str, window: WindowHandle) {
        self.with_state(|s| {
            s.named_windows.insert(class.to_string(), window);
        });
    }

    pub fn set_confirm_answer(&self, answer: bool) {
        self.with_state(|s| s.confirm_answer = answer);
    }

    pub fn set_shift_down(&self, down: bool) {
        self.with_state(|s| s.shift_down = down);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.with_state(|s| s.prompts.clone())
    }

    pub fn notices(&self) -> Vec<String> {
        self.with_state(|s| s.notices.clone())
    }

    pub fn quit_requests(&self) -> usize {
        self.with_state(|s| s.quit_requests)
    }

    pub fn wakes(&self) -> usize {
        self.with_state(|s| s.wakes)
    }

    pub fn texts(&self) -> Vec<(WindowHandle, u32, String)> {
        self.with_state(|s| s.texts.clone())
    }

    pub fn minimize_tuned(&self) -> usize {
        self.with_state(|s| s.minimize_tuned)
    }

    pub fn modules_visible(&self) -> Option<bool> {
        self.with_state(|s| s.modules_visible)
    }

    pub fn visibility_changes(&self) -> usize {
        self.with_state(|s| s.visibility_changes)
    }
}

impl ShellHost for MockShellHost {
    fn post_message(&self, window: WindowHandle, id: u32, wparam: usize, lparam: isize) -> bool {
        self.with_state(|s| {
            s.posted.push(PostedMessage {
                window,
                id,
                wparam,
                lparam,
            });
        });
        true
    }

    fn send_message(&self, window: WindowHandle, id: u32, wparam: usize, lparam: isize) -> isize {
        self.with_state(|s| {
            s.sent.push(PostedMessage {
                window,
                id,
                wparam,
                lparam,
            });
            s.replies.get(&window).copied().unwrap_or(0)
        })
    }

    fn is_window(&self, window: WindowHandle) -> bool {
        !window.is_null() && self.with_state(|s| !s.dead_windows.contains(&window))
    }

    fn find_window(&self, class: &str, _title: Option<&str>) -> Option<WindowHandle> {
        self.with_state(|s| s.named_windows.get(class).copied())
    }

    fn desktop_window(&self) -> WindowHandle {
        MOCK_DESKTOP_WINDOW
    }

    fn hide_minimized_windows(&self) -> bool {
        self.with_state(|s| s.minimize_tuned += 1);
        true
    }

    fn wake_main_thread(&self) {
        self.with_state(|s| s.wakes += 1);
    }

    fn post_quit(&self) {
        self.with_state(|s| s.quit_requests += 1);
    }

    fn log_off(&self) -> bool {
        self.with_state(|s| s.log_off_result)
    }

    fn register_window_message(&self, name: &str) -> u32 {
        self.with_state(|s| {
            let index = match s.registered_messages.iter().position(|m| m == name) {
                Some(index) => index,
                None => {
                    s.registered_messages.push(name.to_string());
                    s.registered_messages.len() - 1
                }
            };
            0xC000 + index as u32
        })
    }

    fn send_text(&self, window: WindowHandle, id: u32, _wparam: usize, text: &str) -> isize {
        self.with_state(|s| {
            s.texts.push((window, id, text.to_string()));
            s.replies.get(&window).copied().unwrap_or(0)
        })
    }

    fn set_module_windows_visible(&self, _main_window: WindowHandle, visible: bool) {
        self.with_state(|s| {
            s.modules_visible = Some(visible);
            s.visibility_changes += 1;
        });
    }

    fn confirm(&self, _title: &str, text: &str) -> bool {
        self.with_state(|s| {
            s.prompts.push(text.to_string());
            s.confirm_answer
        })
    }

    fn notify(&self, _title: &str, text: &str) {
        self.with_state(|s| s.notices.push(text.to_string()));
    }

    fn is_shift_down(&self) -> bool {
        self.with_state(|s| s.shift_down)
    }
}

#[cfg(not(target_os = "windows"))]
#[derive(Debug, Default)]
pub struct NoopShellHost;

#[cfg(not(target_os = "windows"))]
impl ShellHost for NoopShellHost {
    fn post_message(&self, _window: WindowHandle, _id: u32, _wparam: usize, _lparam: isize) -> bool {
        false
    }

    fn send_message(&self, _window: WindowHandle, _id: u32, _wparam: usize, _lparam: isize) -> isize {
        0
    }

    fn is_window(&self, _window: WindowHandle) -> bool {
        false
    }

    fn find_window(&self, _class: &str, _title: Option<&str>) -> Option<WindowHandle> {
        None
    }

    fn desktop_window(&self) -> WindowHandle {
        WindowHandle::NULL
    }

    fn hide_minimized_windows(&self) -> bool {
        false
    }

    fn wake_main_thread(&self) {}

    fn post_quit(&self) {}

    fn log_off(&self) -> bool {
        false
    }

    fn register_window_message(&self, _name: &str) -> u32 {
        0
    }

    fn send_text(&self, _window: WindowHandle, _id: u32, _wparam: usize, _text: &str) -> isize {
        0
    }

    fn set_module_windows_visible(&self, _main_window: WindowHandle, _visible: bool) {}

    fn confirm(&self, title: &str, text: &str) -> bool {
        eprintln!("[stepshell] {title}: {text} (assuming yes)");
        true
    }

    fn notify(&self, title: &str, text: &str) {
        eprintln!("[stepshell] {title}: {text}");
    }

    fn is_shift_down(&self) -> bool {
        false
    }
}

pub fn default_shell_host() -> std::sync::Arc<dyn ShellHost> {
    #[cfg(target_os = "windows")]
    {
        std::sync::Arc::new(crate::windows_shell::WindowsShellHost::for_current_thread())
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::sync::Arc::new(NoopShellHost)
    }
}
