use crate::messages::WindowHandle;

pub type HookCallback = usize;

pub trait HookManager {
    fn start(&mut self) -> bool;
    fn stop(&mut self);
    fn register(&mut self, window: WindowHandle, message: u32, callback: HookCallback) -> bool;
    fn unregister(&mut self, window: WindowHandle, message: u32, callback: HookCallback) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HookRegistration {
    window: WindowHandle,
    message: u32,
    callback: HookCallback,
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    running: bool,
    registrations: Vec<HookRegistration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HookManager for HookRegistry {
    fn start(&mut self) -> bool {
        if !self.running {
            tracing::debug!("hook subsystem started");
            self.running = true;
        }
        true
    }

    fn stop(&mut self) {
        if self.running {
            tracing::debug!(dropped = self.registrations.len(), "hook subsystem stopped");
        }
        self.running = false;
        self.registrations.clear();
    }

    fn register(&mut self, window: WindowHandle, message: u32, callback: HookCallback) -> bool {
        if !self.running {
            return false;
        }
        let registration = HookRegistration {
            window,
            message,
            callback,
        };
        if !self.registrations.contains(&registration) {
            self.registrations.push(registration);
        }
        true
    }

    fn unregister(&mut self, window: WindowHandle, message: u32, callback: HookCallback) -> usize {
        self.registrations
            .retain(|r| !(r.window == window && r.message == message && r.callback == callback));
        self.registrations.len()
    }
}
