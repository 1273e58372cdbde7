use crate::envelope::BangEnvelope;
use crate::messages::{WindowHandle, LM_BANGCOMMAND};

pub const INSTANCE_MUTEX_NAME: &str = "StepShell";

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("failed to create instance mutex: error {0}")]
    Mutex(u32),
}

pub trait CopyDataSink {
    fn copy_data(&self, tag: usize, payload: &[u8]) -> bool;
}

pub fn forward_bang(sink: &dyn CopyDataSink, command: &str, args: &str) -> bool {
    let envelope = BangEnvelope::new(WindowHandle::NULL, command, args);
    let delivered = sink.copy_data(LM_BANGCOMMAND as usize, &envelope.encode());
    if delivered {
        tracing::info!(command, "forwarded bang to running instance");
    } else {
        tracing::info!(command, "no running instance received the bang");
    }
    delivered
}

pub struct InstanceToken {
    name: String,
    already_existed: bool,
    #[cfg(target_os = "windows")]
    handle: windows_sys::Win32::Foundation::HANDLE,
}

impl InstanceToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn already_existed(&self) -> bool {
        self.already_existed
    }
}

#[cfg(target_os = "windows")]
impl InstanceToken {
    pub fn acquire(name: &str) -> Result<Self, InstanceError> {
        use windows_sys::Win32::Foundation::{GetLastError, ERROR_ALREADY_EXISTS};
        use windows_sys::Win32::System::Threading::CreateMutexW;

        let wide = crate::windows_shell::to_wide(name);
        let handle = unsafe { CreateMutexW(std::ptr::null(), 0, wide.as_ptr()) };
        if handle.is_null() {
            return Err(InstanceError::Mutex(unsafe { GetLastError() }));
        }
        let already_existed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        Ok(Self {
            name: name.to_string(),
            already_existed,
            handle,
        })
    }
}

#[cfg(target_os = "windows")]
impl Drop for InstanceToken {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.handle);
        }
    }
}

// Off Windows the token is process-local, which is enough for the
// single-process test harness.
#[cfg(not(target_os = "windows"))]
fn held_tokens() -> std::sync::MutexGuard<'static, std::collections::HashMap<String, usize>> {
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    static HELD: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    let held = HELD.get_or_init(|| Mutex::new(HashMap::new()));
    match held.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(not(target_os = "windows"))]
impl InstanceToken {
    pub fn acquire(name: &str) -> Result<Self, InstanceError> {
        let mut held = held_tokens();
        let count = held.entry(name.to_string()).or_insert(0);
        let already_existed = *count > 0;
        *count += 1;
        Ok(Self {
            name: name.to_string(),
            already_existed,
        })
    }
}

#[cfg(not(target_os = "windows"))]
impl Drop for InstanceToken {
    fn drop(&mut self) {
        let mut held = held_tokens();
        if let Some(count) = held.get_mut(&self.name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                held.remove(&self.name);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NoInstance;

impl CopyDataSink for NoInstance {
    fn copy_data(&self, _tag: usize, _payload: &[u8]) -> bool {
        false
    }
}
