use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("{action} failed with code {status}")]
    Registry { action: &'static str, status: u32 },
    #[error("failed to launch '{item}': {message}")]
    Launch { item: String, message: String },
    #[error("unsupported platform")]
    UnsupportedPlatform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupMode {
    DontRun,
    #[default]
    Default,
    ForceRun,
}

pub fn startup_allowed(mode: StartupMode, no_startup: bool, shift_down: bool) -> bool {
    if shift_down {
        return false;
    }
    match mode {
        StartupMode::DontRun => false,
        StartupMode::ForceRun => true,
        StartupMode::Default => !no_startup,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    MachineRun,
    UserRun,
    MachineRunOnce,
    UserRunOnce,
    StartupFolder,
}

impl ItemOrigin {
    pub fn is_run_once(self) -> bool {
        matches!(self, Self::MachineRunOnce | Self::UserRunOnce)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupItem {
    pub origin: ItemOrigin,
    pub name: String,
    pub command: String,
}

pub trait StartupEnvironment: Send {
    /// Marks this logon session as served. False when an earlier run already
    /// did.
    fn claim_session(&mut self) -> bool;
    fn registry_items(&mut self) -> Vec<StartupItem>;
    fn startup_folders(&self) -> Vec<PathBuf>;
    fn launch(&mut self, item: &StartupItem) -> Result<(), StartupError>;
    fn forget_run_once(&mut self, item: &StartupItem) -> Result<(), StartupError>;
}

pub fn folder_items(dir: &Path) -> Vec<StartupItem> {
    let mut items: Vec<StartupItem> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !entry.file_name().eq_ignore_ascii_case("desktop.ini"))
        .map(|entry| StartupItem {
            origin: ItemOrigin::StartupFolder,
            name: entry.file_name().to_string_lossy().into_owned(),
            command: format!("\"{}\"", entry.path().display()),
        })
        .collect();
    items.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    items
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub launched: usize,
    pub failed: usize,
    pub already_ran: bool,
}

pub struct StartupRunner {
    env: Box<dyn StartupEnvironment>,
}

impl StartupRunner {
    pub fn new(env: Box<dyn StartupEnvironment>) -> Self {
        Self { env }
    }

    pub fn run(&mut self, mode: StartupMode) -> StartupReport {
        let mut report = StartupReport::default();
        let first = self.env.claim_session();
        if mode != StartupMode::ForceRun && !first {
            tracing::info!("startup items already ran this session");
            report.already_ran = true;
            return report;
        }

        let mut items = self.env.registry_items();
        for folder in self.env.startup_folders() {
            items.extend(folder_items(&folder));
        }

        for item in &items {
            match self.env.launch(item) {
                Ok(()) => {
                    report.launched += 1;
                    tracing::info!(name = %item.name, origin = ?item.origin, "startup item launched");
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(name = %item.name, %error, "startup item failed");
                }
            }
            if item.origin.is_run_once() {
                if let Err(error) = self.env.forget_run_once(item) {
                    tracing::warn!(name = %item.name, %error, "could not remove RunOnce value");
                }
            }
        }
        report
    }
}

pub trait StartupScheduler {
    fn schedule(&mut self, mode: StartupMode) -> bool;
}

type EnvironmentFactory = Box<dyn Fn() -> Box<dyn StartupEnvironment> + Send>;

pub struct ThreadedStartup {
    factory: EnvironmentFactory,
    last: Option<JoinHandle<StartupReport>>,
}

impl ThreadedStartup {
    pub fn new(factory: impl Fn() -> Box<dyn StartupEnvironment> + Send + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            last: None,
        }
    }

    pub fn join_last(&mut self) -> Option<StartupReport> {
        self.last.take().and_then(|handle| handle.join().ok())
    }
}

impl StartupScheduler for ThreadedStartup {
    fn schedule(&mut self, mode: StartupMode) -> bool {
        let env = (self.factory)();
        let spawned = std::thread::Builder::new()
            .name("startup".to_string())
            .spawn(move || StartupRunner::new(env).run(mode));
        match spawned {
            Ok(handle) => {
                self.last = Some(handle);
                true
            }
            Err(error) => {
                tracing::warn!(%error, "failed to spawn startup thread");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockStartupScheduler {
    requests: Arc<Mutex<Vec<StartupMode>>>,
}

impl MockStartupScheduler {
    pub fn requests(&self) -> Vec<StartupMode> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StartupScheduler for MockStartupScheduler {
    fn schedule(&mut self, mode: StartupMode) -> bool {
        match self.requests.lock() {
            Ok(mut guard) => guard.push(mode),
            Err(poisoned) => poisoned.into_inner().push(mode),
        }
        true
    }
}

pub fn default_scheduler() -> Box<dyn StartupScheduler> {
    Box::new(ThreadedStartup::new(default_environment))
}

pub fn default_environment() -> Box<dyn StartupEnvironment> {
    #[cfg(target_os = "windows")]
    {
        Box::new(windows_env::WindowsStartupEnvironment)
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(UnsupportedEnvironment)
    }
}

#[cfg(not(target_os = "windows"))]
struct UnsupportedEnvironment;

#[cfg(not(target_os = "windows"))]
impl StartupEnvironment for UnsupportedEnvironment {
    fn claim_session(&mut self) -> bool {
        false
    }

    fn registry_items(&mut self) -> Vec<StartupItem> {
        Vec::new()
    }

    fn startup_folders(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn launch(&mut self, _item: &StartupItem) -> Result<(), StartupError> {
        Err(StartupError::UnsupportedPlatform)
    }

    fn forget_run_once(&mut self, _item: &StartupItem) -> Result<(), StartupError> {
        Err(StartupError::UnsupportedPlatform)
    }
}

#[cfg(target_os = "windows")]
mod windows_env {
    use super::{ItemOrigin, StartupEnvironment, StartupError, StartupItem};
    use std::path::PathBuf;
    use windows_sys::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
    use windows_sys::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegEnumValueW, RegOpenKeyExW, HKEY,
        HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_READ, KEY_SET_VALUE,
        REG_CREATED_NEW_KEY, REG_EXPAND_SZ, REG_OPTION_VOLATILE, REG_SZ,
    };

    const RUN_SUBKEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";
    const RUN_ONCE_SUBKEY: &str = r"Software\Microsoft\Windows\CurrentVersion\RunOnce";
    const SESSION_MARKER_SUBKEY: &str = r"Software\StepShell\Session\StartupRan";
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    pub struct WindowsStartupEnvironment;

    impl StartupEnvironment for WindowsStartupEnvironment {
        fn claim_session(&mut self) -> bool {
            let subkey = to_wide(SESSION_MARKER_SUBKEY);
            let mut key: HKEY = std::ptr::null_mut();
            let mut disposition = 0_u32;
            let status = unsafe {
                RegCreateKeyExW(
                    HKEY_CURRENT_USER,
                    subkey.as_ptr(),
                    0,
                    std::ptr::null(),
                    REG_OPTION_VOLATILE,
                    KEY_QUERY_VALUE,
                    std::ptr::null(),
                    &mut key,
                    &mut disposition,
                )
            };
            if status != ERROR_SUCCESS {
                tracing::warn!(status, "session marker unavailable; treating as first run");
                return true;
            }
            unsafe {
                RegCloseKey(key);
            }
            disposition == REG_CREATED_NEW_KEY
        }

        fn registry_items(&mut self) -> Vec<StartupItem> {
            let sources = [
                (HKEY_LOCAL_MACHINE, RUN_SUBKEY, ItemOrigin::MachineRun),
                (HKEY_CURRENT_USER, RUN_SUBKEY, ItemOrigin::UserRun),
                (HKEY_LOCAL_MACHINE, RUN_ONCE_SUBKEY, ItemOrigin::MachineRunOnce),
                (HKEY_CURRENT_USER, RUN_ONCE_SUBKEY, ItemOrigin::UserRunOnce),
            ];
            let mut items = Vec::new();
            for (root, subkey, origin) in sources {
                match read_string_values(root, subkey) {
                    Ok(values) => items.extend(values.into_iter().map(|(name, command)| {
                        StartupItem {
                            origin,
                            name,
                            command,
                        }
                    })),
                    Err(error) => tracing::debug!(%error, subkey, "run key skipped"),
                }
            }
            items
        }

        fn startup_folders(&self) -> Vec<PathBuf> {
            let mut folders = Vec::new();
            if let Some(data) = std::env::var_os("ProgramData") {
                folders.push(
                    PathBuf::from(data).join(r"Microsoft\Windows\Start Menu\Programs\StartUp"),
                );
            }
            if let Some(appdata) = std::env::var_os("APPDATA") {
                folders.push(
                    PathBuf::from(appdata).join(r"Microsoft\Windows\Start Menu\Programs\Startup"),
                );
            }
            folders
        }

        fn launch(&mut self, item: &StartupItem) -> Result<(), StartupError> {
            use std::os::windows::process::CommandExt;

            std::process::Command::new("cmd")
                .raw_arg(format!("/C start \"\" {}", item.command))
                .creation_flags(CREATE_NO_WINDOW)
                .spawn()
                .map(|_| ())
                .map_err(|error| StartupError::Launch {
                    item: item.name.clone(),
                    message: error.to_string(),
                })
        }

        fn forget_run_once(&mut self, item: &StartupItem) -> Result<(), StartupError> {
            let root = match item.origin {
                ItemOrigin::MachineRunOnce => HKEY_LOCAL_MACHINE,
                ItemOrigin::UserRunOnce => HKEY_CURRENT_USER,
                _ => return Ok(()),
            };
            let subkey = to_wide(RUN_ONCE_SUBKEY);
            let mut key: HKEY = std::ptr::null_mut();
            let status = unsafe { RegOpenKeyExW(root, subkey.as_ptr(), 0, KEY_SET_VALUE, &mut key) };
            if status != ERROR_SUCCESS {
                return Err(StartupError::Registry {
                    action: "open RunOnce key",
                    status,
                });
            }
            let name = to_wide(&item.name);
            let status = unsafe { RegDeleteValueW(key, name.as_ptr()) };
            unsafe {
                RegCloseKey(key);
            }
            if status == ERROR_SUCCESS || status == ERROR_FILE_NOT_FOUND {
                return Ok(());
            }
            Err(StartupError::Registry {
                action: "delete RunOnce value",
                status,
            })
        }
    }

    fn read_string_values(root: HKEY, subkey: &str) -> Result<Vec<(String, String)>, StartupError> {
        let subkey_wide = to_wide(subkey);
        let mut key: HKEY = std::ptr::null_mut();
        let status = unsafe { RegOpenKeyExW(root, subkey_wide.as_ptr(), 0, KEY_READ, &mut key) };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(Vec::new());
        }
        if status != ERROR_SUCCESS {
            return Err(StartupError::Registry {
                action: "open run key",
                status,
            });
        }

        let mut values = Vec::new();
        let mut index = 0_u32;
        loop {
            let mut name = [0_u16; 256];
            let mut name_len = name.len() as u32;
            let mut data = [0_u16; 2048];
            let mut data_bytes = (data.len() * 2) as u32;
            let mut value_type = 0_u32;
            let status = unsafe {
                RegEnumValueW(
                    key,
                    index,
                    name.as_mut_ptr(),
                    &mut name_len,
                    std::ptr::null(),
                    &mut value_type,
                    data.as_mut_ptr() as *mut u8,
                    &mut data_bytes,
                )
            };
            if status == ERROR_NO_MORE_ITEMS {
                break;
            }
            index += 1;
            if status != ERROR_SUCCESS {
                continue;
            }
            if value_type != REG_SZ && value_type != REG_EXPAND_SZ {
                continue;
            }

            let units = (data_bytes as usize / 2).min(data.len());
            let command = String::from_utf16_lossy(&data[..units])
                .trim_end_matches('\0')
                .trim()
                .to_string();
            if command.is_empty() {
                continue;
            }
            let name = String::from_utf16_lossy(&name[..name_len as usize]);
            values.push((name, command));
        }
        unsafe {
            RegCloseKey(key);
        }
        Ok(values)
    }

    fn to_wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }
}
