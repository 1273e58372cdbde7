use std::collections::HashSet;
use std::ffi::{c_char, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::messages::{LoadFlags, ModuleHandle, WindowHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("module not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to load module '{}': {message}", path.display())]
    Load { path: PathBuf, message: String },
    #[error("module '{}' does not export {symbol}", path.display())]
    EntryPointMissing { path: PathBuf, symbol: &'static str },
    #[error("module '{}' failed to initialize (code {code})", path.display())]
    InitFailed { path: PathBuf, code: i32 },
    #[error("module path is not representable: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("no module loaded with handle {0:?}")]
    UnknownHandle(ModuleHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHostInfo {
    pub main_window: WindowHandle,
    pub app_path: PathBuf,
}

pub trait ModuleLoader {
    fn load(
        &mut self,
        path: &Path,
        flags: LoadFlags,
        host: &ModuleHostInfo,
    ) -> Result<Box<dyn LoadedModule>, ModuleError>;
}

pub trait LoadedModule {
    fn handle(&self) -> ModuleHandle;
    fn quit(self: Box<Self>);
}

pub struct ModuleRecord {
    path: PathBuf,
    key: String,
    flags: LoadFlags,
    module: Box<dyn LoadedModule>,
}

impl ModuleRecord {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> ModuleHandle {
        self.module.handle()
    }

    pub fn flags(&self) -> LoadFlags {
        self.flags
    }
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("path", &self.path)
            .field("handle", &self.handle())
            .field("flags", &self.flags)
            .finish()
    }
}

pub fn normalize_module_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim().trim_matches('"');
    trimmed
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

pub struct ModuleManager {
    loader: Box<dyn ModuleLoader>,
    host: ModuleHostInfo,
    records: Vec<ModuleRecord>,
}

impl ModuleManager {
    pub fn new(loader: Box<dyn ModuleLoader>, host: ModuleHostInfo) -> Self {
        Self {
            loader,
            host,
            records: Vec::new(),
        }
    }

    pub fn set_host(&mut self, host: ModuleHostInfo) {
        self.host = host;
    }

    pub fn start(&mut self, modules: &[(PathBuf, LoadFlags)]) -> usize {
        let mut loaded = 0;
        for (path, flags) in modules {
            match self.load_module(path, *flags) {
                Ok(_) => loaded += 1,
                Err(error) => tracing::warn!(%error, "module skipped"),
            }
        }
        tracing::info!(loaded, configured = modules.len(), "modules started");
        loaded
    }

    pub fn stop(&mut self) {
        while let Some(record) = self.records.pop() {
            tracing::info!(path = %record.path.display(), "quitting module");
            record.module.quit();
        }
    }

    pub fn load_module(&mut self, path: &Path, flags: LoadFlags) -> Result<ModuleHandle, ModuleError> {
        let key = normalize_module_path(path);
        if let Some(existing) = self.records.iter().find(|r| r.key == key) {
            tracing::debug!(path = %path.display(), "module already loaded");
            return Ok(existing.handle());
        }

        let module = self.loader.load(path, flags, &self.host)?;
        let handle = module.handle();
        tracing::info!(
            path = %path.display(),
            handle = handle.0,
            threaded = flags.contains(LoadFlags::THREADED),
            "module loaded"
        );
        self.records.push(ModuleRecord {
            path: path.to_path_buf(),
            key,
            flags,
            module,
        });
        Ok(handle)
    }

    /// Unloads then loads the module again with the same path and flags. The
    /// old record is gone even when the load step fails.
    pub fn reload_module(&mut self, handle: ModuleHandle) -> Result<ModuleHandle, ModuleError> {
        let record = self
            .take_record(handle)
            .ok_or(ModuleError::UnknownHandle(handle))?;
        let path = record.path.clone();
        let flags = record.flags;
        record.module.quit();
        self.load_module(&path, flags)
    }

    pub fn quit_module(&mut self, handle: ModuleHandle) -> bool {
        match self.take_record(handle) {
            Some(record) => {
                tracing::info!(path = %record.path.display(), "module unloaded");
                record.module.quit();
                true
            }
            None => false,
        }
    }

    pub fn get_module_instance(&self, path: &Path) -> Option<ModuleHandle> {
        let key = normalize_module_path(path);
        self.records
            .iter()
            .find(|record| record.key == key)
            .map(ModuleRecord::handle)
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.records
    }

    fn take_record(&mut self, handle: ModuleHandle) -> Option<ModuleRecord> {
        let index = self.records.iter().position(|r| r.handle() == handle)?;
        Some(self.records.remove(index))
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

type InitModuleFn =
    unsafe extern "C" fn(parent: isize, instance: usize, app_path: *const c_char) -> i32;
type QuitModuleFn = unsafe extern "C" fn(instance: usize);

const INIT_SYMBOL: &str = "initModuleEx";
const QUIT_SYMBOL: &str = "quitModule";

#[cfg(unix)]
use libloading::os::unix::Library as OsLibrary;
#[cfg(windows)]
use libloading::os::windows::Library as OsLibrary;

#[derive(Debug, Default)]
pub struct DynamicModuleLoader;

struct DynamicModule {
    // Dropped after `quit` runs.
    _library: OsLibrary,
    quit: QuitModuleFn,
    handle: ModuleHandle,
}

impl LoadedModule for DynamicModule {
    fn handle(&self) -> ModuleHandle {
        self.handle
    }

    fn quit(self: Box<Self>) {
        unsafe { (self.quit)(self.handle.0) };
    }
}

impl ModuleLoader for DynamicModuleLoader {
    fn load(
        &mut self,
        path: &Path,
        _flags: LoadFlags,
        host: &ModuleHostInfo,
    ) -> Result<Box<dyn LoadedModule>, ModuleError> {
        if !path.is_file() {
            return Err(ModuleError::NotFound(path.to_path_buf()));
        }

        let library = unsafe { OsLibrary::new(path) }.map_err(|error| ModuleError::Load {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;
        let raw = library.into_raw();
        let handle = ModuleHandle(raw as usize);
        let library = unsafe { OsLibrary::from_raw(raw) };

        let init = unsafe { library.get::<InitModuleFn>(b"initModuleEx\0") }
            .map(|symbol| *symbol)
            .map_err(|_| ModuleError::EntryPointMissing {
                path: path.to_path_buf(),
                symbol: INIT_SYMBOL,
            })?;
        let quit = unsafe { library.get::<QuitModuleFn>(b"quitModule\0") }
            .map(|symbol| *symbol)
            .map_err(|_| ModuleError::EntryPointMissing {
                path: path.to_path_buf(),
                symbol: QUIT_SYMBOL,
            })?;

        let app_path = CString::new(host.app_path.to_string_lossy().as_bytes())
            .map_err(|_| ModuleError::InvalidPath(host.app_path.clone()))?;
        let code = unsafe { init(host.main_window.0, handle.0, app_path.as_ptr()) };
        if code != 0 {
            return Err(ModuleError::InitFailed {
                path: path.to_path_buf(),
                code,
            });
        }

        Ok(Box::new(DynamicModule {
            _library: library,
            quit,
            handle,
        }))
    }
}

#[derive(Debug, Default)]
struct MockLoaderState {
    next_handle: usize,
    failing: HashSet<String>,
    loads: Vec<PathBuf>,
    quits: Vec<ModuleHandle>,
    live: HashSet<ModuleHandle>,
}

/// Scripted loader for tests. Clones share state so a test can keep one copy
/// while the manager owns another.
#[derive(Debug, Clone, Default)]
pub struct MockModuleLoader {
    state: Arc<Mutex<MockLoaderState>>,
}

impl MockModuleLoader {
    fn with_state<R>(&self, f: impl FnOnce(&mut MockLoaderState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn fail_path(&self, path: &Path) {
        let key = normalize_module_path(path);
        self.with_state(|s| {
            s.failing.insert(key);
        });
    }

    pub fn allow_path(&self, path: &Path) {
        let key = normalize_module_path(path);
        self.with_state(|s| {
            s.failing.remove(&key);
        });
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.with_state(|s| s.loads.clone())
    }

    pub fn quits(&self) -> Vec<ModuleHandle> {
        self.with_state(|s| s.quits.clone())
    }

    pub fn live_modules(&self) -> usize {
        self.with_state(|s| s.live.len())
    }
}

struct MockModule {
    handle: ModuleHandle,
    state: Arc<Mutex<MockLoaderState>>,
}

impl LoadedModule for MockModule {
    fn handle(&self) -> ModuleHandle {
        self.handle
    }

    fn quit(self: Box<Self>) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.quits.push(self.handle);
        guard.live.remove(&self.handle);
    }
}

impl ModuleLoader for MockModuleLoader {
    fn load(
        &mut self,
        path: &Path,
        _flags: LoadFlags,
        _host: &ModuleHostInfo,
    ) -> Result<Box<dyn LoadedModule>, ModuleError> {
        let key = normalize_module_path(path);
        let state = Arc::clone(&self.state);
        self.with_state(|s| {
            s.loads.push(path.to_path_buf());
            if s.failing.contains(&key) {
                return Err(ModuleError::InitFailed {
                    path: path.to_path_buf(),
                    code: 1,
                });
            }
            s.next_handle += 1;
            let handle = ModuleHandle(0x1000 + s.next_handle);
            s.live.insert(handle);
            Ok(Box::new(MockModule { handle, state }) as Box<dyn LoadedModule>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ModuleManager, MockModuleLoader) {
        let loader = MockModuleLoader::default();
        let host = ModuleHostInfo {
            main_window: WindowHandle(1),
            app_path: PathBuf::from("C:/ls"),
        };
        (ModuleManager::new(Box::new(loader.clone()), host), loader)
    }

    #[test]
    fn normalized_paths_ignore_case_and_separators() {
        assert_eq!(
            normalize_module_path(Path::new("C:\\LS\\Label.DLL")),
            normalize_module_path(Path::new("c:/ls/label.dll"))
        );
    }

    #[test]
    fn loading_same_path_twice_keeps_one_record() {
        let (mut manager, loader) = manager();
        let first = manager.load_module(Path::new("C:/ls/label.dll"), LoadFlags::NONE).unwrap();
        let second = manager.load_module(Path::new("c:\\LS\\label.dll"), LoadFlags::NONE).unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.records().len(), 1);
        assert_eq!(loader.loads().len(), 1);
    }

    #[test]
    fn quit_module_forgets_path() {
        let (mut manager, loader) = manager();
        let path = Path::new("C:/ls/label.dll");
        let handle = manager.load_module(path, LoadFlags::NONE).unwrap();

        assert!(manager.quit_module(handle));
        assert_eq!(manager.get_module_instance(path), None);
        assert_eq!(loader.quits(), vec![handle]);
        assert!(!manager.quit_module(handle));
    }

    #[test]
    fn reload_replaces_record_and_keeps_flags() {
        let (mut manager, loader) = manager();
        let path = Path::new("C:/ls/label.dll");
        let old = manager.load_module(path, LoadFlags::THREADED).unwrap();

        let new = manager.reload_module(old).unwrap();

        assert_ne!(old, new);
        assert_eq!(manager.records().len(), 1);
        assert_eq!(manager.records()[0].flags(), LoadFlags::THREADED);
        assert_eq!(manager.get_module_instance(path), Some(new));
        assert_eq!(loader.live_modules(), 1);
    }

    #[test]
    fn failed_reload_leaves_no_stale_record() {
        let (mut manager, loader) = manager();
        let path = Path::new("C:/ls/label.dll");
        let old = manager.load_module(path, LoadFlags::NONE).unwrap();
        loader.fail_path(path);

        let error = manager.reload_module(old).unwrap_err();

        assert!(matches!(error, ModuleError::InitFailed { .. }));
        assert!(manager.records().is_empty());
        assert_eq!(manager.get_module_instance(path), None);
        assert_eq!(loader.quits(), vec![old]);
    }

    #[test]
    fn stop_quits_in_reverse_order() {
        let (mut manager, loader) = manager();
        let a = manager.load_module(Path::new("a.dll"), LoadFlags::NONE).unwrap();
        let b = manager.load_module(Path::new("b.dll"), LoadFlags::NONE).unwrap();

        manager.stop();

        assert_eq!(loader.quits(), vec![b, a]);
        assert!(manager.records().is_empty());
    }

    #[test]
    fn start_skips_failing_modules() {
        let (mut manager, loader) = manager();
        loader.fail_path(Path::new("bad.dll"));
        let loaded = manager.start(&[
            (PathBuf::from("good.dll"), LoadFlags::NONE),
            (PathBuf::from("bad.dll"), LoadFlags::NONE),
        ]);
        assert_eq!(loaded, 1);
        assert_eq!(manager.records().len(), 1);
    }

    #[test]
    fn dynamic_loader_reports_missing_file() {
        let mut loader = DynamicModuleLoader;
        let host = ModuleHostInfo {
            main_window: WindowHandle::NULL,
            app_path: std::env::temp_dir(),
        };
        let missing = std::env::temp_dir().join("stepshell-missing-module.dll");
        let error = loader.load(&missing, LoadFlags::NONE, &host).err().unwrap();
        assert_eq!(error, ModuleError::NotFound(missing));
    }
}
