use std::cell::{Cell, RefCell, RefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bang::{
    register_core_bangs, BangContext, BangDispatch, BangHandler, BangTable, CompletionEvent,
    ThreadedBangs, HIDE_MODULES_BANG, SHOW_MODULES_BANG,
};
use crate::config::{self, Settings};
use crate::data_store::{split_data_param, DataStore};
use crate::envelope::{BangEnvelope, EnvelopeError};
use crate::hooks::{HookCallback, HookManager, HookRegistry};
use crate::host::{Capabilities, ShellHookAction, ShellHost};
use crate::message_manager::{deliver, MessageManager};
use crate::messages::*;
use crate::module_manager::{DynamicModuleLoader, ModuleHostInfo, ModuleLoader, ModuleManager};
use crate::services::{default_services, Service, ServiceContext, ServiceRegistry};
use crate::startup::{default_scheduler, startup_allowed, StartupMode, StartupScheduler};

pub const MAIN_WINDOW_CLASS: &str = "StepShellMain";
pub const MAIN_WINDOW_TITLE: &str = "StepShell";
pub const OTHER_SHELL_TRAY_CLASS: &str = "Shell_TrayWnd";

const NOTICE_TITLE: &str = "StepShell";
const OTHER_SHELL_WARNING: &str = "Another shell is currently running. StepShell can run alongside it, \
but some features will be disabled.\n\nContinue?";
const RECYCLE_PAUSED: &str = "Recycle has been paused, click OK to continue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Initializing,
    Running,
    Recycling,
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("unable to find the file '{}'", .0.display())]
    ConfigNotFound(PathBuf),
    #[error("error registering the main window class: {0}")]
    ClassRegistration(String),
    #[error("error creating the main window: {0}")]
    WindowCreation(String),
}

/// Why one message could not be handled. Never escapes [`Shell::handle_message`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{0} is busy with an outer message")]
    Reentrant(&'static str),
    #[error("rejected bang envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("failed to spawn threaded bang: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleTarget {
    Path(PathBuf),
    Handle(ModuleHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellRequest {
    KeyOrSysCommand { wparam: usize },
    EndSession,
    SystrayReady,
    SaveData { wparam: usize, data: Vec<u8> },
    RestoreData { wparam: usize, has_buffer: bool },
    Obsolete,
    Recycle { mode: usize },
    ReloadModule { target: ModuleTarget, flags: LoadFlags },
    UnloadModule { target: ModuleTarget, flags: LoadFlags },
    BangCommand(Vec<u8>),
    CopyData { tag: usize, payload: Vec<u8> },
    GetRevId { wparam: usize, requester: WindowHandle },
    RegisterHook { message: u32, callback: HookCallback },
    UnregisterHook { message: u32, callback: HookCallback },
    RegisterMessages { window: WindowHandle, ids: Vec<u32> },
    UnregisterMessages { window: WindowHandle, ids: Vec<u32> },
    GetMainWindow,
    Other { id: u32, wparam: usize, lparam: isize },
}

impl ShellRequest {
    /// Decodes a message whose parameters are plain values. Pointer-carrying
    /// messages come back as [`ShellRequest::Other`].
    pub fn from_raw(id: u32, wparam: usize, lparam: isize) -> Self {
        match id {
            WM_KEYDOWN | WM_SYSCOMMAND => Self::KeyOrSysCommand { wparam },
            WM_QUERYENDSESSION | WM_ENDSESSION => Self::EndSession,
            LM_SYSTRAYREADY => Self::SystrayReady,
            LM_GETLSOBJECT | LM_WINDOWLIST | LM_DATASTORE | LM_MESSAGEMANAGER => Self::Obsolete,
            LM_RESTOREDATA => Self::RestoreData {
                wparam,
                has_buffer: lparam != 0,
            },
            LM_RECYCLE => Self::Recycle { mode: wparam },
            LM_RELOADMODULE | LM_UNLOADMODULE if lparam & LMM_HINSTANCE != 0 => Self::module(
                id,
                ModuleTarget::Handle(ModuleHandle(wparam)),
                LoadFlags::from_lparam(lparam),
            ),
            LM_GETREVID => Self::GetRevId {
                wparam,
                requester: WindowHandle(lparam),
            },
            LM_REGISTERHOOKMESSAGE => Self::RegisterHook {
                message: wparam as u32,
                callback: lparam as usize,
            },
            LM_UNREGISTERHOOKMESSAGE => Self::UnregisterHook {
                message: wparam as u32,
                callback: lparam as usize,
            },
            LM_GETMAINWINDOW => Self::GetMainWindow,
            _ => Self::Other { id, wparam, lparam },
        }
    }

    pub fn module(id: u32, target: ModuleTarget, flags: LoadFlags) -> Self {
        if id == LM_UNLOADMODULE {
            Self::UnloadModule { target, flags }
        } else {
            Self::ReloadModule { target, flags }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(isize),
    Restored(Vec<u8>),
    Default,
}

pub type ServiceFactory = Box<dyn Fn(&Settings) -> Vec<Box<dyn Service>>>;

pub struct ShellParts {
    pub host: Arc<dyn ShellHost>,
    pub capabilities: Capabilities,
    pub module_loader: Box<dyn ModuleLoader>,
    pub startup: Box<dyn StartupScheduler>,
    pub hooks: Box<dyn HookManager>,
    pub services: ServiceFactory,
}

impl ShellParts {
    pub fn new(host: Arc<dyn ShellHost>) -> Self {
        Self {
            host,
            capabilities: Capabilities::default(),
            module_loader: Box::new(DynamicModuleLoader),
            startup: default_scheduler(),
            hooks: Box::new(HookRegistry::new()),
            services: Box::new(default_services),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_module_loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.module_loader = Box::new(loader);
        self
    }

    pub fn with_startup(mut self, startup: impl StartupScheduler + 'static) -> Self {
        self.startup = Box::new(startup);
        self
    }

    pub fn with_hooks(mut self, hooks: impl HookManager + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_services(mut self, factory: impl Fn(&Settings) -> Vec<Box<dyn Service>> + 'static) -> Self {
        self.services = Box::new(factory);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    pub app_dir: PathBuf,
    pub config_path: PathBuf,
    pub startup_mode: StartupMode,
}

pub struct Shell {
    host: Arc<dyn ShellHost>,
    caps: Capabilities,
    options: ShellOptions,
    service_factory: ServiceFactory,

    state: Cell<ShellState>,
    main_window: Cell<WindowHandle>,
    under_other_shell: Cell<bool>,
    shell_hook_registered: Cell<bool>,
    hooks_running: Cell<bool>,
    app_fullscreen: Cell<bool>,
    finished: Cell<bool>,
    faults: Cell<u64>,
    recycles: Cell<u64>,

    settings: RefCell<Settings>,
    services: RefCell<ServiceRegistry>,
    modules: RefCell<ModuleManager>,
    messages: RefCell<MessageManager>,
    bangs: RefCell<BangTable>,
    data_store: RefCell<Option<DataStore>>,
    hooks: RefCell<Box<dyn HookManager>>,
    startup: RefCell<Box<dyn StartupScheduler>>,
    threaded: ThreadedBangs,
}

fn lock<'a, T>(cell: &'a RefCell<T>, component: &'static str) -> Result<RefMut<'a, T>, DispatchError> {
    cell.try_borrow_mut()
        .map_err(|_| DispatchError::Reentrant(component))
}

pub fn revision() -> String {
    format!("stepshell-core {}", env!("CARGO_PKG_VERSION"))
}

impl Shell {
    pub fn new(options: ShellOptions, parts: ShellParts) -> Result<Self, ShellError> {
        if !options.config_path.is_file() {
            return Err(ShellError::ConfigNotFound(options.config_path));
        }
        let settings = config::load_or_default(&options.config_path);
        let modules = ModuleManager::new(
            parts.module_loader,
            ModuleHostInfo {
                main_window: WindowHandle::NULL,
                app_path: options.app_dir.clone(),
            },
        );

        Ok(Self {
            host: parts.host,
            caps: parts.capabilities,
            options,
            service_factory: parts.services,
            state: Cell::new(ShellState::Initializing),
            main_window: Cell::new(WindowHandle::NULL),
            under_other_shell: Cell::new(false),
            shell_hook_registered: Cell::new(false),
            hooks_running: Cell::new(false),
            app_fullscreen: Cell::new(false),
            finished: Cell::new(false),
            faults: Cell::new(0),
            recycles: Cell::new(0),
            settings: RefCell::new(settings),
            services: RefCell::new(ServiceRegistry::new()),
            modules: RefCell::new(modules),
            messages: RefCell::new(MessageManager::new()),
            bangs: RefCell::new(BangTable::new()),
            data_store: RefCell::new(None),
            hooks: RefCell::new(parts.hooks),
            startup: RefCell::new(parts.startup),
            threaded: ThreadedBangs::new(),
        })
    }

    pub fn state(&self) -> ShellState {
        self.state.get()
    }

    pub fn main_window(&self) -> WindowHandle {
        self.main_window.get()
    }

    pub fn host(&self) -> &Arc<dyn ShellHost> {
        &self.host
    }

    pub fn options(&self) -> &ShellOptions {
        &self.options
    }

    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    pub fn faults(&self) -> u64 {
        self.faults.get()
    }

    pub fn recycle_count(&self) -> u64 {
        self.recycles.get()
    }

    pub fn is_under_other_shell(&self) -> bool {
        self.under_other_shell.get()
    }

    pub fn is_app_fullscreen(&self) -> bool {
        self.app_fullscreen.get()
    }

    pub fn threaded_in_flight(&self) -> usize {
        self.threaded.in_flight()
    }

    pub fn hooks_running(&self) -> bool {
        self.hooks_running.get()
    }

    pub fn data_store_len(&self) -> Option<usize> {
        self.data_store.borrow().as_ref().map(DataStore::count)
    }

    pub fn services_running(&self) -> usize {
        self.services.borrow().running()
    }

    pub fn messages_for(&self, window: WindowHandle) -> Vec<u32> {
        self.messages.borrow().messages_for(window)
    }

    pub fn module_instance(&self, path: &Path) -> Option<ModuleHandle> {
        self.modules.borrow().get_module_instance(path)
    }

    pub fn module_count(&self) -> usize {
        self.modules.borrow().records().len()
    }

    pub fn bang_names(&self) -> Vec<String> {
        self.bangs.borrow().names()
    }

    pub fn register_bang(&self, name: &str, handler: impl BangHandler + 'static, threaded: bool) -> Result<(), DispatchError> {
        let mut bangs = lock(&self.bangs, "bang table")?;
        if threaded {
            bangs.add_threaded(name, handler);
        } else {
            bangs.add(name, handler);
        }
        Ok(())
    }

    pub fn check_other_shell(&self) -> bool {
        if self.host.find_window(OTHER_SHELL_TRAY_CLASS, None).is_none() {
            return true;
        }
        self.under_other_shell.set(true);
        tracing::info!("another shell is running");
        if self.settings.borrow().no_shell_warning {
            return true;
        }
        self.host.confirm("Warning", OTHER_SHELL_WARNING)
    }

    pub fn start(&self, window: WindowHandle) {
        self.main_window.set(window);
        self.modules.borrow_mut().set_host(ModuleHostInfo {
            main_window: window,
            app_path: self.options.app_dir.clone(),
        });

        match &self.caps.shell_hook {
            Some(register) => self.shell_hook_registered.set(register(window, ShellHookAction::Register)),
            None => tracing::debug!("shell hook registration unavailable"),
        }

        if !self.under_other_shell.get() && self.settings.borrow().set_as_shell {
            match &self.caps.set_shell_window {
                Some(set_shell_window) => {
                    if !set_shell_window(window) {
                        tracing::warn!("could not become the shell window");
                    }
                }
                None => tracing::debug!("shell window assignment unavailable"),
            }
        }

        self.start_services();

        let mode = self.options.startup_mode;
        let no_startup = self.settings.borrow().no_startup;
        if startup_allowed(mode, no_startup, self.host.is_shift_down()) {
            let scheduled = self.startup.borrow_mut().schedule(mode);
            tracing::info!(?mode, scheduled, "startup items");
        } else {
            tracing::info!(?mode, no_startup, "startup items suppressed");
        }

        if let Err(error) = self.start_managers() {
            tracing::warn!(%error, "managers did not start cleanly");
        }
        self.state.set(ShellState::Running);

        // Tells the desktop that shell loading finished.
        self.host.send_message(self.host.desktop_window(), WM_USER, 0, 0);
        tracing::info!(window = window.0, "shell running");
    }

    fn service_context(&self) -> ServiceContext<'_> {
        ServiceContext {
            main_window: self.main_window.get(),
            host: self.host.as_ref(),
        }
    }

    fn start_services(&self) {
        let services = (self.service_factory)(&self.settings.borrow());
        let mut registry = self.services.borrow_mut();
        registry.init(services);
        let started = registry.start_all(&self.service_context());
        tracing::info!(started, "services started");
    }

    fn stop_services(&self) {
        let mut registry = self.services.borrow_mut();
        registry.stop_all(&self.service_context());
        registry.cleanup();
    }

    fn module_entries(&self) -> Vec<(PathBuf, LoadFlags)> {
        self.settings
            .borrow()
            .modules
            .iter()
            .map(|entry| {
                let flags = if entry.threaded {
                    LoadFlags::THREADED
                } else {
                    LoadFlags::NONE
                };
                (config::resolve_module_path(&self.options.app_dir, &entry.path), flags)
            })
            .collect()
    }

    fn start_managers(&self) -> Result<(), DispatchError> {
        register_core_bangs(&mut *lock(&self.bangs, "bang table")?);
        let entries = self.module_entries();
        lock(&self.modules, "module manager")?.start(&entries);
        Ok(())
    }

    fn stop_managers(&self) -> Result<(), DispatchError> {
        let mut modules = lock(&self.modules, "module manager")?;
        if self.hooks_running.get() {
            lock(&self.hooks, "hook manager")?.stop();
            self.hooks_running.set(false);
        }
        modules.stop();
        drop(modules);
        lock(&self.messages, "message manager")?.clear_messages();
        lock(&self.bangs, "bang table")?.clear();
        Ok(())
    }

    pub fn recycle(&self) -> Result<(), DispatchError> {
        tracing::info!("recycle started");
        self.state.set(ShellState::Recycling);
        let result = self.recycle_managers();
        self.state.set(ShellState::Running);
        self.recycles.set(self.recycles.get() + 1);
        tracing::info!(ok = result.is_ok(), "recycle finished");
        result
    }

    fn recycle_managers(&self) -> Result<(), DispatchError> {
        self.stop_managers()?;
        *lock(&self.settings, "settings")? = config::load_or_default(&self.options.config_path);
        if self.host.is_shift_down() {
            self.host.notify(NOTICE_TITLE, RECYCLE_PAUSED);
        }
        self.start_managers()
    }

    pub fn request_quit(&self) {
        self.state.set(ShellState::ShuttingDown);
        self.host.post_quit();
    }

    /// Tears down in reverse of start. Runs at most once.
    pub fn shutdown(&self) {
        if self.finished.replace(true) {
            return;
        }
        self.state.set(ShellState::ShuttingDown);
        tracing::info!("shell shutting down");

        if self.shell_hook_registered.replace(false) {
            if let Some(register) = &self.caps.shell_hook {
                register(self.main_window.get(), ShellHookAction::Unregister);
            }
        }
        if let Err(error) = self.stop_managers() {
            tracing::warn!(%error, "managers did not stop cleanly");
        }
        if let Some(store) = self.data_store.borrow_mut().take() {
            tracing::debug!(entries = store.count(), "data store cleared");
        }
        self.stop_services();
    }

    pub fn parse_bang_command(&self, caller: WindowHandle, command: &str, args: &str) -> Result<BangDispatch, DispatchError> {
        let found = self
            .bangs
            .try_borrow()
            .map_err(|_| DispatchError::Reentrant("bang table"))?
            .lookup(command);

        match found {
            None => {
                tracing::info!(command, "bang command not found");
                Ok(BangDispatch::NotFound)
            }
            Some((handler, false)) => {
                let ctx = BangContext {
                    caller,
                    main_window: self.main_window.get(),
                    host: self.host.as_ref(),
                };
                handler.execute(&ctx, args);
                Ok(BangDispatch::Executed)
            }
            Some((handler, true)) => {
                self.threaded
                    .spawn(command, args, caller, handler, self.main_window.get(), Arc::clone(&self.host))
                    .map_err(DispatchError::Spawn)?;
                Ok(BangDispatch::Spawned)
            }
        }
    }

    pub fn process_completions(&self) -> usize {
        let mut completed = 0;
        for event in self.threaded.drain() {
            match event {
                CompletionEvent::BangFinished(command) => {
                    tracing::debug!(command = %command.command, "threaded bang completed");
                    command.complete(self.main_window.get(), self.host.as_ref());
                    completed += 1;
                }
            }
        }
        completed
    }

    /// Error boundary around [`Shell::window_proc`]: failures and panics are
    /// logged and counted, and the message gets the default answer.
    pub fn handle_message(&self, request: ShellRequest) -> Reply {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.window_proc(request)));
        let error = match outcome {
            Ok(Ok(reply)) => return reply,
            Ok(Err(error)) => error,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                DispatchError::Panicked(message)
            }
        };
        self.faults.set(self.faults.get() + 1);
        tracing::warn!(%error, faults = self.faults.get(), "message dropped");
        Reply::Default
    }

    pub fn window_proc(&self, request: ShellRequest) -> Result<Reply, DispatchError> {
        match request {
            ShellRequest::KeyOrSysCommand { wparam } => {
                if wparam == LM_SHUTDOWN as usize || wparam == SC_CLOSE {
                    self.parse_bang_command(self.main_window.get(), "!ShutDown", "")?;
                    Ok(Reply::Value(0))
                } else {
                    Ok(Reply::Default)
                }
            }
            ShellRequest::EndSession => Ok(Reply::Value(1)),
            ShellRequest::SystrayReady => {
                let mut services = lock(&self.services, "service registry")?;
                let result = services
                    .tray()
                    .map(|tray| tray.send_system_tray(self.host.as_ref()))
                    .unwrap_or(0);
                Ok(Reply::Value(result))
            }
            ShellRequest::SaveData { wparam, data } => {
                let (ident, len) = split_data_param(wparam);
                if len == 0 || data.is_empty() {
                    return Ok(Reply::Value(0));
                }
                let bytes = &data[..data.len().min(len as usize)];
                let mut store = lock(&self.data_store, "data store")?;
                let stored = store.get_or_insert_with(DataStore::new).store(ident, bytes);
                Ok(Reply::Value(isize::from(stored)))
            }
            ShellRequest::RestoreData { wparam, has_buffer } => {
                let (ident, len) = split_data_param(wparam);
                // Nothing to copy into: the blob stays for a later request.
                if len == 0 || !has_buffer {
                    return Ok(Reply::Value(0));
                }
                let mut slot = lock(&self.data_store, "data store")?;
                let Some(store) = slot.as_mut() else {
                    return Ok(Reply::Value(0));
                };
                let restored = store.release(ident, len as usize);
                if store.is_empty() {
                    *slot = None;
                }
                Ok(restored.map_or(Reply::Value(0), Reply::Restored))
            }
            ShellRequest::Obsolete => Ok(Reply::Value(0)),
            ShellRequest::Recycle { mode } => {
                match mode {
                    LR_RECYCLE => self.recycle()?,
                    LR_LOGOFF => {
                        if self.host.log_off() {
                            self.request_quit();
                        }
                    }
                    LR_QUIT => self.request_quit(),
                    _ => match &self.caps.shutdown_dialog {
                        Some(dialog) => dialog(self.main_window.get()),
                        None => tracing::debug!("shutdown dialog unavailable"),
                    },
                }
                Ok(Reply::Value(0))
            }
            ShellRequest::ReloadModule { target, flags } => {
                self.module_request(LM_RELOADMODULE, target, flags)
            }
            ShellRequest::UnloadModule { target, flags } => {
                self.module_request(LM_UNLOADMODULE, target, flags)
            }
            ShellRequest::BangCommand(bytes) => {
                let envelope = BangEnvelope::decode(&bytes)?;
                let dispatch = self.parse_bang_command(envelope.origin, &envelope.command, &envelope.args)?;
                Ok(Reply::Value(isize::from(dispatch != BangDispatch::NotFound)))
            }
            ShellRequest::CopyData { tag, payload } => {
                if tag == LM_BANGCOMMAND as usize {
                    self.window_proc(ShellRequest::BangCommand(payload))
                } else {
                    Ok(Reply::Value(0))
                }
            }
            ShellRequest::GetRevId { wparam, requester } => {
                if self.host.is_window(requester) {
                    self.host.send_text(requester, LM_GETREVID, 0, &revision());
                }
                self.broadcast(LM_GETREVID, wparam, requester.0)?;
                Ok(Reply::Value(0))
            }
            ShellRequest::RegisterHook { message, callback } => {
                let mut hooks = lock(&self.hooks, "hook manager")?;
                if !self.hooks_running.get() {
                    self.hooks_running.set(hooks.start());
                }
                if !self.hooks_running.get() {
                    return Ok(Reply::Value(0));
                }
                let registered = hooks.register(self.main_window.get(), message, callback);
                Ok(Reply::Value(isize::from(registered)))
            }
            ShellRequest::UnregisterHook { message, callback } => {
                if self.hooks_running.get() {
                    let mut hooks = lock(&self.hooks, "hook manager")?;
                    if hooks.unregister(self.main_window.get(), message, callback) == 0 {
                        hooks.stop();
                        self.hooks_running.set(false);
                    }
                }
                Ok(Reply::Value(0))
            }
            ShellRequest::RegisterMessages { window, ids } => {
                lock(&self.messages, "message manager")?.add_messages(window, &ids);
                Ok(Reply::Value(0))
            }
            ShellRequest::UnregisterMessages { window, ids } => {
                lock(&self.messages, "message manager")?.remove_messages(window, &ids);
                Ok(Reply::Value(0))
            }
            ShellRequest::GetMainWindow => Ok(Reply::Value(self.main_window.get().0)),
            ShellRequest::Other { id, wparam, lparam } => self.route_other(id, wparam, lparam),
        }
    }

    fn module_request(&self, id: u32, target: ModuleTarget, flags: LoadFlags) -> Result<Reply, DispatchError> {
        match target {
            ModuleTarget::Handle(handle) => {
                let mut modules = lock(&self.modules, "module manager")?;
                if id == LM_UNLOADMODULE {
                    if !modules.quit_module(handle) {
                        tracing::debug!(handle = handle.0, "unload of unknown module ignored");
                    }
                } else if let Err(error) = modules.reload_module(handle) {
                    tracing::warn!(handle = handle.0, %error, "module reload failed");
                }
            }
            ModuleTarget::Path(path) => {
                let path = config::resolve_module_path(&self.options.app_dir, &path.to_string_lossy());
                let existing = self
                    .modules
                    .try_borrow()
                    .map_err(|_| DispatchError::Reentrant("module manager"))?
                    .get_module_instance(&path);
                match existing {
                    // Re-posted by handle so both forms share one code path.
                    Some(handle) => {
                        self.host.post_message(
                            self.main_window.get(),
                            id,
                            handle.0,
                            flags.0 as isize | LMM_HINSTANCE,
                        );
                    }
                    None if id == LM_RELOADMODULE => {
                        if let Err(error) = lock(&self.modules, "module manager")?.load_module(&path, flags) {
                            tracing::warn!(path = %path.display(), %error, "module load failed");
                        }
                    }
                    None => tracing::debug!(path = %path.display(), "unload of module that is not loaded"),
                }
            }
        }
        Ok(Reply::Value(0))
    }

    fn route_other(&self, id: u32, wparam: usize, lparam: isize) -> Result<Reply, DispatchError> {
        let (id, wparam, lparam) = match self.caps.shell_hook_message {
            Some(hook_message) if hook_message == id && id != 0 => {
                let (id, wparam, lparam) = remap_shell_hook(wparam, lparam);
                match id {
                    LM_WINDOWACTIVATED => self.on_window_activated(lparam)?,
                    LM_WINDOWDESTROYED => {
                        lock(&self.messages, "message manager")?.remove_window(WindowHandle(wparam as isize));
                    }
                    _ => {}
                }
                (id, wparam, lparam)
            }
            _ => (id, wparam, lparam),
        };

        let handled = self
            .messages
            .try_borrow()
            .map_err(|_| DispatchError::Reentrant("message manager"))?
            .handler_exists(id);
        if handled {
            Ok(Reply::Value(self.broadcast(id, wparam, lparam)?))
        } else {
            Ok(Reply::Default)
        }
    }

    // Sends without holding the registry borrow so recipients may register
    // or unregister from inside their handler.
    fn broadcast(&self, id: u32, wparam: usize, lparam: isize) -> Result<isize, DispatchError> {
        let recipients = self
            .messages
            .try_borrow()
            .map_err(|_| DispatchError::Reentrant("message manager"))?
            .recipients(id);
        let (result, stale) = deliver(self.host.as_ref(), &recipients, id, wparam, lparam);
        if !stale.is_empty() {
            lock(&self.messages, "message manager")?.prune(&stale);
        }
        Ok(result)
    }

    // Edge-triggered: one bang per transition into or out of a full-screen app.
    fn on_window_activated(&self, lparam: isize) -> Result<(), DispatchError> {
        if !self.settings.borrow().auto_hide_modules {
            return Ok(());
        }
        let fullscreen = lparam > 0;
        if fullscreen == self.app_fullscreen.get() {
            return Ok(());
        }
        self.app_fullscreen.set(fullscreen);
        let bang = if fullscreen {
            HIDE_MODULES_BANG
        } else {
            SHOW_MODULES_BANG
        };
        self.parse_bang_command(self.main_window.get(), bang, "")?;
        Ok(())
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        if self.state.get() != ShellState::Initializing {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockShellHost;
    use crate::module_manager::MockModuleLoader;
    use crate::startup::MockStartupScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MAIN: WindowHandle = WindowHandle(0x100);
    const SHELL_HOOK: u32 = 0xC0DE;

    struct Fixture {
        shell: Shell,
        host: Arc<MockShellHost>,
        loader: MockModuleLoader,
        dir: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn fixture(config: &str) -> Fixture {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("stepshell-shell-{unique}"));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("step.rc");
        std::fs::write(&config_path, config).unwrap();

        let host = Arc::new(MockShellHost::default());
        let loader = MockModuleLoader::default();
        let capabilities = Capabilities {
            shell_hook_message: Some(SHELL_HOOK),
            ..Capabilities::default()
        };
        let parts = ShellParts::new(host.clone())
            .with_capabilities(capabilities)
            .with_module_loader(loader.clone())
            .with_startup(MockStartupScheduler::default());
        let shell = Shell::new(
            ShellOptions {
                app_dir: dir.clone(),
                config_path,
                startup_mode: StartupMode::Default,
            },
            parts,
        )
        .unwrap();
        shell.start(MAIN);
        Fixture {
            shell,
            host,
            loader,
            dir,
        }
    }

    #[test]
    fn missing_config_is_fatal() {
        let host = Arc::new(MockShellHost::default());
        let error = Shell::new(
            ShellOptions {
                app_dir: std::env::temp_dir(),
                config_path: std::env::temp_dir().join("stepshell-no-such-step.rc"),
                startup_mode: StartupMode::Default,
            },
            ShellParts::new(host),
        )
        .err()
        .unwrap();
        assert!(matches!(error, ShellError::ConfigNotFound(_)));
    }

    #[test]
    fn from_raw_decodes_scalar_messages() {
        assert_eq!(
            ShellRequest::from_raw(LM_UNLOADMODULE, 0x400000, LMM_HINSTANCE | 1),
            ShellRequest::UnloadModule {
                target: ModuleTarget::Handle(ModuleHandle(0x400000)),
                flags: LoadFlags::THREADED,
            }
        );
        assert_eq!(ShellRequest::from_raw(LM_WINDOWLIST, 0, 0), ShellRequest::Obsolete);
        assert_eq!(
            ShellRequest::from_raw(LM_RELOADMODULE, 1, 0),
            ShellRequest::Other {
                id: LM_RELOADMODULE,
                wparam: 1,
                lparam: 0
            }
        );
    }

    #[test]
    fn obsolete_and_end_session_answers() {
        let f = fixture("");
        assert_eq!(f.shell.handle_message(ShellRequest::Obsolete), Reply::Value(0));
        assert_eq!(f.shell.handle_message(ShellRequest::EndSession), Reply::Value(1));
        assert_eq!(f.shell.handle_message(ShellRequest::GetMainWindow), Reply::Value(MAIN.0));
    }

    #[test]
    fn data_store_is_lazy_and_dropped_when_empty() {
        let f = fixture("");
        assert_eq!(f.shell.data_store_len(), None);

        let saved = f.shell.handle_message(ShellRequest::SaveData {
            wparam: (3 << 16) | 4,
            data: b"abcdef".to_vec(),
        });
        assert_eq!(saved, Reply::Value(1));
        assert_eq!(f.shell.data_store_len(), Some(1));

        let restored = f.shell.handle_message(ShellRequest::RestoreData {
            wparam: (3 << 16) | 2,
            has_buffer: true,
        });
        assert_eq!(restored, Reply::Restored(b"ab".to_vec()));
        assert_eq!(f.shell.data_store_len(), None);
    }

    #[test]
    fn restore_without_buffer_keeps_the_blob() {
        let f = fixture("");
        let wparam = (3 << 16) | 4;
        f.shell.handle_message(ShellRequest::SaveData {
            wparam,
            data: b"abcd".to_vec(),
        });

        let request = ShellRequest::from_raw(LM_RESTOREDATA, wparam, 0);
        assert_eq!(
            request,
            ShellRequest::RestoreData {
                wparam,
                has_buffer: false
            }
        );
        assert_eq!(f.shell.handle_message(request), Reply::Value(0));
        assert_eq!(f.shell.data_store_len(), Some(1));

        let empty = ShellRequest::RestoreData {
            wparam: 3 << 16,
            has_buffer: true,
        };
        assert_eq!(f.shell.handle_message(empty), Reply::Value(0));
        assert_eq!(f.shell.data_store_len(), Some(1));

        let restored = f.shell.handle_message(ShellRequest::from_raw(LM_RESTOREDATA, wparam, 0x1000));
        assert_eq!(restored, Reply::Restored(b"abcd".to_vec()));
        assert_eq!(f.shell.data_store_len(), None);
    }

    #[test]
    fn malformed_envelope_is_rejected_and_counted() {
        let f = fixture("");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.shell
            .register_bang("!Probe", move |_: &BangContext<'_>, _: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            }, false)
            .unwrap();

        let mut bytes = BangEnvelope::new(WindowHandle::NULL, "!Probe", "").encode();
        bytes[0] = 0x10;
        let reply = f.shell.handle_message(ShellRequest::BangCommand(bytes));

        assert_eq!(reply, Reply::Default);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.shell.faults(), 1);
    }

    #[test]
    fn copy_data_with_bang_tag_dispatches() {
        let f = fixture("");
        let payload = BangEnvelope::new(WindowHandle::NULL, "!Quit", "").encode();
        let reply = f.shell.handle_message(ShellRequest::CopyData {
            tag: LM_BANGCOMMAND as usize,
            payload,
        });
        assert_eq!(reply, Reply::Value(1));
        let posted = f.host.posted();
        assert_eq!(posted.last().map(|m| (m.id, m.wparam)), Some((LM_RECYCLE, LR_QUIT)));
    }

    #[test]
    fn panicking_bang_is_contained() {
        let f = fixture("");
        f.shell
            .register_bang("!Boom", |_: &BangContext<'_>, _: &str| panic!("boom"), false)
            .unwrap();
        let bytes = BangEnvelope::new(WindowHandle::NULL, "!Boom", "").encode();

        assert_eq!(f.shell.handle_message(ShellRequest::BangCommand(bytes)), Reply::Default);
        assert_eq!(f.shell.faults(), 1);
        assert_eq!(f.shell.handle_message(ShellRequest::EndSession), Reply::Value(1));
    }

    #[test]
    fn auto_hide_is_edge_triggered() {
        let f = fixture("");
        let activate = |flag: usize| ShellRequest::Other {
            id: SHELL_HOOK,
            wparam: 0x0004 | flag,
            lparam: 0x777,
        };

        f.shell.handle_message(activate(0x8000));
        f.shell.handle_message(activate(0x8000));
        assert_eq!(f.host.modules_visible(), Some(false));
        assert!(f.shell.is_app_fullscreen());

        assert_eq!(f.host.visibility_changes(), 1);

        f.shell.handle_message(activate(0));
        f.shell.handle_message(activate(0));
        assert_eq!(f.host.modules_visible(), Some(true));
        assert_eq!(f.host.visibility_changes(), 2);
    }

    #[test]
    fn window_destroyed_hook_clears_registrations() {
        let f = fixture("");
        let module_window = WindowHandle(0x500);
        f.shell.handle_message(ShellRequest::RegisterMessages {
            window: module_window,
            ids: vec![LM_WINDOWDESTROYED, LM_GETREVID],
        });

        f.shell.handle_message(ShellRequest::Other {
            id: SHELL_HOOK,
            wparam: 0x0002,
            lparam: module_window.0,
        });

        assert!(f.shell.messages_for(module_window).is_empty());
        assert!(f.host.sent().iter().all(|m| m.window != module_window));
    }

    #[test]
    fn registered_message_is_broadcast() {
        let f = fixture("");
        f.host.set_reply(WindowHandle(0x600), 42);
        f.shell.handle_message(ShellRequest::RegisterMessages {
            window: WindowHandle(0x600),
            ids: vec![0x9999],
        });

        let reply = f.shell.handle_message(ShellRequest::Other {
            id: 0x9999,
            wparam: 1,
            lparam: 2,
        });
        assert_eq!(reply, Reply::Value(42));
        assert_eq!(
            f.shell.handle_message(ShellRequest::Other { id: 0x9998, wparam: 0, lparam: 0 }),
            Reply::Default
        );
    }

    #[test]
    fn hook_subsystem_starts_lazily_and_stops_at_zero() {
        let f = fixture("");
        assert!(!f.shell.hooks_running());
        f.shell.handle_message(ShellRequest::RegisterHook { message: 0x100, callback: 7 });
        assert!(f.shell.hooks_running());
        f.shell.handle_message(ShellRequest::UnregisterHook { message: 0x100, callback: 7 });
        assert!(!f.shell.hooks_running());
    }

    #[test]
    fn reload_by_path_reposts_by_handle() {
        let f = fixture("[[modules]]\npath = \"label.dll\"\n");
        let handle = f.shell.module_instance(&f.dir.join("label.dll")).unwrap();
        f.host.take_posted();

        f.shell.handle_message(ShellRequest::ReloadModule {
            target: ModuleTarget::Path(PathBuf::from("LABEL.DLL")),
            flags: LoadFlags::NONE,
        });

        let posted = f.host.take_posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].id, LM_RELOADMODULE);
        assert_eq!(posted[0].wparam, handle.0);
        assert_ne!(posted[0].lparam & LMM_HINSTANCE, 0);

        let reposted = ShellRequest::from_raw(posted[0].id, posted[0].wparam, posted[0].lparam);
        f.shell.handle_message(reposted);
        assert_eq!(f.shell.module_count(), 1);
        assert_eq!(f.loader.quits(), vec![handle]);
    }

    #[test]
    fn shutdown_runs_once() {
        let f = fixture("[[modules]]\npath = \"label.dll\"\n");
        f.shell.shutdown();
        f.shell.shutdown();
        assert_eq!(f.loader.quits().len(), 1);
        assert_eq!(f.shell.services_running(), 0);
        assert_eq!(f.shell.state(), ShellState::ShuttingDown);
    }
}
