use std::ffi::{c_char, c_void, CStr};
use std::sync::Mutex;

use windows_sys::Win32::Foundation::{GetLastError, BOOL, HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::System::DataExchange::COPYDATASTRUCT;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress, LoadLibraryW};
use windows_sys::Win32::System::Shutdown::{ExitWindowsEx, EWX_LOGOFF};
use windows_sys::Win32::System::Threading::GetCurrentThreadId;
use windows_sys::Win32::UI::Input::KeyboardAndMouse::{GetAsyncKeyState, VK_SHIFT};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, EnumThreadWindows,
    FindWindowW, GetDesktopWindow, GetMessageW, GetWindowLongPtrW, IsWindow, IsWindowVisible,
    MessageBoxW, PostMessageW, PostThreadMessageW, RegisterClassExW, RegisterWindowMessageW,
    SendMessageW, SetWindowLongPtrW, ShowWindow, SystemParametersInfoW, TranslateMessage,
    UnregisterClassW, GWLP_USERDATA, IDYES, MB_ICONEXCLAMATION, MB_ICONINFORMATION, MB_OK,
    MB_TOPMOST, MB_YESNO, MINIMIZEDMETRICS, MSG, SPI_GETMINIMIZEDMETRICS, SPI_SETMINIMIZEDMETRICS,
    SW_HIDE, SW_SHOWNOACTIVATE, WM_QUIT, WNDCLASSEXW, WS_EX_TOOLWINDOW, WS_POPUP,
};

use crate::data_store::split_data_param;
use crate::envelope::ENVELOPE_SIZE;
use crate::event_loop::{LoopEvent, MessagePump};
use crate::host::{Capabilities, ShellHookAction, ShellHost};
use crate::instance::CopyDataSink;
use crate::messages::*;
use crate::shell::{ModuleTarget, Reply, Shell, ShellError, ShellRequest, MAIN_WINDOW_CLASS, MAIN_WINDOW_TITLE};

// Marks the main window so virtual-window managers leave it alone.
const MAGIC_USERDATA: isize = 0x4947_4541;

const RSH_UNREGISTER: u32 = 0;
const RSH_REGISTER: u32 = 1;
const RSH_TASKMAN: u32 = 3;

const REGISTER_SHELL_HOOK_ORDINAL: usize = 0xB5;
const SHUTDOWN_DIALOG_ORDINAL: usize = 0x3C;

// Byte offset of the shell pointer in the window's extra bytes.
const SHELL_SLOT: i32 = 0;

pub(crate) fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

fn hwnd(window: WindowHandle) -> HWND {
    window.0 as HWND
}

fn handle(hwnd: HWND) -> WindowHandle {
    WindowHandle(hwnd as isize)
}

pub struct WindowsShellHost {
    thread_id: u32,
    hidden: Mutex<Vec<isize>>,
}

impl WindowsShellHost {
    pub fn for_current_thread() -> Self {
        Self {
            thread_id: unsafe { GetCurrentThreadId() },
            hidden: Mutex::new(Vec::new()),
        }
    }

    fn thread_windows(&self) -> Vec<isize> {
        unsafe extern "system" fn collect(window: HWND, lparam: LPARAM) -> BOOL {
            let windows = &mut *(lparam as *mut Vec<isize>);
            windows.push(window as isize);
            1
        }

        let mut windows: Vec<isize> = Vec::new();
        unsafe {
            EnumThreadWindows(self.thread_id, Some(collect), &mut windows as *mut Vec<isize> as LPARAM);
        }
        windows
    }
}

impl ShellHost for WindowsShellHost {
    fn post_message(&self, window: WindowHandle, id: u32, wparam: usize, lparam: isize) -> bool {
        unsafe { PostMessageW(hwnd(window), id, wparam, lparam) != 0 }
    }

    fn send_message(&self, window: WindowHandle, id: u32, wparam: usize, lparam: isize) -> isize {
        unsafe { SendMessageW(hwnd(window), id, wparam, lparam) }
    }

    fn is_window(&self, window: WindowHandle) -> bool {
        !window.is_null() && unsafe { IsWindow(hwnd(window)) != 0 }
    }

    fn find_window(&self, class: &str, title: Option<&str>) -> Option<WindowHandle> {
        let class = to_wide(class);
        let title = title.map(to_wide);
        let found = unsafe {
            FindWindowW(
                class.as_ptr(),
                title.as_ref().map_or(std::ptr::null(), |t| t.as_ptr()),
            )
        };
        (!found.is_null()).then(|| handle(found))
    }

    fn desktop_window(&self) -> WindowHandle {
        handle(unsafe { GetDesktopWindow() })
    }

    fn hide_minimized_windows(&self) -> bool {
        let mut metrics: MINIMIZEDMETRICS = unsafe { std::mem::zeroed() };
        metrics.cbSize = std::mem::size_of::<MINIMIZEDMETRICS>() as u32;
        let read = unsafe {
            SystemParametersInfoW(
                SPI_GETMINIMIZEDMETRICS,
                metrics.cbSize,
                &mut metrics as *mut MINIMIZEDMETRICS as *mut c_void,
                0,
            )
        };
        if read == 0 {
            return false;
        }
        // ARW_HIDE
        if metrics.iArrange & 8 != 0 {
            return true;
        }
        metrics.iArrange |= 8;
        unsafe {
            SystemParametersInfoW(
                SPI_SETMINIMIZEDMETRICS,
                metrics.cbSize,
                &mut metrics as *mut MINIMIZEDMETRICS as *mut c_void,
                0,
            ) != 0
        }
    }

    fn wake_main_thread(&self) {
        unsafe {
            PostThreadMessageW(self.thread_id, LM_THREAD_BANGCOMMAND, 0, 0);
        }
    }

    fn post_quit(&self) {
        unsafe {
            PostThreadMessageW(self.thread_id, WM_QUIT, 0, 0);
        }
    }

    fn log_off(&self) -> bool {
        unsafe { ExitWindowsEx(EWX_LOGOFF, 0) != 0 }
    }

    fn register_window_message(&self, name: &str) -> u32 {
        let name = to_wide(name);
        unsafe { RegisterWindowMessageW(name.as_ptr()) }
    }

    fn send_text(&self, window: WindowHandle, id: u32, wparam: usize, text: &str) -> isize {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        unsafe { SendMessageW(hwnd(window), id, wparam, bytes.as_ptr() as LPARAM) }
    }

    fn set_module_windows_visible(&self, main_window: WindowHandle, visible: bool) {
        let mut hidden = match self.hidden.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if visible {
            for window in hidden.drain(..) {
                unsafe {
                    if IsWindow(window as HWND) != 0 {
                        ShowWindow(window as HWND, SW_SHOWNOACTIVATE);
                    }
                }
            }
            return;
        }
        for window in self.thread_windows() {
            if window == main_window.0 || unsafe { IsWindowVisible(window as HWND) } == 0 {
                continue;
            }
            unsafe {
                ShowWindow(window as HWND, SW_HIDE);
            }
            hidden.push(window);
        }
    }

    fn confirm(&self, title: &str, text: &str) -> bool {
        let title = to_wide(title);
        let text = to_wide(text);
        let answer = unsafe {
            MessageBoxW(
                std::ptr::null_mut(),
                text.as_ptr(),
                title.as_ptr(),
                MB_YESNO | MB_TOPMOST | MB_ICONEXCLAMATION,
            )
        };
        answer == IDYES
    }

    fn notify(&self, title: &str, text: &str) {
        let title = to_wide(title);
        let text = to_wide(text);
        unsafe {
            MessageBoxW(
                std::ptr::null_mut(),
                text.as_ptr(),
                title.as_ptr(),
                MB_OK | MB_TOPMOST | MB_ICONINFORMATION,
            );
        }
    }

    fn is_shift_down(&self) -> bool {
        unsafe { (GetAsyncKeyState(VK_SHIFT as i32) as u16) & 0x8000 != 0 }
    }
}

type RegisterShellHookFn = unsafe extern "system" fn(HWND, u32) -> BOOL;
type SetShellWindowFn = unsafe extern "system" fn(HWND) -> BOOL;
type ShutdownDialogFn = unsafe extern "system" fn(HWND);
type RawProc = unsafe extern "system" fn() -> isize;

fn lookup(module: HINSTANCE, name: *const u8) -> Option<RawProc> {
    if module.is_null() {
        return None;
    }
    unsafe { GetProcAddress(module, name) }
}

pub fn probe_capabilities() -> Capabilities {
    let shell32 = unsafe { LoadLibraryW(to_wide("shell32.dll").as_ptr()) };
    let user32 = unsafe { GetModuleHandleW(to_wide("user32.dll").as_ptr()) };

    let register_shell_hook = lookup(shell32, REGISTER_SHELL_HOOK_ORDINAL as *const u8)
        .map(|proc| unsafe { std::mem::transmute::<RawProc, RegisterShellHookFn>(proc) });
    let set_shell_window = lookup(user32, b"SetShellWindow\0".as_ptr())
        .map(|proc| unsafe { std::mem::transmute::<RawProc, SetShellWindowFn>(proc) });
    let shutdown_dialog = lookup(shell32, SHUTDOWN_DIALOG_ORDINAL as *const u8)
        .map(|proc| unsafe { std::mem::transmute::<RawProc, ShutdownDialogFn>(proc) });

    let hook_name = to_wide("SHELLHOOK");
    let shell_hook_message = match unsafe { RegisterWindowMessageW(hook_name.as_ptr()) } {
        0 => None,
        id => Some(id),
    };

    let capabilities = Capabilities {
        shell_hook: register_shell_hook.map(|register| {
            Box::new(move |window: WindowHandle, action: ShellHookAction| unsafe {
                match action {
                    ShellHookAction::Register => {
                        register(std::ptr::null_mut(), RSH_REGISTER);
                        register(hwnd(window), RSH_TASKMAN) != 0
                    }
                    ShellHookAction::Unregister => register(hwnd(window), RSH_UNREGISTER) != 0,
                }
            }) as Box<dyn Fn(WindowHandle, ShellHookAction) -> bool>
        }),
        shell_hook_message,
        set_shell_window: set_shell_window.map(|set| {
            Box::new(move |window: WindowHandle| unsafe { set(hwnd(window)) != 0 })
                as Box<dyn Fn(WindowHandle) -> bool>
        }),
        shutdown_dialog: shutdown_dialog.map(|dialog| {
            Box::new(move |window: WindowHandle| unsafe { dialog(hwnd(window)) }) as Box<dyn Fn(WindowHandle)>
        }),
    };
    tracing::debug!(?capabilities, "probed shell capabilities");
    capabilities
}

pub struct MainWindow {
    hwnd: HWND,
    instance: HINSTANCE,
    class: Vec<u16>,
}

impl MainWindow {
    pub fn create() -> Result<Self, ShellError> {
        let instance = unsafe { GetModuleHandleW(std::ptr::null()) };
        let class = to_wide(MAIN_WINDOW_CLASS);
        let window_class = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: 0,
            lpfnWndProc: Some(main_window_proc),
            cbClsExtra: 0,
            cbWndExtra: std::mem::size_of::<isize>() as i32,
            hInstance: instance,
            hIcon: std::ptr::null_mut(),
            hCursor: std::ptr::null_mut(),
            hbrBackground: std::ptr::null_mut(),
            lpszMenuName: std::ptr::null(),
            lpszClassName: class.as_ptr(),
            hIconSm: std::ptr::null_mut(),
        };
        if unsafe { RegisterClassExW(&window_class) } == 0 {
            let error = unsafe { GetLastError() };
            return Err(ShellError::ClassRegistration(format!("RegisterClassExW failed with error {error}")));
        }

        let title = to_wide(MAIN_WINDOW_TITLE);
        let hwnd = unsafe {
            CreateWindowExW(
                WS_EX_TOOLWINDOW,
                class.as_ptr(),
                title.as_ptr(),
                WS_POPUP,
                0,
                0,
                0,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                instance,
                std::ptr::null(),
            )
        };
        if hwnd.is_null() {
            let error = unsafe { GetLastError() };
            unsafe {
                UnregisterClassW(class.as_ptr(), instance);
            }
            return Err(ShellError::WindowCreation(format!("CreateWindowExW failed with error {error}")));
        }
        unsafe {
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, MAGIC_USERDATA);
        }

        Ok(Self { hwnd, instance, class })
    }

    pub fn handle(&self) -> WindowHandle {
        handle(self.hwnd)
    }

    /// Routes window messages to `shell` until [`MainWindow::detach`]. The
    /// shell must outlive the attachment.
    pub fn attach(&self, shell: &Shell) {
        unsafe {
            SetWindowLongPtrW(self.hwnd, SHELL_SLOT, shell as *const Shell as isize);
        }
    }

    pub fn detach(&self) {
        unsafe {
            SetWindowLongPtrW(self.hwnd, SHELL_SLOT, 0);
        }
    }
}

impl Drop for MainWindow {
    fn drop(&mut self) {
        self.detach();
        unsafe {
            DestroyWindow(self.hwnd);
            UnregisterClassW(self.class.as_ptr(), self.instance);
        }
    }
}

unsafe fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

unsafe fn read_ids(ptr: *const u32) -> Vec<u32> {
    let mut ids = Vec::new();
    if ptr.is_null() {
        return ids;
    }
    let mut cursor = ptr;
    while *cursor != 0 {
        ids.push(*cursor);
        cursor = cursor.add(1);
    }
    ids
}

unsafe fn decode_request(msg: u32, wparam: WPARAM, lparam: LPARAM) -> ShellRequest {
    match msg {
        LM_SAVEDATA => {
            let (_, len) = split_data_param(wparam);
            let data = if lparam == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(lparam as *const u8, len as usize).to_vec()
            };
            ShellRequest::SaveData { wparam, data }
        }
        LM_RELOADMODULE | LM_UNLOADMODULE if lparam & LMM_HINSTANCE == 0 => {
            match read_c_str(wparam as *const c_char) {
                Some(path) => ShellRequest::module(
                    msg,
                    ModuleTarget::Path(path.into()),
                    LoadFlags::from_lparam(lparam),
                ),
                None => ShellRequest::Obsolete,
            }
        }
        LM_BANGCOMMAND => {
            if lparam == 0 {
                return ShellRequest::BangCommand(Vec::new());
            }
            // The tag is checked before the rest of the struct is touched.
            let tag = std::ptr::read_unaligned(lparam as *const u32);
            let bytes = if tag as usize == ENVELOPE_SIZE {
                std::slice::from_raw_parts(lparam as *const u8, ENVELOPE_SIZE).to_vec()
            } else {
                tag.to_le_bytes().to_vec()
            };
            ShellRequest::BangCommand(bytes)
        }
        WM_COPYDATA => {
            if lparam == 0 {
                return ShellRequest::Obsolete;
            }
            let data = &*(lparam as *const COPYDATASTRUCT);
            let payload = if data.lpData.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(data.lpData as *const u8, data.cbData as usize).to_vec()
            };
            ShellRequest::CopyData {
                tag: data.dwData,
                payload,
            }
        }
        LM_REGISTERMESSAGE | LM_UNREGISTERMESSAGE => {
            let window = WindowHandle(wparam as isize);
            let ids = read_ids(lparam as *const u32);
            if msg == LM_REGISTERMESSAGE {
                ShellRequest::RegisterMessages { window, ids }
            } else {
                ShellRequest::UnregisterMessages { window, ids }
            }
        }
        _ => ShellRequest::from_raw(msg, wparam, lparam),
    }
}

unsafe extern "system" fn main_window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    let shell = GetWindowLongPtrW(hwnd, SHELL_SLOT) as *const Shell;
    if shell.is_null() {
        return DefWindowProcW(hwnd, msg, wparam, lparam);
    }
    let shell = &*shell;

    match shell.handle_message(decode_request(msg, wparam, lparam)) {
        Reply::Value(value) => value,
        Reply::Restored(bytes) => {
            let (_, len) = split_data_param(wparam);
            if lparam != 0 {
                let count = bytes.len().min(len as usize);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), lparam as *mut u8, count);
            }
            1
        }
        Reply::Default => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

#[derive(Debug, Default)]
pub struct NativePump;

impl MessagePump for NativePump {
    type Message = MSG;

    fn next(&mut self) -> Option<LoopEvent<MSG>> {
        let mut msg: MSG = unsafe { std::mem::zeroed() };
        let result = unsafe { GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) };
        if result <= 0 {
            if result < 0 {
                tracing::error!(error = unsafe { GetLastError() }, "GetMessageW failed");
            }
            return None;
        }
        if msg.hwnd.is_null() {
            Some(LoopEvent::Thread(msg.message))
        } else {
            Some(LoopEvent::Window(msg))
        }
    }

    fn dispatch(&mut self, _shell: &Shell, message: MSG) {
        unsafe {
            TranslateMessage(&message);
            DispatchMessageW(&message);
        }
    }
}

pub struct RunningInstance {
    window: HWND,
}

impl RunningInstance {
    pub fn find() -> Option<Self> {
        let class = to_wide(MAIN_WINDOW_CLASS);
        let title = to_wide(MAIN_WINDOW_TITLE);
        let window = unsafe { FindWindowW(class.as_ptr(), title.as_ptr()) };
        (!window.is_null()).then_some(Self { window })
    }
}

impl CopyDataSink for RunningInstance {
    fn copy_data(&self, tag: usize, payload: &[u8]) -> bool {
        let data = COPYDATASTRUCT {
            dwData: tag,
            cbData: payload.len() as u32,
            lpData: payload.as_ptr() as *mut c_void,
        };
        unsafe {
            SendMessageW(self.window, WM_COPYDATA, 0, &data as *const COPYDATASTRUCT as LPARAM);
        }
        true
    }
}
