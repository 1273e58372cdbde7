pub const LM_SHUTDOWN: u32 = 8889;
pub const LM_SAVEDATA: u32 = 8892;
pub const LM_RESTOREDATA: u32 = 8893;
pub const LM_SYSTRAYREADY: u32 = 9215;

// Obsolete; answered with zero.
pub const LM_GETLSOBJECT: u32 = 9250;
pub const LM_WINDOWLIST: u32 = 9251;
pub const LM_DATASTORE: u32 = 9252;
pub const LM_MESSAGEMANAGER: u32 = 9253;

pub const LM_RECYCLE: u32 = 9260;
pub const LM_REGISTERMESSAGE: u32 = 9263;
pub const LM_UNREGISTERMESSAGE: u32 = 9264;
pub const LM_GETREVID: u32 = 9265;
pub const LM_UNLOADMODULE: u32 = 9266;
pub const LM_RELOADMODULE: u32 = 9267;
pub const LM_REGISTERHOOKMESSAGE: u32 = 9268;
pub const LM_UNREGISTERHOOKMESSAGE: u32 = 9269;
pub const LM_GETMAINWINDOW: u32 = 9270;

pub const LM_BANGCOMMAND: u32 = 9420;
pub const LM_THREAD_BANGCOMMAND: u32 = 9430;

pub const LM_SHELLHOOK_BASE: u32 = 9500;
pub const LM_WINDOWCREATED: u32 = 9501;
pub const LM_WINDOWDESTROYED: u32 = 9502;
pub const LM_ACTIVATESHELLWINDOW: u32 = 9503;
pub const LM_WINDOWACTIVATED: u32 = 9504;

// wParam values of LM_RECYCLE.
pub const LR_RECYCLE: usize = 0;
pub const LR_LOGOFF: usize = 1;
pub const LR_QUIT: usize = 2;
pub const LR_MSSHUTDOWN: usize = 3;

/// Set in lParam of LM_RELOADMODULE / LM_UNLOADMODULE when wParam is a module
/// handle rather than a path.
pub const LMM_HINSTANCE: isize = 0x1000;

// Standard window messages the shell reacts to.
pub const WM_QUERYENDSESSION: u32 = 0x0011;
pub const WM_ENDSESSION: u32 = 0x0016;
pub const WM_COPYDATA: u32 = 0x004A;
pub const WM_KEYDOWN: u32 = 0x0100;
pub const WM_SYSCOMMAND: u32 = 0x0112;
pub const WM_USER: u32 = 0x0400;

pub const SC_CLOSE: usize = 0xF060;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WindowHandle(pub isize);

impl WindowHandle {
    pub const NULL: WindowHandle = WindowHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadFlags(pub u32);

impl LoadFlags {
    pub const NONE: LoadFlags = LoadFlags(0);
    pub const THREADED: LoadFlags = LoadFlags(0x0001);

    pub fn from_lparam(lparam: isize) -> Self {
        Self((lparam & !LMM_HINSTANCE) as u32)
    }

    pub fn contains(self, other: LoadFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Maps a raw shell-hook notification onto the synthetic `LM_SHELLHOOK_BASE`
/// range. Returns `(id, wparam, lparam)` where wparam carries the subject window
/// and lparam the high byte of the hook code.
pub fn remap_shell_hook(wparam: usize, lparam: isize) -> (u32, usize, isize) {
    let code = (wparam & 0xFFFF) as u32;
    let id = (code & 0x00FF) + LM_SHELLHOOK_BASE;
    let flags = (code & 0xFF00) as isize;
    (id, lparam as usize, flags)
}
