use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::host::ShellHost;
use crate::messages::{WindowHandle, LM_RECYCLE, LR_LOGOFF, LR_MSSHUTDOWN, LR_QUIT, LR_RECYCLE};

pub const HIDE_MODULES_BANG: &str = "!HideModules";
pub const SHOW_MODULES_BANG: &str = "!ShowModules";

pub struct BangContext<'a> {
    pub caller: WindowHandle,
    pub main_window: WindowHandle,
    pub host: &'a dyn ShellHost,
}

pub trait BangHandler: Send + Sync {
    fn execute(&self, ctx: &BangContext<'_>, args: &str);

    fn complete(&self, _ctx: &BangContext<'_>, _args: &str) {}
}

impl<F> BangHandler for F
where
    F: Fn(&BangContext<'_>, &str) + Send + Sync,
{
    fn execute(&self, ctx: &BangContext<'_>, args: &str) {
        self(ctx, args)
    }
}

#[derive(Clone)]
struct BangEntry {
    name: String,
    handler: Arc<dyn BangHandler>,
    threaded: bool,
}

#[derive(Default, Clone)]
pub struct BangTable {
    entries: HashMap<String, BangEntry>,
}

impl BangTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, handler: impl BangHandler + 'static) {
        self.insert(name, Arc::new(handler), false);
    }

    pub fn add_threaded(&mut self, name: &str, handler: impl BangHandler + 'static) {
        self.insert(name, Arc::new(handler), true);
    }

    fn insert(&mut self, name: &str, handler: Arc<dyn BangHandler>, threaded: bool) {
        self.entries.insert(
            fold(name),
            BangEntry {
                name: name.to_string(),
                handler,
                threaded,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    pub fn lookup(&self, name: &str) -> Option<(Arc<dyn BangHandler>, bool)> {
        self.entries
            .get(&fold(name))
            .map(|entry| (Arc::clone(&entry.handler), entry.threaded))
    }
}

impl std::fmt::Debug for BangTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BangTable").field("names", &self.names()).finish()
    }
}

fn fold(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

pub fn split_bang_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if !line.starts_with('!') || line.len() < 2 {
        return None;
    }
    match line.find(char::is_whitespace) {
        Some(split) => Some((&line[..split], line[split..].trim())),
        None => Some((line, "")),
    }
}

pub fn register_core_bangs(table: &mut BangTable) {
    table.add("!Recycle", |ctx: &BangContext<'_>, _: &str| post_recycle(ctx, LR_RECYCLE));
    table.add("!Quit", |ctx: &BangContext<'_>, _: &str| post_recycle(ctx, LR_QUIT));
    table.add("!Logoff", |ctx: &BangContext<'_>, _: &str| post_recycle(ctx, LR_LOGOFF));
    table.add("!ShutDown", |ctx: &BangContext<'_>, _: &str| post_recycle(ctx, LR_MSSHUTDOWN));
    table.add(HIDE_MODULES_BANG, |ctx: &BangContext<'_>, _: &str| {
        ctx.host.set_module_windows_visible(ctx.main_window, false);
    });
    table.add(SHOW_MODULES_BANG, |ctx: &BangContext<'_>, _: &str| {
        ctx.host.set_module_windows_visible(ctx.main_window, true);
    });
}

// Posted so the request runs after the current message returns.
fn post_recycle(ctx: &BangContext<'_>, mode: usize) {
    if !ctx.host.post_message(ctx.main_window, LM_RECYCLE, mode, 0) {
        tracing::warn!(mode, "failed to post recycle request");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BangDispatch {
    Executed,
    Spawned,
    NotFound,
}

/// Counts one in-flight threaded command; released when the command drops.
struct InFlightTicket(Arc<AtomicUsize>);

impl InFlightTicket {
    fn issue(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PendingThreadedCommand {
    pub command: String,
    pub args: String,
    pub origin: WindowHandle,
    handler: Arc<dyn BangHandler>,
    _ticket: InFlightTicket,
}

impl PendingThreadedCommand {
    pub fn complete(self, main_window: WindowHandle, host: &dyn ShellHost) {
        let ctx = BangContext {
            caller: self.origin,
            main_window,
            host,
        };
        self.handler.complete(&ctx, &self.args);
    }
}

impl std::fmt::Debug for PendingThreadedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingThreadedCommand")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("origin", &self.origin)
            .finish()
    }
}

#[derive(Debug)]
pub enum CompletionEvent {
    BangFinished(PendingThreadedCommand),
}

pub struct ThreadedBangs {
    sender: Sender<CompletionEvent>,
    receiver: Receiver<CompletionEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl Default for ThreadedBangs {
    fn default() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ThreadedBangs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(
        &self,
        command: &str,
        args: &str,
        origin: WindowHandle,
        handler: Arc<dyn BangHandler>,
        main_window: WindowHandle,
        host: Arc<dyn ShellHost>,
    ) -> std::io::Result<()> {
        let pending = PendingThreadedCommand {
            command: command.to_string(),
            args: args.to_string(),
            origin,
            handler,
            _ticket: InFlightTicket::issue(&self.in_flight),
        };
        let sender = self.sender.clone();
        let thread_name = format!("bang{}", command.trim_start_matches('!').to_ascii_lowercase());

        std::thread::Builder::new().name(thread_name).spawn(move || {
            {
                let ctx = BangContext {
                    caller: pending.origin,
                    main_window,
                    host: host.as_ref(),
                };
                pending.handler.execute(&ctx, &pending.args);
            }
            if sender.send(CompletionEvent::BangFinished(pending)).is_ok() {
                host.wake_main_thread();
            }
        })?;
        Ok(())
    }

    pub fn drain(&self) -> Vec<CompletionEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ThreadedBangs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedBangs")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
