pub mod bang;
pub mod cli;
pub mod config;
pub mod data_store;
pub mod envelope;
pub mod event_loop;
pub mod hooks;
pub mod host;
pub mod instance;
pub mod logging;
pub mod message_manager;
pub mod messages;
pub mod module_manager;
pub mod runtime;
pub mod services;
pub mod shell;
pub mod startup;
pub mod watchdog;
#[cfg(target_os = "windows")]
pub mod windows_shell;
