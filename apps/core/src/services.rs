use crate::config::Settings;
use crate::host::ShellHost;
use crate::messages::WindowHandle;

pub const BROADCAST_WINDOW: WindowHandle = WindowHandle(0xFFFF);
const TASKBAR_CREATED_MESSAGE: &str = "TaskbarCreated";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service '{name}' failed to start: {reason}")]
    StartFailed { name: &'static str, reason: String },
}

pub struct ServiceContext<'a> {
    pub main_window: WindowHandle,
    pub host: &'a dyn ShellHost,
}

pub trait Service {
    fn name(&self) -> &'static str;
    fn start(&mut self, ctx: &ServiceContext<'_>) -> Result<(), ServiceError>;
    fn stop(&mut self, ctx: &ServiceContext<'_>);
    fn release(&mut self) {}

    fn as_tray(&mut self) -> Option<&mut dyn SystemTray> {
        None
    }
}

pub trait SystemTray {
    fn send_system_tray(&mut self, host: &dyn ShellHost) -> isize;
}

struct ServiceEntry {
    service: Box<dyn Service>,
    started: bool,
}

#[derive(Default)]
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, services: Vec<Box<dyn Service>>) {
        self.entries = services
            .into_iter()
            .map(|service| ServiceEntry {
                service,
                started: false,
            })
            .collect();
    }

    pub fn start_all(&mut self, ctx: &ServiceContext<'_>) -> usize {
        let mut started = 0;
        for entry in &mut self.entries {
            match entry.service.start(ctx) {
                Ok(()) => {
                    entry.started = true;
                    started += 1;
                    tracing::info!(service = entry.service.name(), "service started");
                }
                Err(error) => tracing::warn!(%error, "service left stopped"),
            }
        }
        started
    }

    pub fn stop_all(&mut self, ctx: &ServiceContext<'_>) {
        for entry in self.entries.iter_mut().filter(|e| e.started) {
            entry.service.stop(ctx);
            entry.started = false;
            tracing::info!(service = entry.service.name(), "service stopped");
        }
    }

    pub fn cleanup(&mut self) {
        for entry in &mut self.entries {
            entry.service.release();
        }
        self.entries.clear();
    }

    pub fn tray(&mut self) -> Option<&mut dyn SystemTray> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.started)
            .find_map(|entry| entry.service.as_tray())
    }

    pub fn running(&self) -> usize {
        self.entries.iter().filter(|entry| entry.started).count()
    }
}

#[derive(Debug, Default)]
pub struct DdeStub {
    running: bool,
}

impl Service for DdeStub {
    fn name(&self) -> &'static str {
        "dde-stub"
    }

    fn start(&mut self, _ctx: &ServiceContext<'_>) -> Result<(), ServiceError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self, _ctx: &ServiceContext<'_>) {
        self.running = false;
    }
}

#[derive(Debug, Default)]
pub struct TrayService {
    taskbar_created: Option<u32>,
}

impl Service for TrayService {
    fn name(&self) -> &'static str {
        "tray"
    }

    fn start(&mut self, ctx: &ServiceContext<'_>) -> Result<(), ServiceError> {
        let id = ctx.host.register_window_message(TASKBAR_CREATED_MESSAGE);
        if id == 0 {
            return Err(ServiceError::StartFailed {
                name: self.name(),
                reason: format!("'{TASKBAR_CREATED_MESSAGE}' message unavailable"),
            });
        }
        self.taskbar_created = Some(id);
        Ok(())
    }

    fn stop(&mut self, _ctx: &ServiceContext<'_>) {
        self.taskbar_created = None;
    }

    fn as_tray(&mut self) -> Option<&mut dyn SystemTray> {
        Some(self)
    }
}

impl SystemTray for TrayService {
    fn send_system_tray(&mut self, host: &dyn ShellHost) -> isize {
        match self.taskbar_created {
            Some(id) => isize::from(host.post_message(BROADCAST_WINDOW, id, 0, 0)),
            None => 0,
        }
    }
}

pub fn default_services(settings: &Settings) -> Vec<Box<dyn Service>> {
    let mut services: Vec<Box<dyn Service>> = Vec::new();
    if settings.use_system_dde {
        services.push(Box::new(DdeStub::default()));
    } else {
        tracing::debug!("built-in messaging server not provided; slot left empty");
    }
    services.push(Box::new(TrayService::default()));
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockShellHost;
    use std::sync::{Arc, Mutex};

    fn names(registry: &ServiceRegistry) -> Vec<&'static str> {
        registry.entries.iter().map(|entry| entry.service.name()).collect()
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Service for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start(&mut self, _ctx: &ServiceContext<'_>) -> Result<(), ServiceError> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.fail {
                return Err(ServiceError::StartFailed {
                    name: self.name,
                    reason: "scripted".to_string(),
                });
            }
            Ok(())
        }

        fn stop(&mut self, _ctx: &ServiceContext<'_>) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }

        fn release(&mut self) {
            self.log.lock().unwrap().push(format!("release {}", self.name));
        }
    }

    #[test]
    fn stop_follows_start_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = MockShellHost::default();
        let ctx = ServiceContext {
            main_window: WindowHandle(1),
            host: &host,
        };
        let mut registry = ServiceRegistry::new();
        registry.init(vec![
            Box::new(Recording { name: "a", log: log.clone(), fail: false }),
            Box::new(Recording { name: "b", log: log.clone(), fail: true }),
            Box::new(Recording { name: "c", log: log.clone(), fail: false }),
        ]);

        assert_eq!(registry.start_all(&ctx), 2);
        registry.stop_all(&ctx);
        registry.cleanup();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start a", "start b", "start c", "stop a", "stop c", "release a", "release b",
                "release c"
            ]
        );
        assert!(names(&registry).is_empty());
    }

    #[test]
    fn tray_broadcasts_taskbar_created() {
        let host = MockShellHost::default();
        let ctx = ServiceContext {
            main_window: WindowHandle(1),
            host: &host,
        };
        let mut registry = ServiceRegistry::new();
        registry.init(default_services(&Settings::default()));
        registry.start_all(&ctx);

        let result = registry.tray().map(|tray| tray.send_system_tray(&host));

        assert_eq!(result, Some(1));
        let posted = host.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].window, BROADCAST_WINDOW);
        assert_eq!(posted[0].id, host.register_window_message("TaskbarCreated"));
    }

    #[test]
    fn dde_slot_follows_setting() {
        let settings = Settings {
            use_system_dde: false,
            ..Settings::default()
        };
        let mut registry = ServiceRegistry::new();
        registry.init(default_services(&settings));
        assert_eq!(names(&registry), vec!["tray"]);
    }
}
