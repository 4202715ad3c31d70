//! Background services that full isolation pauses.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// A sync-dependent background service the application runs alongside the
/// engine, such as a periodic pull or an upload worker.
pub trait BackgroundService: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Stops doing sync-dependent work until resumed.
    fn pause(&self, reason: &str);

    /// Resumes work.
    fn resume(&self);
}

/// Registered background services and their shared pause state.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn BackgroundService>>>,
    paused: AtomicBool,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. It is paused immediately if the registry is.
    pub fn register(&self, service: Arc<dyn BackgroundService>) {
        if self.is_paused() {
            service.pause("registered while isolated");
        }
        self.services.write().push(service);
    }

    /// Pauses every service. Returns false if already paused.
    pub fn pause_all(&self, reason: &str) -> bool {
        if self.paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        for service in self.services.read().iter() {
            info!(service = service.name(), reason, "pausing background service");
            service.pause(reason);
        }
        true
    }

    /// Resumes every service. Returns false if not paused.
    pub fn resume_all(&self) -> bool {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return false;
        }
        for service in self.services.read().iter() {
            info!(service = service.name(), "resuming background service");
            service.resume();
        }
        true
    }

    /// Returns true while services are paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns the names of registered services.
    pub fn names(&self) -> Vec<String> {
        self.services
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }
}

/// A [`BackgroundService`] backed by a flag the service's own loop checks.
#[derive(Debug)]
pub struct FlagService {
    name: String,
    paused: AtomicBool,
}

impl FlagService {
    /// Creates a running service.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paused: AtomicBool::new(false),
        }
    }

    /// Returns true while paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl BackgroundService for FlagService {
    fn name(&self) -> &str {
        &self.name
    }

    fn pause(&self, _reason: &str) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_resume_all() {
        let registry = ServiceRegistry::new();
        let pull = Arc::new(FlagService::new("pull"));
        let upload = Arc::new(FlagService::new("upload"));
        registry.register(pull.clone());
        registry.register(upload.clone());

        assert!(registry.pause_all("integrity failure"));
        assert!(!registry.pause_all("again"));
        assert!(pull.is_paused() && upload.is_paused());

        assert!(registry.resume_all());
        assert!(!pull.is_paused() && !upload.is_paused());
        assert_eq!(registry.names(), vec!["pull", "upload"]);
    }

    #[test]
    fn late_registration_inherits_pause() {
        let registry = ServiceRegistry::new();
        registry.pause_all("isolated");
        let late = Arc::new(FlagService::new("late"));
        registry.register(late.clone());
        assert!(late.is_paused());
    }
}
