//! Launch-at-login capability
//!
//! Registering with the OS login items is platform integration that lives
//! outside this crate. The supervisor only queries and toggles it.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait AutoLaunch: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool) -> std::io::Result<()>;
}

/// Process-local flag, for hosts without login-item integration
#[derive(Debug, Default)]
pub struct InMemoryAutoLaunch {
    enabled: AtomicBool,
}

impl InMemoryAutoLaunch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }
}

impl AutoLaunch for InMemoryAutoLaunch {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) -> std::io::Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}
