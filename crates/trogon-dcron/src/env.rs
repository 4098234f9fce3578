//! Environment access behind a trait so configuration can be tested without
//! touching the process environment.

use std::collections::HashMap;
use std::env::VarError;
use std::sync::{Mutex, PoisonError};

pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, VarError>;
}

/// Zero-sized type, delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, VarError> {
        std::env::var(key)
    }
}

/// Process-independent variables for tests. `Mutex`-backed so it can be shared
/// with multi-threaded `#[tokio::test]`s.
#[derive(Default)]
pub struct InMemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl InMemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

impl ReadEnv for InMemoryEnv {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or(VarError::NotPresent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_env_set_get_remove() {
        let env = InMemoryEnv::new();
        env.set("DCRON_NAMESPACE", "svc");
        assert_eq!(env.var("DCRON_NAMESPACE").unwrap(), "svc");

        env.remove("DCRON_NAMESPACE");
        assert!(matches!(env.var("DCRON_NAMESPACE"), Err(VarError::NotPresent)));
    }

    #[test]
    fn system_env_matches_std() {
        assert_eq!(SystemEnv.var("PATH").is_ok(), std::env::var("PATH").is_ok());
    }
}
