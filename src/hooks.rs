use std::time::Duration;

use log::warn;

use crate::error::SchemaGuardError;

/// Called with `(version, filename)` before a migration touches the database.
pub type PreMigrationHook = Box<dyn Fn(i64, &str) -> Result<(), SchemaGuardError> + Send>;

/// Called with `(version, filename, success, duration)` after an execution attempt.
pub type PostMigrationHook = Box<dyn Fn(i64, &str, bool, Duration) -> Result<(), SchemaGuardError> + Send>;

/// Ordered pre- and post-migration callbacks. Hooks run in registration order.
#[derive(Default)]
pub struct HookRegistry {
    pre_hooks: Vec<PreMigrationHook>,
    post_hooks: Vec<PostMigrationHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre_hook(&mut self, hook: PreMigrationHook) {
        self.pre_hooks.push(hook);
    }

    pub fn add_post_hook(&mut self, hook: PostMigrationHook) {
        self.post_hooks.push(hook);
    }

    pub fn pre_hook_count(&self) -> usize {
        self.pre_hooks.len()
    }

    pub fn post_hook_count(&self) -> usize {
        self.post_hooks.len()
    }

    /// Stops at the first failing hook; later hooks are not called.
    pub fn run_pre(&self, version: i64, filename: &str) -> Result<(), SchemaGuardError> {
        for (i, hook) in self.pre_hooks.iter().enumerate() {
            hook(version, filename).map_err(|e| SchemaGuardError::Hook {
                filename: filename.to_owned(),
                message: format!("pre-hook #{}: {}", i + 1, e),
            })?;
        }
        Ok(())
    }

    /// Every hook runs regardless of earlier failures. Failures are logged and counted,
    /// never propagated: the migration they observe has already been committed or failed.
    pub fn run_post(&self, version: i64, filename: &str, success: bool, duration: Duration) -> usize {
        let mut failures = 0;

        for (i, hook) in self.post_hooks.iter().enumerate() {
            if let Err(e) = hook(version, filename, success, duration) {
                warn!("Post-migration hook #{} failed for {}: {}", i + 1, filename, e);
                failures += 1;
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_pre_hooks_run_in_order_and_stop_on_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        for label in ["first", "second"] {
            let calls = Arc::clone(&calls);
            registry.add_pre_hook(Box::new(move |version, filename| {
                calls.lock().unwrap().push(format!("{}:{}:{}", label, version, filename));
                Ok(())
            }));
        }
        registry.add_pre_hook(Box::new(|_, _| Err(SchemaGuardError::Error("cache offline".into()))));
        {
            let calls = Arc::clone(&calls);
            registry.add_pre_hook(Box::new(move |_, _| {
                calls.lock().unwrap().push("never".into());
                Ok(())
            }));
        }

        let err = registry.run_pre(3, "003_x.sql").unwrap_err();

        assert!(matches!(err, SchemaGuardError::Hook { .. }));
        assert!(err.to_string().contains("pre-hook #3"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:3:003_x.sql".to_string(), "second:3:003_x.sql".to_string()]
        );
    }

    #[test]
    fn test_post_hook_failures_are_counted_not_propagated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        registry.add_post_hook(Box::new(|_, _, _, _| Err(SchemaGuardError::Error("metrics down".into()))));
        {
            let seen = Arc::clone(&seen);
            registry.add_post_hook(Box::new(move |version, _, success, duration| {
                seen.lock().unwrap().push((version, success, duration));
                Ok(())
            }));
        }

        let failures = registry.run_post(2, "002_y.sql", false, Duration::from_millis(12));

        assert_eq!(failures, 1);
        assert_eq!(*seen.lock().unwrap(), vec![(2, false, Duration::from_millis(12))]);
        assert_eq!(registry.pre_hook_count(), 0);
        assert_eq!(registry.post_hook_count(), 2);
    }
}
