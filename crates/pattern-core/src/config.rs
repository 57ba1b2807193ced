//! Hot-reloadable configuration holder.

use std::sync::{Arc, RwLock};

use crate::error::{CoreError, CoreResult};

/// Configuration sections check their own bounds.
pub trait Validate {
    fn validate(&self) -> CoreResult<()>;
}

/// Shared, swappable configuration.
///
/// Readers take a cheap `Arc` snapshot and keep using it for the whole
/// evaluation; a reload only affects evaluations started afterwards.
#[derive(Debug)]
pub struct ConfigHandle<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Validate> ConfigHandle<T> {
    /// Fails if the initial configuration is invalid.
    pub fn new(config: T) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    pub fn snapshot(&self) -> Arc<T> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validate, then swap. On error the previous configuration stays active.
    pub fn reload(&self, config: T) -> CoreResult<()> {
        if let Err(e) = config.validate() {
            tracing::warn!("Rejected configuration reload: {}", e);
            return Err(e);
        }
        let mut guard = self
            .inner
            .write()
            .map_err(|_| CoreError::Storage("config lock poisoned".to_string()))?;
        *guard = Arc::new(config);
        tracing::info!("Configuration reloaded");
        Ok(())
    }
}

/// Shared bound check used by every config section.
pub fn ensure_range(field: &str, value: f64, min: f64, max: f64) -> CoreResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(CoreError::config(
            field,
            format!("{} is outside [{}, {}]", value, min, max),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Limits {
        floor: f64,
    }

    impl Validate for Limits {
        fn validate(&self) -> CoreResult<()> {
            ensure_range("floor", self.floor, 0.0, 1.0)
        }
    }

    #[test]
    fn test_invalid_initial_config_is_fatal() {
        assert!(ConfigHandle::new(Limits { floor: -1.0 }).is_err());
    }

    #[test]
    fn test_bad_reload_keeps_previous() {
        let handle = ConfigHandle::new(Limits { floor: 0.5 }).unwrap();
        let reader = handle.clone();
        assert!(handle.reload(Limits { floor: 2.0 }).is_err());
        assert_eq!(reader.snapshot().floor, 0.5);

        handle.reload(Limits { floor: 0.25 }).unwrap();
        assert_eq!(reader.snapshot().floor, 0.25);
    }

    #[test]
    fn test_nan_is_rejected() {
        assert!(ensure_range("x", f64::NAN, 0.0, 1.0).is_err());
    }
}
