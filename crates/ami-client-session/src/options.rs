//! Runtime option store shared by the session components.

use ami_client_core::{OptionError, SessionOptions};
use parking_lot::RwLock;
use serde_json::Value;

/// Validated options behind a lock.
///
/// Components read through [`OptionStore::read`] at every use so runtime
/// changes apply to the next message, tick or connect attempt.
#[derive(Debug, Default)]
pub struct OptionStore {
    inner: RwLock<SessionOptions>,
}

impl OptionStore {
    /// Create a store holding `options`.
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        Self {
            inner: RwLock::new(options),
        }
    }

    /// Copy of the current options.
    #[must_use]
    pub fn snapshot(&self) -> SessionOptions {
        self.inner.read().clone()
    }

    /// Read the current options without copying them.
    pub fn read<R>(&self, f: impl FnOnce(&SessionOptions) -> R) -> R {
        f(&self.inner.read())
    }

    /// Read one option by its JSON name. `None` for unknown names.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().get(name)
    }

    /// Write one option by its JSON name.
    ///
    /// # Errors
    /// Returns error for unknown names or invalid values; nothing changes.
    pub fn set(&self, name: &str, value: Value) -> Result<(), OptionError> {
        self.inner.write().set(name, value)?;
        tracing::debug!(option = %name, "option updated");
        Ok(())
    }

    /// Merge a partial JSON object, returning the keys that were not applied.
    ///
    /// # Errors
    /// Returns error if `partial` is not a JSON object.
    pub fn merge(&self, partial: &Value) -> Result<Vec<String>, OptionError> {
        let Value::Object(map) = partial else {
            return Err(OptionError::InvalidValue {
                name: "options".to_string(),
                reason: format!("expected an object, got {partial}"),
            });
        };
        Ok(self.inner.write().merge(map))
    }
}
