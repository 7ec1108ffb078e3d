//! Pending context buffer ("data layer")
//!
//! External code pushes arbitrary JSON objects; the pool manager drains them
//! into the next lease request or context update.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::ContextMap;

/// Cloneable handle to a shared append-only buffer of context fragments.
#[derive(Debug, Clone, Default)]
pub struct DataLayer {
    fragments: Arc<Mutex<Vec<ContextMap>>>,
}

impl DataLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ContextMap>> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.fragments.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, fragment: ContextMap) {
        self.lock().push(fragment);
    }

    /// Put back context drained for a request that failed. It goes ahead of
    /// anything pushed since, so newer keys still win on the next drain.
    pub fn restore(&self, context: ContextMap) {
        self.lock().insert(0, context);
    }

    /// Push a JSON value; anything but an object is ignored.
    pub fn push_value(&self, value: serde_json::Value) -> bool {
        match value {
            serde_json::Value::Object(map) => {
                self.push(map);
                true
            }
            other => {
                tracing::debug!(value = %other, "Ignoring non-object data layer push");
                false
            }
        }
    }

    /// Merge every buffered fragment in arrival order (later keys win) and
    /// clear the buffer. `None` when nothing was buffered.
    pub fn drain(&self) -> Option<ContextMap> {
        let fragments = std::mem::take(&mut *self.lock());
        if fragments.is_empty() {
            return None;
        }

        let mut merged = ContextMap::new();
        for fragment in fragments {
            merged.extend(fragment);
        }
        Some(merged)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
