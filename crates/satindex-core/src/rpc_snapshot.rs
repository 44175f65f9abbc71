//! Read-only snapshot pointer handed to query callers.
//!
//! The compiler publishes a freshly built read model by swapping an `Arc`
//! under a write lock. Readers hold the read lock only long enough to clone
//! the `Arc`; they never traverse the model under the lock, so they cannot
//! stall the compiler.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

struct Published<R> {
    height: Option<u64>,
    model: Arc<R>,
}

pub struct RpcSnapshot<R> {
    current: RwLock<Published<R>>,
}

impl<R> RpcSnapshot<R> {
    pub fn new(height: Option<u64>, model: R) -> Self {
        Self {
            current: RwLock::new(Published {
                height,
                model: Arc::new(model),
            }),
        }
    }

    /// The currently published model.
    pub fn load(&self) -> Arc<R> {
        self.current.read().model.clone()
    }

    /// Compiling height the published model reflects.
    pub fn height(&self) -> Option<u64> {
        self.current.read().height
    }

    /// Publish `build()` if `height` differs from the published height.
    ///
    /// Returns `true` if a new model was published.
    pub fn refresh_if_advanced(&self, height: Option<u64>, build: impl FnOnce() -> R) -> bool {
        if self.height() == height {
            return false;
        }
        self.publish(height, build());
        true
    }

    /// Publish unconditionally (reorg recovery may move the height back).
    pub fn publish(&self, height: Option<u64>, model: R) {
        let model = Arc::new(model);
        let mut current = self.current.write();
        current.height = height;
        current.model = model;
        debug!(?height, "read snapshot published");
    }
}
