use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thingset::Store;

use crate::{Link, Result};

/// Link to the gateway's own node store, answered in-process.
pub struct LocalLink {
    store: Mutex<Store>,
}

impl LocalLink {
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Link for LocalLink {
    fn send(&self, request: &[u8], _address: u8, _timeout: Duration) -> Result<Vec<u8>> {
        let request = String::from_utf8_lossy(request);
        Ok(self.store().process(&request).into_bytes())
    }
}
