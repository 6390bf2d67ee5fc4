// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance cancellation registry and lock keys.
//!
//! The cluster-wide advisory lock itself lives behind the store contract;
//! this module owns the engine-local side: the stable 64-bit key an
//! instance id hashes to, and the registry of cancellation tokens that lets
//! other paths interrupt whichever task currently holds an instance's lock
//! on this node.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

/// Stable 64-bit advisory-lock key for an instance id.
pub fn lock_key(instance_id: &str) -> i64 {
    let digest = Sha256::digest(instance_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Registry of per-instance cancellation signals.
///
/// One entry exists per instance lock held on this node. Only insert,
/// lookup, and delete happen under the mutex; firing a token never blocks.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh cancellation token for an instance, replacing (and
    /// firing) any stale entry.
    pub fn register(&self, instance_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let stale = self
            .inner
            .lock()
            .expect("cancel registry poisoned")
            .insert(instance_id.to_string(), token.clone());
        if let Some(stale) = stale {
            stale.cancel();
        }
        token
    }

    /// Remove and fire the token for an instance. Returns whether an entry
    /// existed.
    pub fn cancel(&self, instance_id: &str) -> bool {
        let token = self
            .inner
            .lock()
            .expect("cancel registry poisoned")
            .remove(instance_id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable() {
        let a = lock_key("ns/wf/AbCdEf");
        let b = lock_key("ns/wf/AbCdEf");
        assert_eq!(a, b);
    }

    #[test]
    fn test_lock_key_differs_between_instances() {
        assert_ne!(lock_key("ns/wf/AbCdEf"), lock_key("ns/wf/AbCdEg"));
    }

    #[test]
    fn test_register_and_cancel() {
        let registry = CancelRegistry::new();
        let token = registry.register("ns/wf/AbCdEf");
        assert!(!token.is_cancelled());
        assert!(registry.cancel("ns/wf/AbCdEf"));
        assert!(token.is_cancelled());
        // second cancel finds nothing
        assert!(!registry.cancel("ns/wf/AbCdEf"));
    }

    #[test]
    fn test_register_replaces_and_fires_stale_token() {
        let registry = CancelRegistry::new();
        let stale = registry.register("ns/wf/AbCdEf");
        let fresh = registry.register("ns/wf/AbCdEf");
        assert!(stale.is_cancelled());
        assert!(!fresh.is_cancelled());
    }
}
