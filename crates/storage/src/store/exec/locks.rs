#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};

use super::super::StoreError;

const KEY_MASK: u64 = (1 << 60) - 1;

/// 60-bit key derived from the SHA-256 of `name`.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let masked = u64::from_be_bytes(prefix) & KEY_MASK;
    i64::try_from(masked).unwrap_or(i64::MAX)
}

/// Named mutual exclusion scoped to one store.
#[derive(Debug, Default)]
pub struct AdvisoryLocks {
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, name: &str, deadline: Instant) -> Result<AdvisoryLockGuard<'_>, StoreError> {
        let key = lock_key(name);
        let mut held = self.held.lock();
        while held.contains(&key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&key) {
                tracing::warn!(lock = name, key, "advisory lock timed out");
                return Err(StoreError::LockTimeout { key });
            }
        }
        held.insert(key);
        tracing::debug!(lock = name, key, "advisory lock acquired");
        Ok(AdvisoryLockGuard { locks: self, key })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().contains(&lock_key(name))
    }
}

#[derive(Debug)]
pub struct AdvisoryLockGuard<'a> {
    locks: &'a AdvisoryLocks,
    key: i64,
}

impl AdvisoryLockGuard<'_> {
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for AdvisoryLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn keys_are_stable_and_fit_in_sixty_bits() {
        let a = lock_key("history:roads");
        assert_eq!(a, lock_key("history:roads"));
        assert_ne!(a, lock_key("history:rivers"));
        assert!((0..=KEY_MASK as i64).contains(&a));
    }

    #[test]
    fn second_acquire_waits_until_release() {
        let locks = AdvisoryLocks::new();
        let guard = locks
            .acquire("x", Instant::now() + Duration::from_secs(1))
            .expect("first acquire");
        let err = locks
            .acquire("x", Instant::now() + Duration::from_millis(20))
            .expect_err("held lock must time out");
        assert!(matches!(err, StoreError::LockTimeout { key } if key == guard.key()));
        drop(guard);
        assert!(!locks.is_held("x"));
        locks
            .acquire("x", Instant::now() + Duration::from_millis(20))
            .expect("released lock is free");
    }
}
