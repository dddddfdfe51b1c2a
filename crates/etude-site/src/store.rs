//! User accounts behind a bounded handle pool.
//!
//! The table itself is a small file of `name<TAB>argon2-hash` lines kept in
//! memory. Handles to it are checked out of a [`StorePool`], which caps how
//! many Argon2 computations run at once; each one allocates its own memory
//! block, so an unbounded number of concurrent logins would be unbounded
//! memory.

use crate::error::{SiteError, SiteResult};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Fixed set of reusable values. Checkout blocks until one is free.
pub struct StorePool<T> {
    free: Mutex<Vec<T>>,
    available: Condvar,
    size: usize,
}

impl<T> StorePool<T> {
    pub fn new(items: Vec<T>) -> Self {
        let size = items.len();
        Self {
            free: Mutex::new(items),
            available: Condvar::new(),
            size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait up to `timeout` for a free item.
    pub fn get(&self, timeout: Duration) -> SiteResult<PoolGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = free.pop() {
                return Ok(PoolGuard {
                    pool: self,
                    item: Some(item),
                });
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(SiteError::PoolExhausted);
            }
            free = self
                .available
                .wait_timeout(free, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn put(&self, item: T) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
        self.available.notify_one();
    }
}

/// A checked-out pool item, returned on drop.
pub struct PoolGuard<'a, T> {
    pool: &'a StorePool<T>,
    item: Option<T>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item out.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

/// The in-memory user table and the file backing it.
struct UserTable {
    path: PathBuf,
    users: Mutex<HashMap<String, String>>,
}

impl UserTable {
    fn open(path: &Path) -> SiteResult<Self> {
        let users = match fs::read_to_string(path) {
            Ok(text) => text
                .lines()
                .filter_map(|line| line.split_once('\t'))
                .map(|(name, hash)| (name.to_string(), hash.to_string()))
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            users: Mutex::new(users),
        })
    }

    fn hash_of(&self, name: &str) -> Option<String> {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Add a user unless the name is taken. The file is appended while the
    /// lock is held so two registrations cannot both claim a name.
    fn insert(&self, name: &str, hash: String) -> SiteResult<bool> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(name) {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}\t{}", name, hash)?;
        users.insert(name.to_string(), hash);
        Ok(true)
    }
}

/// One pooled handle onto the shared user table.
pub struct UserConn {
    table: Arc<UserTable>,
    argon2: Argon2<'static>,
}

impl UserConn {
    pub fn login(&self, name: &str, password: &str) -> SiteResult<bool> {
        let Some(stored) = self.table.hash_of(name) else {
            debug!(user = name, "no such user");
            return Ok(false);
        };
        let parsed =
            PasswordHash::new(&stored).map_err(|e| SiteError::Hash(format!("invalid stored hash: {}", e)))?;
        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    pub fn register(&self, name: &str, password: &str) -> SiteResult<bool> {
        if self.table.hash_of(name).is_some() {
            debug!(user = name, "user name taken");
            return Ok(false);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| SiteError::Hash(format!("failed to hash password: {}", e)))?
            .to_string();
        self.table.insert(name, hash)
    }
}

/// Login and registration over a pool of [`UserConn`] handles.
pub struct UserStore {
    pool: StorePool<UserConn>,
    wait: Duration,
}

impl UserStore {
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> SiteResult<Self> {
        let table = Arc::new(UserTable::open(path.as_ref())?);
        let conns = (0..pool_size.max(1))
            .map(|_| UserConn {
                table: table.clone(),
                argon2: Argon2::default(),
            })
            .collect();
        info!(
            path = %path.as_ref().display(),
            pool_size,
            "user store ready"
        );
        Ok(Self {
            pool: StorePool::new(conns),
            wait: Duration::from_secs(5),
        })
    }

    pub fn pool(&self) -> &StorePool<UserConn> {
        &self.pool
    }

    /// Log in (`login == true`) or register. Empty credentials, names that
    /// cannot be stored, taken names and wrong passwords all fail.
    pub fn verify(&self, name: &str, password: &str, login: bool) -> SiteResult<bool> {
        if name.is_empty() || password.is_empty() {
            return Ok(false);
        }
        if name.contains(['\t', '\n', '\r']) {
            return Ok(false);
        }
        let conn = self.pool.get(self.wait)?;
        if login {
            conn.login(name, password)
        } else {
            conn.register(name, password)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn register_then_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path().join("users.db"), 2).unwrap();

        assert!(store.verify("alice", "s3cret", false).unwrap());
        assert!(store.verify("alice", "s3cret", true).unwrap());
        assert!(!store.verify("alice", "wrong", true).unwrap());
        // Name already taken.
        assert!(!store.verify("alice", "other", false).unwrap());
        assert!(!store.verify("bob", "s3cret", true).unwrap());
    }

    #[test]
    fn empty_credentials_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path().join("users.db"), 1).unwrap();
        assert!(!store.verify("", "pw", false).unwrap());
        assert!(!store.verify("carol", "", false).unwrap());
        assert!(!store.verify("tab\tname", "pw", false).unwrap());
    }

    #[test]
    fn users_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        {
            let store = UserStore::open(&path, 1).unwrap();
            assert!(store.verify("dave", "pw", false).unwrap());
        }
        let store = UserStore::open(&path, 1).unwrap();
        assert!(store.verify("dave", "pw", true).unwrap());
        assert!(!store.verify("dave", "pw", false).unwrap());
    }

    #[test]
    fn pool_hands_back_items_on_drop() {
        let pool = StorePool::new(vec![1, 2]);
        {
            let a = pool.get(Duration::from_millis(10)).unwrap();
            let b = pool.get(Duration::from_millis(10)).unwrap();
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.idle(), 0);
            assert!(matches!(
                pool.get(Duration::from_millis(10)),
                Err(SiteError::PoolExhausted)
            ));
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn waiter_wakes_when_item_returns() {
        let pool = Arc::new(StorePool::new(vec![7u32]));
        let held = pool.get(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || *pool.get(Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 7);
    }
}
