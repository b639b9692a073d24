//! Typed ordered key/value persistence over sled.
//!
//! String keys map to JSON-serialized values. The engine is the only writer;
//! RPC handlers only read.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::chains::ChildChain;
use crate::errors::{NodeResult, PersistenceError};

/// Key layout.
pub mod keys {
    use super::ChildChain;

    pub const BLOCK_LATEST: &str = "bc.block.latest"; // current canonical tip
    pub const BLOCK_EARLIEST: &str = "bc.block.earliest"; // backward-sync frontier
    pub const APP_VERSION: &str = "appversion"; // {version, commit, db_version}
    pub const ROVERS: &str = "rovers"; // list of known chain tags

    /// Canonical block at a height.
    pub fn block_at(height: u64) -> String {
        format!("bc.block.{}", height)
    }

    /// Latest known tip of a rovered chain.
    pub fn chain_latest(chain: ChildChain) -> String {
        format!("{}.block.latest", chain)
    }

    /// Rover block data at a height (opt-in persistence).
    pub fn chain_block_at(chain: ChildChain, height: u64) -> String {
        format!("{}.block.{}", chain, height)
    }
}

/// Oldest database layout this build can open.
pub const MIN_DB_VERSION: (u64, u64, u64) = (0, 6, 0);

/// Exit code used when the on-disk layout predates `MIN_DB_VERSION`.
pub const EXIT_DB_VERSION: i32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppVersion {
    pub version: String,
    pub commit: String,
    pub db_version: String,
}

impl AppVersion {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            db_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let mut parts = v.split('.').map(|p| p.parse::<u64>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(path: &str) -> NodeResult<Self> {
        let db = sled::open(path).map_err(PersistenceError::Sled)?;
        Ok(Self { db })
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> NodeResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(PersistenceError::Sled)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> NodeResult<Option<T>> {
        match self.db.get(key.as_bytes()).map_err(PersistenceError::Sled)? {
            Some(bytes) => {
                let value =
                    serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Decode {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Like `get`, but a missing key is an error.
    pub fn get_required<T: DeserializeOwned>(&self, key: &str) -> NodeResult<T> {
        self.get(key)?
            .ok_or_else(|| PersistenceError::MissingKey(key.to_string()).into())
    }

    /// Batched multi-key get; result order matches the key order.
    pub fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> NodeResult<Vec<Option<T>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn delete(&self, key: &str) -> NodeResult<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(PersistenceError::Sled)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> NodeResult<bool> {
        Ok(self
            .db
            .contains_key(key.as_bytes())
            .map_err(PersistenceError::Sled)?)
    }

    pub fn flush(&self) -> NodeResult<()> {
        self.db.flush().map_err(PersistenceError::Sled)?;
        Ok(())
    }

    /// Checks the stored `appversion` record, writing the current one on
    /// first open. Returns false when the on-disk layout is too old to use;
    /// the caller is expected to exit with `EXIT_DB_VERSION`.
    pub fn check_db_version(&self) -> NodeResult<bool> {
        match self.get::<AppVersion>(keys::APP_VERSION)? {
            Some(stored) => {
                let ok = parse_version(&stored.db_version)
                    .map(|v| v >= MIN_DB_VERSION)
                    .unwrap_or(false);
                if !ok {
                    tracing::error!(
                        db_version = %stored.db_version,
                        required = %format!("{}.{}.{}", MIN_DB_VERSION.0, MIN_DB_VERSION.1, MIN_DB_VERSION.2),
                        "database layout too old"
                    );
                }
                Ok(ok)
            }
            None => {
                self.put(keys::APP_VERSION, &AppVersion::current())?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().to_str().unwrap()).expect("open");
        (dir, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = open_temp();
        store.put("k", &vec![1u64, 2, 3]).expect("put");
        let v: Vec<u64> = store.get("k").expect("get").expect("present");
        assert_eq!(v, vec![1, 2, 3]);
        assert!(store.get::<Vec<u64>>("missing").expect("get").is_none());
    }

    #[test]
    fn get_many_preserves_key_order() {
        let (_dir, store) = open_temp();
        store.put("a", &1u64).expect("put");
        store.put("c", &3u64).expect("put");
        let got: Vec<Option<u64>> = store
            .get_many(&["a".into(), "b".into(), "c".into()])
            .expect("get_many");
        assert_eq!(got, vec![Some(1), None, Some(3)]);
    }

    #[test]
    fn missing_required_key_is_persistence_error() {
        let (_dir, store) = open_temp();
        let err = store.get_required::<u64>("bc.block.latest").unwrap_err();
        assert!(err.to_string().contains("bc.block.latest"));
    }

    #[test]
    fn db_version_gate() {
        let (_dir, store) = open_temp();
        // Fresh store stamps the current version and passes.
        assert!(store.check_db_version().expect("check"));
        assert!(store.check_db_version().expect("check again"));

        // An old layout is refused.
        store
            .put(
                keys::APP_VERSION,
                &AppVersion {
                    version: "0.5.9".into(),
                    commit: "abc".into(),
                    db_version: "0.5.9".into(),
                },
            )
            .expect("put");
        assert!(!store.check_db_version().expect("check old"));
    }

    #[test]
    fn key_layout_shapes() {
        assert_eq!(keys::block_at(42), "bc.block.42");
        assert_eq!(keys::chain_latest(ChildChain::Btc), "btc.block.latest");
        assert_eq!(keys::chain_block_at(ChildChain::Wav, 7), "wav.block.7");
    }
}
