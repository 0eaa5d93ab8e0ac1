//! Narinfo rows in the metadata store, keyed by URL path.

use serde::{Deserialize, Serialize};

use crate::kv::{ANY_VERSION, Kv, KvError};
use crate::nix::narinfo::{NarInfo, NarInfoError};

#[derive(Debug, thiserror::Error)]
pub enum NixDbError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("stored narinfo is corrupt: {0}")]
    Corrupt(#[from] NarInfoError),
}

/// Values are stored as the serialized narinfo text so the GET path
/// can replay the record byte-exactly.
#[derive(Debug, Serialize, Deserialize)]
struct NarInfoRecord {
    ni: String,
}

#[derive(Clone)]
pub struct NixDb {
    kv: Kv,
}

impl NixDb {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// `narinfo_path` is the URL path below the ecosystem prefix,
    /// e.g. `/16hvpw4b3r05girazh4rnwbw0jgjkb4l.narinfo`.
    pub async fn get(&self, narinfo_path: &str) -> Result<Option<NarInfo>, NixDbError> {
        match self.kv.get::<NarInfoRecord>(narinfo_path).await? {
            Some((record, _)) => Ok(Some(NarInfo::parse(&record.ni)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, narinfo_path: &str, ni: &NarInfo) -> Result<(), NixDbError> {
        let record = NarInfoRecord { ni: ni.to_string() };
        self.kv.put(narinfo_path, ANY_VERSION, &record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::SqliteKv;

    #[tokio::test]
    async fn narinfo_survives_a_store_round_trip() {
        let db = NixDb::new(Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap())));
        let ni = NarInfo {
            store_path: "/nix/store/16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05".to_string(),
            url: "nar/0v1p2gdn.nar.xz".to_string(),
            compression: "xz".to_string(),
            nar_hash: "sha256:1f2jryqw".to_string(),
            nar_size: 80256,
            ..NarInfo::default()
        };

        let path = "/16hvpw4b3r05girazh4rnwbw0jgjkb4l.narinfo";
        db.put(path, &ni).await.unwrap();
        let loaded = db.get(path).await.unwrap().unwrap();
        assert_eq!(loaded, ni);

        assert!(db.get("/missing.narinfo").await.unwrap().is_none());
    }
}
