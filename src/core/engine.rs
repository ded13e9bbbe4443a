// src/core/engine.rs

//! The data engine seam (A5). The actual in-memory key-value engine is an
//! external collaborator (spec §1 Out of scope); this module defines the
//! narrow interface the dispatcher and replication manager consume from
//! it and a minimal in-memory implementation so the crate runs end to end.

use bytes::Bytes;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::errors::CoreError;
use crate::core::protocol::frame::Reply;

/// A snapshot-friendly description of one stored value: its type tag and
/// an encoded byte form, matching the layout the snapshot blob records.
#[derive(Debug, Clone)]
pub struct EncodedValue {
    pub value_type: u8,
    pub encoded: Bytes,
    pub expiry_nanos: Option<i64>,
}

pub const TYPE_STRING: u8 = 0;

/// The engine seam: string get/set/del/incr plus the operations the
/// replication manager needs (flush, snapshot, restore, dbsize).
pub trait Engine: Send + Sync {
    fn dispatch(&self, db_index: usize, name: &str, args: &[Bytes]) -> Result<Reply, CoreError>;
    fn flush_db(&self, db_index: usize);
    fn flush_all(&self);
    fn dbsize(&self, db_index: usize) -> usize;
    /// Encodes every non-empty database into `(db_index, key, value)` triples
    /// for the snapshot writer.
    fn snapshot(&self) -> Vec<(u32, Bytes, EncodedValue)>;
    fn restore(&self, entries: Vec<(u32, Bytes, EncodedValue)>);
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A sharded-by-database in-memory string store, sufficient to drive the
/// replication/dispatch end-to-end scenarios. Anything beyond GET/SET/DEL/
/// INCR/EXPIRE/TTL/EXISTS/TYPE/KEYS is out of this crate's scope; a real
/// deployment plugs a full engine in behind the `Engine` trait.
pub struct InMemoryEngine {
    dbs: Vec<DashMap<Bytes, (Bytes, Option<i64>)>>,
}

impl InMemoryEngine {
    pub fn new(num_databases: usize) -> Self {
        Self {
            dbs: (0..num_databases).map(|_| DashMap::new()).collect(),
        }
    }

    fn db(&self, index: usize) -> &DashMap<Bytes, (Bytes, Option<i64>)> {
        &self.dbs[index]
    }

    fn is_expired(entry: &(Bytes, Option<i64>)) -> bool {
        matches!(entry.1, Some(exp) if exp <= now_nanos())
    }
}

impl Engine for InMemoryEngine {
    fn dispatch(&self, db_index: usize, name: &str, args: &[Bytes]) -> Result<Reply, CoreError> {
        let db = self.db(db_index);
        match name {
            "SET" => {
                let [key, value] = args else {
                    return Err(CoreError::WrongArgumentCount("SET".into()));
                };
                db.insert(key.clone(), (value.clone(), None));
                Ok(Reply::ok())
            }
            "GET" => {
                let [key] = args else {
                    return Err(CoreError::WrongArgumentCount("GET".into()));
                };
                match db.get(key) {
                    Some(entry) if !Self::is_expired(&entry) => {
                        Ok(Reply::Bulk(Some(entry.0.clone())))
                    }
                    _ => Ok(Reply::nil()),
                }
            }
            "DEL" | "UNLINK" => {
                let mut deleted = 0i64;
                for key in args {
                    if db.remove(key).is_some() {
                        deleted += 1;
                    }
                }
                Ok(Reply::Integer(deleted))
            }
            "EXISTS" => {
                let mut count = 0i64;
                for key in args {
                    if db.get(key).is_some_and(|e| !Self::is_expired(&e)) {
                        count += 1;
                    }
                }
                Ok(Reply::Integer(count))
            }
            "INCR" | "DECR" => {
                let [key] = args else {
                    return Err(CoreError::WrongArgumentCount(name.into()));
                };
                let delta = if name == "INCR" { 1 } else { -1 };
                let mut entry = db.entry(key.clone()).or_insert((Bytes::from_static(b"0"), None));
                let current: i64 = std::str::from_utf8(&entry.0)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CoreError::Engine("value is not an integer or out of range".into()))?;
                let next = current + delta;
                entry.0 = Bytes::from(next.to_string());
                Ok(Reply::Integer(next))
            }
            "TTL" | "PTTL" => {
                let [key] = args else {
                    return Err(CoreError::WrongArgumentCount(name.into()));
                };
                match db.get(key) {
                    None => Ok(Reply::Integer(-2)),
                    Some(entry) => match entry.1 {
                        None => Ok(Reply::Integer(-1)),
                        Some(exp) => {
                            let remaining_nanos = exp - now_nanos();
                            let value = if name == "TTL" {
                                remaining_nanos / 1_000_000_000
                            } else {
                                remaining_nanos / 1_000_000
                            };
                            Ok(Reply::Integer(value.max(0)))
                        }
                    },
                }
            }
            "EXPIRE" => {
                let [key, seconds] = args else {
                    return Err(CoreError::WrongArgumentCount("EXPIRE".into()));
                };
                let seconds: i64 = std::str::from_utf8(seconds)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| CoreError::Engine("value is not an integer or out of range".into()))?;
                if let Some(mut entry) = db.get_mut(key) {
                    entry.1 = Some(now_nanos() + seconds * 1_000_000_000);
                    Ok(Reply::Integer(1))
                } else {
                    Ok(Reply::Integer(0))
                }
            }
            "TYPE" => {
                let [key] = args else {
                    return Err(CoreError::WrongArgumentCount("TYPE".into()));
                };
                if db.get(key).is_some_and(|e| !Self::is_expired(&e)) {
                    Ok(Reply::Status("string".into()))
                } else {
                    Ok(Reply::Status("none".into()))
                }
            }
            "KEYS" => {
                let keys: Vec<Reply> = db
                    .iter()
                    .filter(|e| !Self::is_expired(e.value()))
                    .map(|e| Reply::Bulk(Some(e.key().clone())))
                    .collect();
                Ok(Reply::Array(keys))
            }
            _ => Err(CoreError::UnknownCommand(name.into())),
        }
    }

    fn flush_db(&self, db_index: usize) {
        self.db(db_index).clear();
    }

    fn flush_all(&self) {
        for db in &self.dbs {
            db.clear();
        }
    }

    fn dbsize(&self, db_index: usize) -> usize {
        self.db(db_index).len()
    }

    fn snapshot(&self) -> Vec<(u32, Bytes, EncodedValue)> {
        let mut out = Vec::new();
        for (index, db) in self.dbs.iter().enumerate() {
            for entry in db.iter() {
                if Self::is_expired(entry.value()) {
                    continue;
                }
                out.push((
                    index as u32,
                    entry.key().clone(),
                    EncodedValue {
                        value_type: TYPE_STRING,
                        encoded: entry.value().0.clone(),
                        expiry_nanos: entry.value().1,
                    },
                ));
            }
        }
        out
    }

    fn restore(&self, entries: Vec<(u32, Bytes, EncodedValue)>) {
        for (db_index, key, value) in entries {
            self.db(db_index as usize)
                .insert(key, (value.encoded, value.expiry_nanos));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let engine = InMemoryEngine::new(1);
        engine
            .dispatch(0, "SET", &[Bytes::from_static(b"k"), Bytes::from_static(b"v")])
            .unwrap();
        let reply = engine.dispatch(0, "GET", &[Bytes::from_static(b"k")]).unwrap();
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from_static(b"v"))));
    }

    #[test]
    fn snapshot_then_restore_preserves_dbsize() {
        let source = InMemoryEngine::new(1);
        source
            .dispatch(0, "SET", &[Bytes::from_static(b"k"), Bytes::from_static(b"v")])
            .unwrap();
        let snap = source.snapshot();
        let target = InMemoryEngine::new(1);
        target.restore(snap);
        assert_eq!(target.dbsize(0), 1);
    }
}
