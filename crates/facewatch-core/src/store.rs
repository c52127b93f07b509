//! SQLite-backed identity database.
//!
//! The whole database is loaded and validated once at open, then served from
//! memory. Every mutation is written in a single transaction before the
//! in-memory copy changes, so a failed write leaves both sides untouched.

use crate::encoder::EncoderParams;
use crate::types::{PersonRecord, Signature};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const META_SIGNATURE_LEN: &str = "signature_len";
const META_ENCODER: &str = "encoder";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database corrupt: {0}")]
    Corrupt(String),
    #[error("database error: signature has {actual} values, database holds {expected}-value signatures")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("database error: built with encoder {stored:?}, configured encoder is {configured:?}")]
    EncoderMismatch {
        stored: EncoderParams,
        configured: EncoderParams,
    },
    #[error("database error: no signatures given for {0:?}")]
    EmptyEnrollment(String),
    #[error("database error: signature holds negative or non-finite values")]
    InvalidSignature,
    #[error("database error: invalid identity name {0:?}")]
    InvalidName(String),
    #[error("database error: no identity named {0:?}")]
    NotFound(String),
    #[error("database error: identity {name:?} has no signature #{index}")]
    NoSuchSignature { name: String, index: usize },
    #[error("database error: sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database error: {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// What to do with an existing record when an identity is enrolled again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnrollMode {
    /// Keep existing signatures and add the new ones.
    #[default]
    Append,
    /// Drop the existing record and store only the new signatures.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub people: usize,
    pub signatures: usize,
    pub avg_signatures_per_person: f32,
}

/// Readable summary of one enrolled identity, without signature data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub name: String,
    pub signatures: usize,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inspection export of the whole database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseExport {
    pub stats: DatabaseStats,
    pub encoder: Option<EncoderParams>,
    pub signature_len: Option<usize>,
    pub people: Vec<PersonSummary>,
}

/// Identity name → enrolled signatures, persisted in SQLite.
pub struct Database {
    conn: Connection,
    records: BTreeMap<String, PersonRecord>,
    signature_len: Option<usize>,
    encoder: Option<EncoderParams>,
    backup_dir: Option<PathBuf>,
}

impl Database {
    /// Open (creating if absent) and fully load the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let db = Self::load(conn)?;
        tracing::info!(
            path = %path.display(),
            people = db.records.len(),
            "identity database loaded"
        );
        Ok(db)
    }

    /// Non-persistent database, mainly for tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::load(Connection::open_in_memory()?)
    }

    fn load(conn: Connection) -> Result<Self, StoreError> {
        ensure_schema(&conn).map_err(corrupt)?;

        let signature_len = match read_meta(&conn, META_SIGNATURE_LEN).map_err(corrupt)? {
            Some(v) => Some(v.parse::<usize>().map_err(|e| {
                StoreError::Corrupt(format!("meta signature_len {v:?}: {e}"))
            })?),
            None => None,
        };
        let encoder = match read_meta(&conn, META_ENCODER).map_err(corrupt)? {
            Some(v) => Some(serde_json::from_str::<EncoderParams>(&v).map_err(|e| {
                StoreError::Corrupt(format!("meta encoder {v:?}: {e}"))
            })?),
            None => None,
        };

        let records = load_records(&conn, signature_len)?;

        Ok(Self {
            conn,
            records,
            signature_len,
            encoder,
            backup_dir: None,
        })
    }

    /// Write a timestamped snapshot into `dir` after every committed mutation.
    /// A failed snapshot is logged and does not fail the mutation.
    pub fn set_backup_dir(&mut self, dir: Option<PathBuf>) {
        self.backup_dir = dir;
    }

    /// Check that signatures from `params` are comparable with the stored ones.
    pub fn check_encoder(&self, params: &EncoderParams) -> Result<(), StoreError> {
        if let Some(stored) = self.encoder {
            if stored != *params {
                return Err(StoreError::EncoderMismatch {
                    stored,
                    configured: *params,
                });
            }
        }
        match self.signature_len {
            Some(len) if len != params.signature_len() => Err(StoreError::DimensionMismatch {
                expected: len,
                actual: params.signature_len(),
            }),
            _ => Ok(()),
        }
    }

    /// Bind the database to an encoder configuration.
    ///
    /// The first call on a fresh database records `params`; later opens must
    /// present the same parameters.
    pub fn ensure_encoder(&mut self, params: &EncoderParams) -> Result<(), StoreError> {
        self.check_encoder(params)?;
        if self.encoder.is_some() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        write_encoder(&tx, params)?;
        tx.commit()?;
        self.encoder = Some(*params);
        Ok(())
    }

    /// Append one signature to `name`, creating the record if needed.
    pub fn add(&mut self, name: &str, signature: Signature) -> Result<(), StoreError> {
        self.enroll(name, vec![signature], EnrollMode::Append)
            .map(|_| ())
    }

    /// Commit a set of signatures for `name` atomically: all or nothing.
    pub fn enroll(
        &mut self,
        name: &str,
        signatures: Vec<Signature>,
        mode: EnrollMode,
    ) -> Result<&PersonRecord, StoreError> {
        self.commit_enrollment(name, signatures, mode, None)
    }

    /// Like [`enroll`](Self::enroll) for signatures produced with `params`.
    /// An unbound database is bound to `params` in the same transaction.
    pub fn enroll_encoded(
        &mut self,
        name: &str,
        signatures: Vec<Signature>,
        mode: EnrollMode,
        params: &EncoderParams,
    ) -> Result<&PersonRecord, StoreError> {
        self.commit_enrollment(name, signatures, mode, Some(params))
    }

    fn commit_enrollment(
        &mut self,
        name: &str,
        signatures: Vec<Signature>,
        mode: EnrollMode,
        params: Option<&EncoderParams>,
    ) -> Result<&PersonRecord, StoreError> {
        validate_name(name)?;
        if signatures.is_empty() {
            return Err(StoreError::EmptyEnrollment(name.to_string()));
        }
        if let Some(params) = params {
            self.check_encoder(params)?;
            if let Some(sig) = signatures.iter().find(|s| s.len() != params.signature_len()) {
                return Err(StoreError::DimensionMismatch {
                    expected: params.signature_len(),
                    actual: sig.len(),
                });
            }
        }
        let len = self.check_dimensions(&signatures)?;
        let bind_encoder = params.filter(|_| self.encoder.is_none()).copied();

        let now = Utc::now();
        let replacing = mode == EnrollMode::Replace;
        let existing = if replacing {
            None
        } else {
            self.records.get(name)
        };
        let enrolled_at = existing.map(|r| r.enrolled_at).unwrap_or(now);
        let first_seq = existing.map(|r| r.signatures.len()).unwrap_or(0);

        let tx = self.conn.transaction()?;
        if replacing {
            delete_person(&tx, name)?;
        }
        tx.execute(
            "INSERT INTO persons (name, enrolled_at, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET updated_at = excluded.updated_at",
            params![name, enrolled_at.to_rfc3339(), now.to_rfc3339()],
        )?;
        for (i, sig) in signatures.iter().enumerate() {
            insert_signature(&tx, name, first_seq + i, sig)?;
        }
        if let Some(len) = len {
            if self.signature_len.is_none() {
                write_meta(&tx, META_SIGNATURE_LEN, &len.to_string())?;
            }
        }
        if let Some(params) = &bind_encoder {
            write_encoder(&tx, params)?;
        }
        tx.commit()?;

        if len.is_some() {
            self.signature_len = len;
        }
        if bind_encoder.is_some() {
            self.encoder = bind_encoder;
        }
        self.snapshot();
        let added = signatures.len();
        if replacing {
            self.records.remove(name);
        }
        let record = self.records.entry(name.to_string()).or_insert_with(|| PersonRecord {
            name: name.to_string(),
            signatures: Vec::new(),
            enrolled_at,
            updated_at: now,
        });
        record.signatures.extend(signatures);
        record.updated_at = now;

        tracing::info!(name, added, total = record.signatures.len(), ?mode, "identity stored");
        Ok(record)
    }

    /// Delete the whole record. Returns false if the name was not enrolled.
    pub fn remove(&mut self, name: &str) -> Result<bool, StoreError> {
        if !self.records.contains_key(name) {
            return Ok(false);
        }

        let tx = self.conn.transaction()?;
        delete_person(&tx, name)?;
        tx.commit()?;

        self.records.remove(name);
        tracing::info!(name, "identity removed");
        self.snapshot();
        Ok(true)
    }

    /// Remove one signature (by position) from a record; the record stays.
    pub fn remove_signature(&mut self, name: &str, index: usize) -> Result<(), StoreError> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if index >= record.signatures.len() {
            return Err(StoreError::NoSuchSignature {
                name: name.to_string(),
                index,
            });
        }

        let mut remaining = record.signatures.clone();
        remaining.remove(index);
        let now = Utc::now();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM signatures WHERE person = ?1", params![name])?;
        for (seq, sig) in remaining.iter().enumerate() {
            insert_signature(&tx, name, seq, sig)?;
        }
        tx.execute(
            "UPDATE persons SET updated_at = ?2 WHERE name = ?1",
            params![name, now.to_rfc3339()],
        )?;
        tx.commit()?;

        if let Some(record) = self.records.get_mut(name) {
            record.signatures = remaining;
            record.updated_at = now;
        }
        self.snapshot();
        Ok(())
    }

    /// Delete every identity. Encoder binding is kept; the signature length
    /// is forgotten along with the signatures.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM signatures", [])?;
        tx.execute("DELETE FROM persons", [])?;
        tx.execute("DELETE FROM meta WHERE key = ?1", params![META_SIGNATURE_LEN])?;
        tx.commit()?;

        let removed = self.records.len();
        self.records.clear();
        self.signature_len = None;
        tracing::info!(removed, "identity database cleared");
        self.snapshot();
        Ok(removed)
    }

    /// Names, counts and timestamps of every record, for inspection.
    pub fn export_metadata(&self) -> DatabaseExport {
        DatabaseExport {
            stats: self.stats(),
            encoder: self.encoder,
            signature_len: self.signature_len,
            people: self
                .records
                .values()
                .map(|r| PersonSummary {
                    name: r.name.clone(),
                    signatures: r.signatures.len(),
                    enrolled_at: r.enrolled_at,
                    updated_at: r.updated_at,
                })
                .collect(),
        }
    }

    /// Write a consistent copy of the database to `path`, which must not exist.
    pub fn backup_to(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let target = path.to_string_lossy().into_owned();
        self.conn.execute("VACUUM INTO ?1", params![target])?;
        Ok(())
    }

    fn snapshot(&self) {
        let Some(dir) = &self.backup_dir else {
            return;
        };
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let path = dir.join(format!("faces-{stamp}.db"));
        match self.backup_to(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "database snapshot written"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "database snapshot failed"),
        }
    }

    /// All enrolled identity names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PersonRecord> {
        self.records.get(name)
    }

    pub fn records(&self) -> impl Iterator<Item = &PersonRecord> {
        self.records.values()
    }

    /// Every (identity, signature) pair. Lazy and restartable: call again to
    /// iterate from the start.
    pub fn all_signatures(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.records
            .values()
            .flat_map(|r| r.signatures.iter().map(move |s| (r.name.as_str(), s)))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Length shared by every stored signature, once any has been stored.
    pub fn signature_len(&self) -> Option<usize> {
        self.signature_len
    }

    pub fn encoder_params(&self) -> Option<&EncoderParams> {
        self.encoder.as_ref()
    }

    pub fn stats(&self) -> DatabaseStats {
        let people = self.records.len();
        let signatures = self.records.values().map(|r| r.signatures.len()).sum();
        DatabaseStats {
            people,
            signatures,
            avg_signatures_per_person: if people > 0 {
                signatures as f32 / people as f32
            } else {
                0.0
            },
        }
    }

    /// Check that a batch agrees with itself and with the stored length.
    fn check_dimensions(&self, signatures: &[Signature]) -> Result<Option<usize>, StoreError> {
        let mut expected = self.signature_len;
        for sig in signatures {
            if sig.values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(StoreError::InvalidSignature);
            }
            if sig.is_empty() {
                return Err(StoreError::DimensionMismatch {
                    expected: expected.unwrap_or(0),
                    actual: 0,
                });
            }
            match expected {
                Some(len) if len != sig.len() => {
                    return Err(StoreError::DimensionMismatch {
                        expected: len,
                        actual: sig.len(),
                    })
                }
                _ => expected = Some(sig.len()),
            }
        }
        Ok(expected)
    }
}

fn corrupt(e: rusqlite::Error) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() || name.trim() != name {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS persons (
          name TEXT PRIMARY KEY,
          enrolled_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS signatures (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          person TEXT NOT NULL,
          seq INTEGER NOT NULL,
          data BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_signatures_person ON signatures(person, seq);
        "#,
    )
}

fn read_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

fn write_meta(tx: &Transaction<'_>, key: &str, value: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn write_encoder(tx: &Transaction<'_>, params: &EncoderParams) -> Result<(), StoreError> {
    let json = serde_json::to_string(params)
        .map_err(|e| StoreError::Corrupt(format!("encoder params: {e}")))?;
    write_meta(tx, META_ENCODER, &json)?;
    Ok(())
}

fn delete_person(tx: &Transaction<'_>, name: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM signatures WHERE person = ?1", params![name])?;
    tx.execute("DELETE FROM persons WHERE name = ?1", params![name])?;
    Ok(())
}

fn insert_signature(
    tx: &Transaction<'_>,
    name: &str,
    seq: usize,
    sig: &Signature,
) -> rusqlite::Result<()> {
    let blob: Vec<u8> = sig.values.iter().flat_map(|v| v.to_le_bytes()).collect();
    tx.execute(
        "INSERT INTO signatures (person, seq, data) VALUES (?1, ?2, ?3)",
        params![name, seq as i64, blob],
    )?;
    Ok(())
}

fn parse_timestamp(name: &str, field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{name:?} {field} {value:?}: {e}")))
}

/// Read and validate every record. Any inconsistency fails the whole load.
fn load_records(
    conn: &Connection,
    signature_len: Option<usize>,
) -> Result<BTreeMap<String, PersonRecord>, StoreError> {
    let mut records = BTreeMap::new();

    let mut stmt = conn
        .prepare("SELECT name, enrolled_at, updated_at FROM persons")
        .map_err(corrupt)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(corrupt)?;

    for row in rows {
        let (name, enrolled_at, updated_at) = row.map_err(corrupt)?;
        if validate_name(&name).is_err() {
            return Err(StoreError::Corrupt(format!("invalid identity name {name:?}")));
        }
        let record = PersonRecord {
            enrolled_at: parse_timestamp(&name, "enrolled_at", &enrolled_at)?,
            updated_at: parse_timestamp(&name, "updated_at", &updated_at)?,
            signatures: Vec::new(),
            name: name.clone(),
        };
        records.insert(name, record);
    }

    let mut stmt = conn
        .prepare("SELECT person, data FROM signatures ORDER BY person, seq, id")
        .map_err(corrupt)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(corrupt)?;

    for row in rows {
        let (person, blob) = row.map_err(corrupt)?;
        let signature = decode_signature(&person, &blob)?;

        match signature_len {
            None => {
                return Err(StoreError::Corrupt(
                    "signatures present but no signature length recorded".into(),
                ))
            }
            Some(len) if len != signature.len() => {
                return Err(StoreError::Corrupt(format!(
                    "signature for {person:?} has {} values, expected {len}",
                    signature.len()
                )))
            }
            Some(_) => {}
        }

        let record = records.get_mut(&person).ok_or_else(|| {
            StoreError::Corrupt(format!("orphan signature for unknown identity {person:?}"))
        })?;
        record.signatures.push(signature);
    }

    Ok(records)
}

fn decode_signature(person: &str, blob: &[u8]) -> Result<Signature, StoreError> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "signature blob for {person:?} has invalid length {}",
            blob.len()
        )));
    }

    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(StoreError::Corrupt(format!(
            "signature for {person:?} holds negative or non-finite values"
        )));
    }

    Ok(Signature::new(values))
}
