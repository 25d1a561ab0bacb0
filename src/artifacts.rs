//! Per-run artifact store: run identifiers, phase directories, and NDJSON
//! streaming.
//!
//! Layout under the workspace root:
//!
//! ```text
//! <workroot>/runs/<run_id>/<phase>/...
//! <workroot>/logs/<run_id>/events.ndjson
//! ```
//!
//! Artifact files are owned by the run's directory; nothing writes into a
//! phase directory after the phase that produced it completes.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Generate a fresh run identifier: `YYYY-MM-DD_HHMMSS_<4hex>`.
pub fn new_run_id() -> String {
    let now = chrono::Utc::now();
    let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..4].to_string();
    format!("{}_{}", now.format("%Y-%m-%d_%H%M%S"), suffix)
}

pub fn runs_root(workroot: &Path) -> PathBuf {
    workroot.join("runs")
}

pub fn run_dir(workroot: &Path, run_id: &str) -> PathBuf {
    runs_root(workroot).join(run_id)
}

/// Phase subdirectory for a run. Created lazily on first use.
pub fn phase_dir(workroot: &Path, run_id: &str, phase: &str) -> PathBuf {
    run_dir(workroot, run_id).join(phase)
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))
}

pub fn logs_dir(workroot: &Path, run_id: &str) -> PathBuf {
    workroot.join("logs").join(run_id)
}

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON for hashing: sorted object keys, order-preserving arrays,
/// no insignificant whitespace. serde_json's default map is key-ordered, so
/// serializing a constructed `Value` is canonical by construction.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Read every line of an NDJSON file strictly; any malformed line is an error.
pub fn read_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open NDJSON file: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: T = serde_json::from_str(&line)
            .with_context(|| format!("Malformed JSON at {}:{}", path.display(), num + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Read an NDJSON file, skipping malformed lines. Returns the parsed records
/// and the count of lines that failed to parse; parse errors never abort the
/// file.
pub fn read_ndjson_lossy<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open NDJSON file: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut parse_errors = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(_) => parse_errors += 1,
        }
    }
    Ok((records, parse_errors))
}

/// Buffered NDJSON writer: one JSON object per line.
pub struct NdjsonWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    lines: u64,
}

impl NdjsonWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create NDJSON file: {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            lines: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush NDJSON file: {}", self.path.display()))
    }
}

/// Write a pretty JSON report file, creating parent directories as needed.
pub fn write_json_report<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body)
        .with_context(|| format!("Failed to write report: {}", path.display()))
}

/// True if the file exists and is non-empty.
pub fn non_empty(path: &Path) -> bool {
    path.metadata().map(|m| m.len() > 0).unwrap_or(false)
}

/// Current time as ISO-8601 UTC with `Z` suffix.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        id: String,
        n: i64,
    }

    #[test]
    fn test_run_id_shape() {
        let rid = new_run_id();
        // YYYY-MM-DD_HHMMSS_xxxx
        assert_eq!(rid.len(), 22, "unexpected run id: {}", rid);
        assert_eq!(&rid[10..11], "_");
        assert_eq!(&rid[17..18], "_");
    }

    #[test]
    fn test_ndjson_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let mut w = NdjsonWriter::create(&path).unwrap();
        w.write(&Rec {
            id: "a".into(),
            n: 1,
        })
        .unwrap();
        w.write(&Rec {
            id: "b".into(),
            n: 2,
        })
        .unwrap();
        assert_eq!(w.lines_written(), 2);
        w.finish().unwrap();

        let records: Vec<Rec> = read_ndjson(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "b");
    }

    #[test]
    fn test_lossy_read_counts_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.ndjson");
        std::fs::write(
            &path,
            "{\"id\":\"a\",\"n\":1}\nnot json\n\n{\"id\":\"b\",\"n\":2}\n",
        )
        .unwrap();
        let (records, errors): (Vec<Rec>, usize) = read_ndjson_lossy(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v = serde_json::json!({"zeta": 1, "alpha": {"b": 2, "a": 3}});
        assert_eq!(canonical_json(&v), r#"{"alpha":{"a":3,"b":2},"zeta":1}"#);
    }

    #[test]
    fn test_sha256_hex_stable() {
        assert_eq!(
            sha256_hex(b"trailblazer"),
            sha256_hex(b"trailblazer"),
        );
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }
}
