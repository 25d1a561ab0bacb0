//! Observability emitter: canonical NDJSON event stream per run.
//!
//! Every pipeline component reports lifecycle through one event shape,
//! written line-at-a-time to `<workroot>/logs/<run_id>/events.ndjson`.
//! When the active file exceeds the configured byte threshold it is renamed
//! with an ordinal suffix (`events.ndjson.1`, `.2`, ...) and a new file is
//! started. A `latest` symlink under `<workroot>/logs/` points at the
//! current run's directory.
//!
//! Event record fields: `ts`, `level`, `stage`, `rid`, `op`, `status`,
//! `duration_ms?`, `counts{docs,chunks,tokens}`, plus optional per-op
//! context (`doc_id`, `chunk_id`, `provider`, `model`, `dimension`,
//! `reason`).
//!
//! Emitting never aborts a phase: I/O failures are reported to stderr and
//! swallowed, per the propagation policy.

use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
    Debug,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Debug => "DEBUG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Start,
    Ok,
    End,
    Fail,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Start => "START",
            Status::Ok => "OK",
            Status::End => "END",
            Status::Fail => "FAIL",
        }
    }
}

/// Monotonic per-run counters included on every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counts {
    pub docs: u64,
    pub chunks: u64,
    pub tokens: u64,
}

/// Optional per-op context fields.
#[derive(Debug, Clone, Default)]
pub struct EventFields {
    pub duration_ms: Option<u64>,
    pub doc_id: Option<String>,
    pub chunk_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub dimension: Option<usize>,
    pub reason: Option<String>,
}

/// Event stream handle for one (run, stage) pair.
///
/// Passed explicitly through the call tree; there is no global context.
pub struct EventEmitter {
    run_id: String,
    stage: String,
    run_log_dir: PathBuf,
    events_path: PathBuf,
    max_bytes: u64,
    file: Option<File>,
    counts: Counts,
}

impl EventEmitter {
    pub fn new(
        workroot: &std::path::Path,
        run_id: &str,
        stage: &str,
        rotation_mb: u64,
    ) -> Result<Self> {
        let run_log_dir = crate::artifacts::logs_dir(workroot, run_id);
        std::fs::create_dir_all(&run_log_dir)?;
        let events_path = run_log_dir.join("events.ndjson");

        let emitter = Self {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            run_log_dir,
            events_path,
            max_bytes: rotation_mb * 1024 * 1024,
            file: None,
            counts: Counts::default(),
        };
        emitter.update_latest_symlink(workroot);
        Ok(emitter)
    }

    /// Point `<workroot>/logs/latest` at this run's log directory.
    fn update_latest_symlink(&self, workroot: &std::path::Path) {
        #[cfg(unix)]
        {
            let link = workroot.join("logs").join("latest");
            let _ = std::fs::remove_file(&link);
            let _ = std::os::unix::fs::symlink(&self.run_id, &link);
        }
        #[cfg(not(unix))]
        let _ = workroot;
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    /// Bump the monotonic counters carried on subsequent events.
    pub fn add_counts(&mut self, docs: u64, chunks: u64, tokens: u64) {
        self.counts.docs += docs;
        self.counts.chunks += chunks;
        self.counts.tokens += tokens;
    }

    pub fn start(&mut self, op: &str) {
        self.emit(Level::Info, op, Status::Start, EventFields::default());
    }

    pub fn ok(&mut self, op: &str, fields: EventFields) {
        self.emit(Level::Info, op, Status::Ok, fields);
    }

    pub fn end(&mut self, op: &str, duration_ms: u64) {
        self.emit(
            Level::Info,
            op,
            Status::End,
            EventFields {
                duration_ms: Some(duration_ms),
                ..Default::default()
            },
        );
    }

    pub fn fail(&mut self, op: &str, reason: &str, duration_ms: u64) {
        self.emit(
            Level::Error,
            op,
            Status::Fail,
            EventFields {
                duration_ms: Some(duration_ms),
                reason: Some(reason.to_string()),
                ..Default::default()
            },
        );
    }

    /// Write one event line. Failures are reported to stderr, never returned.
    pub fn emit(&mut self, level: Level, op: &str, status: Status, fields: EventFields) {
        let mut record = serde_json::json!({
            "ts": crate::artifacts::now_iso(),
            "level": level.as_str(),
            "stage": self.stage,
            "rid": self.run_id,
            "op": op,
            "status": status.as_str(),
            "counts": {
                "docs": self.counts.docs,
                "chunks": self.counts.chunks,
                "tokens": self.counts.tokens,
            },
        });
        let map = record.as_object_mut().expect("event record is an object");
        if let Some(d) = fields.duration_ms {
            map.insert("duration_ms".into(), d.into());
        }
        if let Some(v) = fields.doc_id {
            map.insert("doc_id".into(), v.into());
        }
        if let Some(v) = fields.chunk_id {
            map.insert("chunk_id".into(), v.into());
        }
        if let Some(v) = fields.provider {
            map.insert("provider".into(), v.into());
        }
        if let Some(v) = fields.model {
            map.insert("model".into(), v.into());
        }
        if let Some(v) = fields.dimension {
            map.insert("dimension".into(), v.into());
        }
        if let Some(v) = fields.reason {
            map.insert("reason".into(), v.into());
        }

        if let Err(e) = self.write_line(&record) {
            eprintln!("Warning: event write failed: {}", e);
        }
    }

    fn write_line(&mut self, record: &serde_json::Value) -> Result<()> {
        self.rotate_if_needed()?;
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.events_path)?;
            self.file = Some(file);
        }
        let file = self.file.as_mut().expect("event file just opened");
        file.write_all(serde_json::to_string(record)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> Result<()> {
        let size = match self.events_path.metadata() {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let mut ordinal = 1u32;
        while self
            .run_log_dir
            .join(format!("events.ndjson.{}", ordinal))
            .exists()
        {
            ordinal += 1;
        }
        let rotated = self.run_log_dir.join(format!("events.ndjson.{}", ordinal));
        self.file = None;
        std::fs::rename(&self.events_path, rotated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_writes_canonical_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut em = EventEmitter::new(dir.path(), "run-1", "chunk", 64).unwrap();
        em.add_counts(1, 3, 42);
        em.start("chunk.run");
        em.ok(
            "chunk.emit",
            EventFields {
                chunk_id: Some("doc:0000".into()),
                ..Default::default()
            },
        );
        em.end("chunk.run", 12);

        let body =
            std::fs::read_to_string(dir.path().join("logs/run-1/events.ndjson")).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["stage"], "chunk");
        assert_eq!(first["rid"], "run-1");
        assert_eq!(first["status"], "START");
        assert_eq!(first["counts"]["tokens"], 42);
        assert!(first["ts"].as_str().unwrap().ends_with('Z'));

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["chunk_id"], "doc:0000");

        let third: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(third["status"], "END");
        assert_eq!(third["duration_ms"], 12);
    }

    #[test]
    fn test_rotation_renames_with_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        // 0 MB threshold: rotate as soon as anything is on disk.
        let mut em = EventEmitter::new(dir.path(), "run-2", "embed", 0).unwrap();
        for _ in 0..3 {
            em.start("embed.batch");
        }
        let log_dir = dir.path().join("logs/run-2");
        assert!(log_dir.join("events.ndjson.1").exists());
        assert!(log_dir.join("events.ndjson").exists());
    }

    #[test]
    fn test_fail_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut em = EventEmitter::new(dir.path(), "run-3", "embed", 64).unwrap();
        em.fail("embed.load", "DimensionMismatch", 5);
        let body =
            std::fs::read_to_string(dir.path().join("logs/run-3/events.ndjson")).unwrap();
        let rec: serde_json::Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(rec["status"], "FAIL");
        assert_eq!(rec["level"], "ERROR");
        assert_eq!(rec["reason"], "DimensionMismatch");
    }
}
