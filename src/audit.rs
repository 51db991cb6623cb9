//! Backup record of every published run, kept apart from QBench.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::app::UploadOutcome;
use crate::config::Environment;
use crate::domain::WorkbookExtraction;
use crate::error::UploadError;

/// Denormalized run record as stored by the audit sink.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_date: String,
    pub instrument: Option<String>,
    pub file_name: String,
    pub workbook_hash: String,
    pub batch_codes: Vec<String>,
    pub sample_ids: Vec<String>,
    pub created_by: String,
    pub excel_payload: Value,
    pub qbench_payload: Value,
    pub recorded_at: String,
}

impl RunRecord {
    pub fn build(
        extraction: &WorkbookExtraction,
        workbook_path: &Path,
        qbench_payload: Option<Value>,
        created_by: Option<String>,
        instrument: Option<String>,
    ) -> Result<Self, UploadError> {
        let metadata = &extraction.metadata;
        let excel_payload = serde_json::to_value(extraction)
            .map_err(|err| UploadError::Audit(err.to_string()))?;
        Ok(Self {
            run_date: metadata.run_date.to_string(),
            instrument,
            file_name: workbook_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| metadata.source_filename.clone()),
            workbook_hash: compute_file_hash(workbook_path)?,
            batch_codes: metadata.batch_numbers.clone(),
            sample_ids: extraction.base_sample_ids(),
            created_by: created_by.unwrap_or_else(current_user),
            excel_payload,
            qbench_payload: qbench_payload.unwrap_or_else(|| default_qbench_payload(extraction)),
            recorded_at: Utc::now().to_rfc3339(),
        })
    }
}

pub trait AuditSink: Send + Sync {
    /// Persists the record and returns where it was stored.
    fn store_run_record(&self, record: &RunRecord) -> Result<String, UploadError>;
}

/// Writes one pretty-printed JSON file per run into a directory.
#[derive(Debug, Clone)]
pub struct JsonDirAuditSink {
    root: Utf8PathBuf,
}

impl JsonDirAuditSink {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn record_path(&self, record: &RunRecord) -> Utf8PathBuf {
        let short_hash: String = record.workbook_hash.chars().take(12).collect();
        let stamp: String = record
            .recorded_at
            .chars()
            .filter(|ch| ch.is_ascii_digit())
            .take(14)
            .collect();
        self.root
            .join(&record.run_date)
            .join(format!("{short_hash}-{stamp}.json"))
    }
}

impl AuditSink for JsonDirAuditSink {
    fn store_run_record(&self, record: &RunRecord) -> Result<String, UploadError> {
        let path = self.record_path(record);
        let parent = path
            .parent()
            .ok_or_else(|| UploadError::Audit("invalid audit record path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| UploadError::Audit(format!("create {parent}: {err}")))?;
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| UploadError::Audit(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("potency-audit")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| UploadError::Audit(err.to_string()))?;
        io::Write::write_all(&mut temp, &content)
            .map_err(|err| UploadError::Audit(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| UploadError::Audit(err.to_string()))?;
        Ok(path.to_string())
    }
}

/// Summary stored when no upload outcome is available.
pub fn default_qbench_payload(extraction: &WorkbookExtraction) -> Value {
    let mut sample_ids = extraction.base_sample_ids();
    sample_ids.sort();
    json!({
        "status": "completed",
        "synced_samples": sample_ids,
        "synced_at": Utc::now().to_rfc3339(),
    })
}

pub fn outcome_qbench_payload(outcome: &UploadOutcome, environment: Environment) -> Value {
    let synced: Vec<&str> = outcome
        .processed
        .iter()
        .map(|sample| sample.base_sample_id.as_str())
        .collect();
    json!({
        "status": "completed",
        "environment": environment,
        "synced_samples": synced,
        "synced_at": Utc::now().to_rfc3339(),
        "outcome": outcome,
    })
}

pub fn compute_file_hash(path: &Path) -> Result<String, UploadError> {
    let mut file = fs::File::open(path)
        .map_err(|err| UploadError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
