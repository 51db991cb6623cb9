use std::collections::BTreeMap;
use std::sync::Mutex;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use potency_upload::app::{App, ProgressEvent, ProgressSink, SilentProgress};
use potency_upload::audit::{AuditSink, RunRecord};
use potency_upload::config::Settings;
use potency_upload::domain::{
    Analyte, AssayKind, RunMetadata, SampleQuantification, WorkbookExtraction, WorkflowState,
};
use potency_upload::error::UploadError;
use potency_upload::executor::{EXISTING_DATA_REASON, ExecutionOptions, NO_DATA_REASON};
use potency_upload::qbench::{QBenchClient, QBenchTestInfo, RemoteSample, WorksheetValue};

#[derive(Default)]
struct MockQBench {
    samples: BTreeMap<String, RemoteSample>,
    fail_writes: bool,
    fetches: Mutex<Vec<String>>,
    writes: Mutex<Vec<(u64, BTreeMap<String, String>)>>,
}

impl MockQBench {
    fn with_sample(mut self, sample: RemoteSample) -> Self {
        self.samples.insert(sample.id.clone(), sample);
        self
    }

    fn writes(&self) -> Vec<(u64, BTreeMap<String, String>)> {
        self.writes.lock().unwrap().clone()
    }
}

impl QBenchClient for MockQBench {
    fn fetch_sample(&self, sample_id: &str) -> Result<Option<RemoteSample>, UploadError> {
        self.fetches.lock().unwrap().push(sample_id.to_string());
        Ok(self.samples.get(sample_id).cloned())
    }

    fn update_test_worksheet(
        &self,
        test_id: u64,
        data: &BTreeMap<String, String>,
    ) -> Result<(), UploadError> {
        if self.fail_writes {
            return Err(UploadError::QBenchStatus {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }
        self.writes.lock().unwrap().push((test_id, data.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryAudit {
    records: Mutex<Vec<RunRecord>>,
}

impl AuditSink for MemoryAudit {
    fn store_run_record(&self, record: &RunRecord) -> Result<String, UploadError> {
        self.records.lock().unwrap().push(record.clone());
        Ok("memory".to_string())
    }
}

#[derive(Default)]
struct RecordingProgress {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingProgress {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn column(sample_id: &str, test_index: usize) -> SampleQuantification {
    let mut components: BTreeMap<Analyte, Option<f64>> =
        Analyte::ALL.iter().map(|a| (*a, None)).collect();
    components.insert(Analyte::Cbd, Some(12.5));
    components.insert(Analyte::D9Thc, Some(0.25));
    SampleQuantification {
        sample_id: sample_id.to_string(),
        base_sample_id: sample_id.split('-').next().unwrap_or(sample_id).to_string(),
        test_index,
        column_header: sample_id.to_string(),
        components,
        area_results: BTreeMap::new(),
        sample_mass_mg: Some(1021.0),
        dilution: Some(40.0),
        serving_mass_g: None,
        servings_per_package: None,
        batch_numbers: Vec::new(),
    }
}

fn empty_column(sample_id: &str) -> SampleQuantification {
    SampleQuantification {
        components: Analyte::ALL.iter().map(|a| (*a, None)).collect(),
        sample_mass_mg: None,
        dilution: None,
        ..column(sample_id, 0)
    }
}

fn extraction(samples: Vec<SampleQuantification>) -> WorkbookExtraction {
    WorkbookExtraction {
        metadata: RunMetadata {
            run_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            batch_numbers: vec!["8561".to_string()],
            batch_sample_map: BTreeMap::new(),
            source_filename: "20250101_8561 run.xlsx".to_string(),
        },
        samples,
    }
}

fn cn_test(test_id: u64, worksheet: &[(&str, WorksheetValue)]) -> QBenchTestInfo {
    QBenchTestInfo {
        test_id,
        assay: AssayKind::Cn,
        state: WorkflowState::NeedsReview,
        batches: Default::default(),
        worksheet_processed: false,
        worksheet: worksheet
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
        label: "Potency".to_string(),
    }
}

fn remote(id: &str, tests: Vec<QBenchTestInfo>) -> RemoteSample {
    RemoteSample {
        id: id.to_string(),
        tests,
    }
}

fn live() -> ExecutionOptions {
    ExecutionOptions {
        respect_existing_data: true,
        dry_run: false,
    }
}

#[test]
fn upload_writes_formatted_payload() {
    let qbench = MockQBench::default().with_sample(remote("15042", vec![cn_test(7, &[])]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());

    let outcome = app
        .upload(&extraction(vec![column("15042", 0)]), live(), &SilentProgress)
        .unwrap();

    assert_eq!(outcome.total_processed_samples(), 1);
    assert_eq!(outcome.total_skipped_samples(), 0);
    assert_eq!(outcome.processed[0].tests[0].test_id, 7);
    assert!(!outcome.dry_run);
}

#[test]
fn existing_worksheet_data_withholds_the_write() {
    let worksheet = [
        ("sample_mass", WorksheetValue::Text("998.2".to_string())),
        ("cbd", WorksheetValue::Number(11.0)),
    ];
    let qbench = MockQBench::default().with_sample(remote("15042", vec![cn_test(7, &worksheet)]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());

    let outcome = app
        .upload(&extraction(vec![column("15042", 0)]), live(), &SilentProgress)
        .unwrap();

    assert_eq!(outcome.total_processed_samples(), 0);
    assert_eq!(outcome.skipped[0].reason.as_deref(), Some(EXISTING_DATA_REASON));
    assert_eq!(outcome.skipped[0].skipped_columns, vec!["15042"]);
    assert!(app_writes(&app).is_empty());
}

#[test]
fn blank_remote_values_do_not_block_the_write() {
    let worksheet = [
        ("sample_mass", WorksheetValue::Text(" ".to_string())),
        ("cbd", WorksheetValue::Text("0 %".to_string())),
        ("dilution", WorksheetValue::Number(0.0)),
    ];
    let qbench = MockQBench::default().with_sample(remote("15042", vec![cn_test(7, &worksheet)]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());

    let outcome = app
        .upload(&extraction(vec![column("15042", 0)]), live(), &SilentProgress)
        .unwrap();

    assert_eq!(outcome.total_processed_samples(), 1);
    assert_eq!(app_writes(&app).len(), 1);
}

#[test]
fn force_overwrites_existing_data() {
    let worksheet = [("cbd", WorksheetValue::Number(11.0))];
    let qbench = MockQBench::default().with_sample(remote("15042", vec![cn_test(7, &worksheet)]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());
    let options = ExecutionOptions {
        respect_existing_data: false,
        dry_run: false,
    };

    let outcome = app
        .upload(&extraction(vec![column("15042", 0)]), options, &SilentProgress)
        .unwrap();

    assert_eq!(outcome.total_processed_samples(), 1);
    let writes = app_writes(&app);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, 7);
    assert_eq!(writes[0].1.get("sample_mass").map(String::as_str), Some("1021"));
    assert_eq!(writes[0].1.get("cbd").map(String::as_str), Some("12.5"));
    assert_eq!(writes[0].1.get("d9_thc").map(String::as_str), Some("0.25"));
}

#[test]
fn dry_run_makes_the_same_decisions_without_writing() {
    let qbench = MockQBench::default()
        .with_sample(remote("15042", vec![cn_test(7, &[])]))
        .with_sample(remote(
            "15043",
            vec![cn_test(8, &[("cbd", WorksheetValue::Number(3.0))])],
        ));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());
    let options = ExecutionOptions {
        respect_existing_data: true,
        dry_run: true,
    };

    let outcome = app
        .upload(
            &extraction(vec![column("15042", 0), column("15043", 0)]),
            options,
            &SilentProgress,
        )
        .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.total_processed_samples(), 1);
    assert_eq!(outcome.skipped[0].base_sample_id, "15043");
    assert_eq!(outcome.skipped[0].reason.as_deref(), Some(EXISTING_DATA_REASON));
    assert!(app_writes(&app).is_empty());
}

#[test]
fn empty_payload_is_skipped_not_failed() {
    let qbench = MockQBench::default().with_sample(remote("15042", vec![cn_test(7, &[])]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());

    let outcome = app
        .upload(&extraction(vec![empty_column("15042")]), live(), &SilentProgress)
        .unwrap();

    assert_eq!(outcome.total_processed_samples(), 0);
    assert_eq!(outcome.skipped[0].reason.as_deref(), Some(NO_DATA_REASON));
    assert!(app_writes(&app).is_empty());
}

#[test]
fn write_failure_propagates() {
    let qbench = MockQBench {
        fail_writes: true,
        ..MockQBench::default()
    }
    .with_sample(remote("15042", vec![cn_test(7, &[])]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());

    let err = app
        .upload(&extraction(vec![column("15042", 0)]), live(), &SilentProgress)
        .unwrap_err();

    assert_matches!(err, UploadError::QBenchStatus { status: 502, .. });
    assert!(err.is_remote());
}

#[test]
fn unknown_sample_is_reported_skipped() {
    let app = App::new(MockQBench::default(), MemoryAudit::default(), Settings::default());
    let progress = RecordingProgress::default();

    let outcome = app
        .upload(&extraction(vec![column("99999", 0)]), live(), &progress)
        .unwrap();

    assert_eq!(outcome.total_skipped_samples(), 1);
    assert_eq!(
        outcome.skipped[0].reason.as_deref(),
        Some("sample 99999 was not found in QBench")
    );
    let messages = progress.messages.lock().unwrap();
    assert!(messages.iter().any(|m| m.starts_with("phase=Skip; sample 99999")));
}

#[test]
fn samples_are_fetched_once_in_workbook_order() {
    let qbench = MockQBench::default();
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());
    let columns = vec![
        column("15043", 0),
        column("15042", 0),
        column("15043-1", 1),
    ];

    app.upload(&extraction(columns), live(), &SilentProgress)
        .unwrap();

    assert_eq!(app_fetches(&app), vec!["15043", "15042"]);
}

#[test]
fn summary_text_lists_updates_and_skips() {
    let qbench = MockQBench::default().with_sample(remote("15042", vec![cn_test(7, &[])]));
    let app = App::new(qbench, MemoryAudit::default(), Settings::default());

    let outcome = app
        .upload(
            &extraction(vec![column("15042", 0), column("15050", 0)]),
            live(),
            &SilentProgress,
        )
        .unwrap();
    let text = outcome.summary_text();

    assert!(text.contains("Updated samples:"));
    assert!(text.contains(" - 15042 [CN:1, HO:0]: CN #7 (15042)"));
    assert!(text.contains("Skipped samples:"));
    assert!(text.contains("15050"));
}

fn app_writes(app: &App<MockQBench, MemoryAudit>) -> Vec<(u64, BTreeMap<String, String>)> {
    app.qbench().writes()
}

fn app_fetches(app: &App<MockQBench, MemoryAudit>) -> Vec<String> {
    app.qbench().fetches.lock().unwrap().clone()
}
