use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::audit::{AuditSink, RunRecord, outcome_qbench_payload};
use crate::config::Settings;
use crate::domain::WorkbookExtraction;
use crate::error::UploadError;
use crate::executor::{ExecutionOptions, NO_DATA_REASON, TestUpdateSummary, execute_plan};
use crate::planner::resolve_upload_plan;
use crate::qbench::QBenchClient;
use crate::workbook::parse_workbook;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Discards progress; used by callers that only want the final result.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Per-sample line of the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleUploadSummary {
    pub base_sample_id: String,
    pub tests: Vec<TestUpdateSummary>,
    pub skipped_columns: Vec<String>,
    pub reason: Option<String>,
    pub available_cn: usize,
    pub available_ho: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub processed: Vec<SampleUploadSummary>,
    pub skipped: Vec<SampleUploadSummary>,
    pub dry_run: bool,
}

impl UploadOutcome {
    pub fn total_processed_samples(&self) -> usize {
        self.processed.len()
    }

    pub fn total_skipped_samples(&self) -> usize {
        self.skipped.len()
    }

    pub fn summary_text(&self) -> String {
        if self.processed.is_empty() && self.skipped.is_empty() {
            return "No updates were made.".to_string();
        }

        let mut lines = Vec::new();
        if self.dry_run {
            lines.push("Dry run: no changes were sent to QBench or the audit log.".to_string());
        }
        if !self.processed.is_empty() {
            lines.push("Updated samples:".to_string());
            for sample in &self.processed {
                let tests = sample
                    .tests
                    .iter()
                    .map(|test| {
                        let columns = test.column_headers.join(", ");
                        if test.indices.is_empty() {
                            format!("{} #{} ({columns})", test.kind, test.test_id)
                        } else {
                            let indices = test
                                .indices
                                .iter()
                                .map(usize::to_string)
                                .collect::<Vec<_>>()
                                .join(", ");
                            format!("{} #{} ({columns}) -> indices [{indices}]", test.kind, test.test_id)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                lines.push(format!(
                    " - {} [CN:{}, HO:{}]: {tests}",
                    sample.base_sample_id, sample.available_cn, sample.available_ho
                ));
            }
        }
        if !self.skipped.is_empty() {
            lines.push("Skipped samples:".to_string());
            for sample in &self.skipped {
                let columns = if sample.skipped_columns.is_empty() {
                    "no columns".to_string()
                } else {
                    sample.skipped_columns.join(", ")
                };
                let header = format!(
                    " - {} [CN:{}, HO:{}]",
                    sample.base_sample_id, sample.available_cn, sample.available_ho
                );
                match &sample.reason {
                    Some(reason) => lines.push(format!("{header}: {columns} -> {reason}")),
                    None => lines.push(format!("{header}: {columns}")),
                }
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub execution: ExecutionOptions,
    pub record_audit: bool,
    pub created_by: Option<String>,
    pub instrument: Option<String>,
}

impl PublishOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            execution: ExecutionOptions {
                respect_existing_data: settings.skip_processed_tests,
                dry_run: settings.dry_run,
            },
            record_audit: true,
            created_by: None,
            instrument: None,
        }
    }
}

/// Everything a finished publish run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub extraction: WorkbookExtraction,
    pub outcome: UploadOutcome,
    pub audit_location: Option<String>,
}

pub struct App<Q: QBenchClient, A: AuditSink> {
    qbench: Q,
    audit: A,
    settings: Settings,
}

impl<Q: QBenchClient, A: AuditSink> App<Q, A> {
    pub fn new(qbench: Q, audit: A, settings: Settings) -> Self {
        Self {
            qbench,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn qbench(&self) -> &Q {
        &self.qbench
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }

    /// Reconcile and upload every physical sample of an extraction, one at a time.
    pub fn upload(
        &self,
        extraction: &WorkbookExtraction,
        options: ExecutionOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UploadOutcome, UploadError> {
        let mut outcome = UploadOutcome {
            processed: Vec::new(),
            skipped: Vec::new(),
            dry_run: options.dry_run,
        };

        for (base_sample_id, columns) in extraction.grouped_by_base_sample() {
            sink.event(ProgressEvent::new(format!("phase=Resolve; sample {base_sample_id}")));
            let started = Instant::now();
            let remote = self.qbench.fetch_sample(&base_sample_id)?;
            let plan = resolve_upload_plan(&base_sample_id, &columns, remote.as_ref());

            if let Some(reason) = &plan.reason {
                sink.event(ProgressEvent::new(format!(
                    "phase=Skip; sample {base_sample_id}: {reason}"
                )));
                outcome.skipped.push(SampleUploadSummary {
                    base_sample_id: plan.base_sample_id.clone(),
                    tests: Vec::new(),
                    skipped_columns: plan.skipped_columns.clone(),
                    reason: Some(reason.clone()),
                    available_cn: plan.available_cn,
                    available_ho: plan.available_ho,
                });
                continue;
            }

            let execution = execute_plan(&self.qbench, &plan, options)?;
            let skipped_columns: Vec<String> = plan
                .skipped_columns
                .iter()
                .chain(&execution.skipped_columns)
                .cloned()
                .collect();

            if execution.applied.is_empty() {
                let reason = execution
                    .skip_reason
                    .unwrap_or_else(|| NO_DATA_REASON.to_string());
                sink.event(ProgressEvent::new(format!(
                    "phase=Skip; sample {base_sample_id}: {reason}"
                )));
                outcome.skipped.push(SampleUploadSummary {
                    base_sample_id: plan.base_sample_id.clone(),
                    tests: Vec::new(),
                    skipped_columns,
                    reason: Some(reason),
                    available_cn: plan.available_cn,
                    available_ho: plan.available_ho,
                });
                continue;
            }

            sink.event(ProgressEvent {
                message: format!(
                    "phase=Store; sample {base_sample_id}: {} test(s) {}",
                    execution.applied.len(),
                    if options.dry_run { "matched" } else { "updated" }
                ),
                elapsed: Some(started.elapsed()),
            });
            outcome.processed.push(SampleUploadSummary {
                base_sample_id: plan.base_sample_id.clone(),
                tests: execution.applied.iter().map(TestUpdateSummary::from).collect(),
                skipped_columns,
                reason: None,
                available_cn: plan.available_cn,
                available_ho: plan.available_ho,
            });
        }

        info!(
            processed = outcome.total_processed_samples(),
            skipped = outcome.total_skipped_samples(),
            dry_run = outcome.dry_run,
            "upload finished"
        );
        Ok(outcome)
    }

    /// Parse, upload and (outside dry runs) record the audit trail for one workbook.
    pub fn publish(
        &self,
        path: &Path,
        options: &PublishOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, UploadError> {
        sink.event(ProgressEvent::new(format!(
            "phase=Parse; reading {}",
            path.display()
        )));
        let extraction = parse_workbook(path)?;

        let dry_run = options.execution.dry_run;
        sink.event(ProgressEvent::new(if dry_run {
            "phase=Resolve; simulating matches with QBench"
        } else {
            "phase=Resolve; saving to QBench"
        }));
        let outcome = self.upload(&extraction, options.execution, sink)?;

        let mut audit_location = None;
        if dry_run {
            sink.event(ProgressEvent::new("simulation completed"));
        } else if options.record_audit {
            sink.event(ProgressEvent::new("phase=Audit; saving backup record"));
            let qbench_payload = outcome_qbench_payload(&outcome, self.settings.environment);
            let record = RunRecord::build(
                &extraction,
                path,
                Some(qbench_payload),
                options.created_by.clone(),
                options.instrument.clone(),
            )
            .map_err(|err| UploadError::Audit(err.to_string()))?;
            let location = self
                .audit
                .store_run_record(&record)
                .map_err(|err| match err {
                    UploadError::Audit(message) => UploadError::Audit(message),
                    other => UploadError::Audit(other.to_string()),
                })?;
            audit_location = Some(location);
        }
        sink.event(ProgressEvent::new("process completed"));

        Ok(RunReport {
            extraction,
            outcome,
            audit_location,
        })
    }
}
