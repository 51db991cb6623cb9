use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::AssayKind;
use crate::error::UploadError;
use crate::payload::{WorksheetPayload, build_cannabinoid_payload, build_homogeneity_payload};
use crate::planner::{SampleUploadPlan, ScheduledTestUpdate};
use crate::qbench::{QBenchClient, WorksheetValue};

pub const EXISTING_DATA_REASON: &str = "the selected tests already have data in QBench";
pub const NO_DATA_REASON: &str = "the selected tests had no data to send";

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    /// Withhold writes to tests whose worksheet already holds values.
    pub respect_existing_data: bool,
    /// Run every decision but never call the worksheet endpoint.
    pub dry_run: bool,
}

/// What happened to one accepted plan.
#[derive(Debug, Clone, Default)]
pub struct PlanExecution {
    pub applied: Vec<ScheduledTestUpdate>,
    pub skipped_columns: Vec<String>,
    pub skip_reason: Option<String>,
}

/// Summary of a test that was (or in dry run would have been) written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestUpdateSummary {
    pub test_id: u64,
    pub kind: AssayKind,
    pub column_headers: Vec<String>,
    pub indices: Vec<usize>,
}

impl From<&ScheduledTestUpdate> for TestUpdateSummary {
    fn from(update: &ScheduledTestUpdate) -> Self {
        Self {
            test_id: update.test.test_id,
            kind: update.kind,
            column_headers: update.column_headers.clone(),
            indices: update.indices.clone(),
        }
    }
}

pub fn build_payload(update: &ScheduledTestUpdate) -> WorksheetPayload {
    match update.kind {
        AssayKind::Cn => update
            .samples
            .first()
            .map(build_cannabinoid_payload)
            .unwrap_or_default(),
        AssayKind::Ho => build_homogeneity_payload(&update.samples, &update.indices),
    }
}

/// Walks the plan in order. A failed write aborts immediately with the transport error.
pub fn execute_plan<Q: QBenchClient + ?Sized>(
    qbench: &Q,
    plan: &SampleUploadPlan,
    options: ExecutionOptions,
) -> Result<PlanExecution, UploadError> {
    let mut execution = PlanExecution::default();

    for update in &plan.updates {
        let test_id = update.test.test_id;
        let payload = build_payload(update);
        if payload.is_empty() {
            debug!(sample = %plan.base_sample_id, test_id, "payload empty; skipping");
            execution
                .skipped_columns
                .extend(update.column_headers.iter().cloned());
            continue;
        }

        if options.respect_existing_data && !worksheet_fields_are_empty(&update.test.worksheet, &payload) {
            warn!(
                sample = %plan.base_sample_id,
                test_id,
                kind = %update.kind,
                "test already has data; skipping"
            );
            execution
                .skipped_columns
                .extend(update.column_headers.iter().cloned());
            execution
                .skip_reason
                .get_or_insert_with(|| EXISTING_DATA_REASON.to_string());
            continue;
        }

        if options.dry_run {
            info!(
                sample = %plan.base_sample_id,
                test_id,
                kind = %update.kind,
                fields = payload.len(),
                "dry run; worksheet update withheld"
            );
        } else {
            qbench
                .update_test_worksheet(test_id, &payload)
                .inspect_err(|err| {
                    error!(test_id, error = %err, "failed to update worksheet");
                })?;
            info!(
                sample = %plan.base_sample_id,
                test_id,
                kind = %update.kind,
                fields = payload.len(),
                "worksheet updated"
            );
        }
        execution.applied.push(update.clone());
    }

    Ok(execution)
}

/// True when none of the payload's keys already holds a value remotely.
pub fn worksheet_fields_are_empty(
    worksheet: &BTreeMap<String, WorksheetValue>,
    payload: &WorksheetPayload,
) -> bool {
    payload
        .keys()
        .filter_map(|key| worksheet.get(key))
        .all(WorksheetValue::is_blank)
}
