//! Decides how a physical sample's workbook columns map onto its QBench tests.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::domain::{AssayKind, SampleQuantification, WorkflowState};
use crate::qbench::{QBenchTestInfo, RemoteSample};

/// Replicate indices a homogeneity worksheet has slots for.
pub const HO_ALLOWED_INDICES: [usize; 3] = [0, 1, 2];
pub const MAX_CN_TESTS: usize = 3;

/// Binds one QBench test to the workbook columns that feed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTestUpdate {
    pub test: QBenchTestInfo,
    pub kind: AssayKind,
    pub samples: Vec<SampleQuantification>,
    pub indices: Vec<usize>,
    pub column_headers: Vec<String>,
}

impl ScheduledTestUpdate {
    fn new(test: &QBenchTestInfo, samples: Vec<SampleQuantification>, indices: Vec<usize>) -> Self {
        let column_headers = samples
            .iter()
            .map(|sample| sample.display_header().to_string())
            .collect();
        Self {
            test: test.clone(),
            kind: test.assay,
            samples,
            indices,
            column_headers,
        }
    }
}

/// Reconciliation result for one physical sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleUploadPlan {
    pub base_sample_id: String,
    pub updates: Vec<ScheduledTestUpdate>,
    pub skipped_columns: Vec<String>,
    pub reason: Option<String>,
    pub available_cn: usize,
    pub available_ho: usize,
}

impl SampleUploadPlan {
    pub fn is_successful(&self) -> bool {
        self.reason.is_none() && !self.updates.is_empty()
    }

    fn reject(mut self, reason: impl Into<String>, column_headers: Vec<String>) -> Self {
        self.reason = Some(reason.into());
        self.updates.clear();
        self.skipped_columns = column_headers;
        self
    }
}

pub fn resolve_upload_plan(
    base_sample_id: &str,
    columns: &[SampleQuantification],
    remote: Option<&RemoteSample>,
) -> SampleUploadPlan {
    let column_headers: Vec<String> = columns
        .iter()
        .map(|sample| sample.display_header().to_string())
        .collect();
    let plan = SampleUploadPlan {
        base_sample_id: base_sample_id.to_string(),
        updates: Vec::new(),
        skipped_columns: Vec::new(),
        reason: None,
        available_cn: 0,
        available_ho: 0,
    };

    let Some(remote) = remote else {
        return plan.reject(
            format!("sample {base_sample_id} was not found in QBench"),
            column_headers,
        );
    };

    let local_batches = collect_local_batches(columns);
    let (cn_tests, ho_tests) = eligible_tests(&remote.tests, &local_batches);
    let mut plan = SampleUploadPlan {
        available_cn: cn_tests.len(),
        available_ho: ho_tests.len(),
        ..plan
    };
    debug!(
        sample = base_sample_id,
        columns = columns.len(),
        cn = cn_tests.len(),
        ho = ho_tests.len(),
        "resolving upload plan"
    );

    if columns.is_empty() {
        return plan.reject("the workbook has no columns to assign for this sample", Vec::new());
    }
    if cn_tests.is_empty() && ho_tests.is_empty() {
        return plan.reject("no eligible tests in QBench after filtering", column_headers);
    }
    if ho_tests.len() > 1 {
        return plan.reject(
            "more than one eligible HO test found; unsupported case",
            column_headers,
        );
    }
    if cn_tests.len() > MAX_CN_TESTS {
        return plan.reject(
            "more than three eligible CN tests found; unsupported case",
            column_headers,
        );
    }

    let mut replicates: BTreeMap<usize, &SampleQuantification> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for sample in columns {
        let index = replicate_index(sample, base_sample_id);
        if replicates.insert(index, sample).is_some() {
            duplicates.push(index.to_string());
        }
    }
    if !duplicates.is_empty() {
        return plan.reject(
            format!("duplicate replicate indices in the workbook ({})", duplicates.join(", ")),
            column_headers,
        );
    }

    let updates = match (cn_tests.len(), ho_tests.len()) {
        (0, 1) => homogeneity_update(ho_tests[0], &replicates).map(|update| vec![update]),
        // The lowest replicate feeds CN; every replicate feeds HO.
        (1, 1) => match replicates.iter().next() {
            Some((&index, cn_sample)) => {
                let cn_update =
                    ScheduledTestUpdate::new(cn_tests[0], vec![(*cn_sample).clone()], vec![index]);
                homogeneity_update(ho_tests[0], &replicates)
                    .map(|ho_update| vec![cn_update, ho_update])
            }
            None => Err("no columns available for the CN test".to_string()),
        },
        (cn_count, 0) if (1..=MAX_CN_TESTS).contains(&cn_count) => {
            if columns.len() != cn_count {
                Err("the number of workbook columns does not match the available CN tests".to_string())
            } else {
                Ok(columns
                    .iter()
                    .zip(&cn_tests)
                    .map(|(sample, test)| {
                        ScheduledTestUpdate::new(
                            test,
                            vec![sample.clone()],
                            vec![replicate_index(sample, base_sample_id)],
                        )
                    })
                    .collect())
            }
        }
        _ => Err("unsupported combination of CN/HO tests".to_string()),
    };

    let updates = match updates {
        Ok(updates) => updates,
        Err(reason) => return plan.reject(reason, column_headers),
    };

    let used: BTreeSet<&str> = updates
        .iter()
        .flat_map(|update| update.samples.iter().map(|sample| sample.sample_id.as_str()))
        .collect();
    plan.skipped_columns = columns
        .iter()
        .filter(|sample| !used.contains(sample.sample_id.as_str()))
        .map(|sample| sample.display_header().to_string())
        .collect();
    plan.updates = updates;
    plan
}

fn homogeneity_update(
    test: &QBenchTestInfo,
    replicates: &BTreeMap<usize, &SampleQuantification>,
) -> Result<ScheduledTestUpdate, String> {
    if replicates.is_empty() {
        return Err("no columns available for the HO test".to_string());
    }
    if replicates
        .keys()
        .any(|index| !HO_ALLOWED_INDICES.contains(index))
    {
        return Err("HO replicate indices outside the allowed range (0, 1, 2)".to_string());
    }
    let indices: Vec<usize> = replicates.keys().copied().collect();
    let samples = replicates.values().map(|sample| (*sample).clone()).collect();
    Ok(ScheduledTestUpdate::new(test, samples, indices))
}

/// CN and HO candidates in upload order.
///
/// Only tests awaiting data-team review are eligible. Within each assay, tests sharing
/// a batch with the workbook columns are preferred; when none do, every eligible test
/// of that assay is kept.
pub fn eligible_tests<'a>(
    tests: &'a [QBenchTestInfo],
    local_batches: &BTreeSet<String>,
) -> (Vec<&'a QBenchTestInfo>, Vec<&'a QBenchTestInfo>) {
    let select = |kind: AssayKind| {
        let fallback: Vec<&QBenchTestInfo> = tests
            .iter()
            .filter(|test| test.assay == kind && test.state == WorkflowState::NeedsReview)
            .collect();
        let preferred: Vec<&QBenchTestInfo> = fallback
            .iter()
            .copied()
            .filter(|test| {
                local_batches.is_empty() || !test.batches.is_disjoint(local_batches)
            })
            .collect();
        let mut group = if preferred.is_empty() { fallback } else { preferred };
        group.sort_by(|a, b| {
            a.state
                .priority()
                .cmp(&b.state.priority())
                .then(a.test_id.cmp(&b.test_id))
        });
        group
    };
    (select(AssayKind::Cn), select(AssayKind::Ho))
}

fn collect_local_batches(columns: &[SampleQuantification]) -> BTreeSet<String> {
    columns
        .iter()
        .flat_map(|sample| sample.batch_numbers.iter())
        .map(|batch| batch.trim().to_string())
        .filter(|batch| !batch.is_empty())
        .collect()
}

/// 0 for the bare base id, else the numeric `-N` suffix, else the column's test index.
pub fn replicate_index(sample: &SampleQuantification, base_sample_id: &str) -> usize {
    if sample.sample_id == base_sample_id {
        return 0;
    }
    sample
        .sample_id
        .rsplit_once('-')
        .and_then(|(_, suffix)| {
            if suffix.chars().all(|ch| ch.is_ascii_digit()) {
                suffix.parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(sample.test_index)
}
