use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Suffix QBench uses for the raw chromatographic area field of an analyte.
pub const AREA_RESULT_SUFFIX: &str = "_area_result";

/// Cannabinoids reported by the potency template, in worksheet row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analyte {
    Cbdva,
    Cbdv,
    Cbda,
    Cbga,
    Cbg,
    Cbd,
    Thcv,
    Thcva,
    Cbcv,
    Cbn,
    #[serde(rename = "d9_thc")]
    D9Thc,
    #[serde(rename = "d8_thc")]
    D8Thc,
    Cbl,
    Thca,
    Cbc,
    Cbca,
    Cbla,
    Cbt,
}

impl Analyte {
    pub const ALL: [Analyte; 18] = [
        Analyte::Cbdva,
        Analyte::Cbdv,
        Analyte::Cbda,
        Analyte::Cbga,
        Analyte::Cbg,
        Analyte::Cbd,
        Analyte::Thcv,
        Analyte::Thcva,
        Analyte::Cbcv,
        Analyte::Cbn,
        Analyte::D9Thc,
        Analyte::D8Thc,
        Analyte::Cbl,
        Analyte::Thca,
        Analyte::Cbc,
        Analyte::Cbca,
        Analyte::Cbla,
        Analyte::Cbt,
    ];

    /// Worksheet field name in QBench.
    pub fn key(self) -> &'static str {
        match self {
            Analyte::Cbdva => "cbdva",
            Analyte::Cbdv => "cbdv",
            Analyte::Cbda => "cbda",
            Analyte::Cbga => "cbga",
            Analyte::Cbg => "cbg",
            Analyte::Cbd => "cbd",
            Analyte::Thcv => "thcv",
            Analyte::Thcva => "thcva",
            Analyte::Cbcv => "cbcv",
            Analyte::Cbn => "cbn",
            Analyte::D9Thc => "d9_thc",
            Analyte::D8Thc => "d8_thc",
            Analyte::Cbl => "cbl",
            Analyte::Thca => "thca",
            Analyte::Cbc => "cbc",
            Analyte::Cbca => "cbca",
            Analyte::Cbla => "cbla",
            Analyte::Cbt => "cbt",
        }
    }

    /// Name as printed in the instrument report.
    pub fn label(self) -> &'static str {
        match self {
            Analyte::Cbdva => "CBDVA",
            Analyte::Cbdv => "CBDV",
            Analyte::Cbda => "CBDA",
            Analyte::Cbga => "CBGA",
            Analyte::Cbg => "CBG",
            Analyte::Cbd => "CBD",
            Analyte::Thcv => "THCV",
            Analyte::Thcva => "THCVA",
            Analyte::Cbcv => "CBCV",
            Analyte::Cbn => "CBN",
            Analyte::D9Thc => "D9-THC",
            Analyte::D8Thc => "D8-THC",
            Analyte::Cbl => "CBL",
            Analyte::Thca => "THCA",
            Analyte::Cbc => "CBC",
            Analyte::Cbca => "CBCA",
            Analyte::Cbla => "CBLA",
            Analyte::Cbt => "CBT",
        }
    }
}

impl fmt::Display for Analyte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The two QBench assays this tool writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssayKind {
    /// Cannabinoid potency.
    Cn,
    /// Homogeneity.
    Ho,
}

impl AssayKind {
    pub fn assay_id(self) -> u64 {
        match self {
            AssayKind::Cn => 16,
            AssayKind::Ho => 34,
        }
    }

    pub fn from_assay_id(id: u64) -> Option<Self> {
        match id {
            16 => Some(AssayKind::Cn),
            34 => Some(AssayKind::Ho),
            _ => None,
        }
    }
}

impl fmt::Display for AssayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssayKind::Cn => write!(f, "CN"),
            AssayKind::Ho => write!(f, "HO"),
        }
    }
}

/// QBench test lifecycle states, ordered by upload priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    NotStarted,
    InProgress,
    NotReportable,
    NeedsReview,
    InReview,
    Completed,
    Reported,
    Other(String),
}

impl WorkflowState {
    pub fn priority(&self) -> u8 {
        match self {
            WorkflowState::NotStarted => 0,
            WorkflowState::InProgress => 1,
            WorkflowState::NotReportable => 2,
            WorkflowState::NeedsReview => 3,
            WorkflowState::InReview => 4,
            WorkflowState::Completed => 5,
            WorkflowState::Reported => 6,
            WorkflowState::Other(_) => 99,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkflowState::NotStarted => "NOT STARTED",
            WorkflowState::InProgress => "IN PROGRESS",
            WorkflowState::NotReportable => "NOT REPORTABLE",
            WorkflowState::NeedsReview => "NEEDS REVIEW (DATA TEAM)",
            WorkflowState::InReview => "IN REVIEW",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Reported => "REPORTED",
            WorkflowState::Other(value) => value,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let state = match normalized.as_str() {
            "NOT STARTED" => WorkflowState::NotStarted,
            "IN PROGRESS" => WorkflowState::InProgress,
            "NOT REPORTABLE" => WorkflowState::NotReportable,
            "NEEDS REVIEW (DATA TEAM)" => WorkflowState::NeedsReview,
            "IN REVIEW" => WorkflowState::InReview,
            "COMPLETED" => WorkflowState::Completed,
            "REPORTED" => WorkflowState::Reported,
            _ => WorkflowState::Other(value.trim().to_string()),
        };
        Ok(state)
    }
}

/// Details about the analytical run represented by one workbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_date: NaiveDate,
    pub batch_numbers: Vec<String>,
    pub batch_sample_map: BTreeMap<String, Vec<String>>,
    pub source_filename: String,
}

/// Quantitative results for one workbook column (one replicate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleQuantification {
    pub sample_id: String,
    pub base_sample_id: String,
    pub test_index: usize,
    pub column_header: String,
    pub components: BTreeMap<Analyte, Option<f64>>,
    pub area_results: BTreeMap<Analyte, Option<f64>>,
    pub sample_mass_mg: Option<f64>,
    pub dilution: Option<f64>,
    pub serving_mass_g: Option<f64>,
    pub servings_per_package: Option<f64>,
    #[serde(default)]
    pub batch_numbers: Vec<String>,
}

impl SampleQuantification {
    /// Header to report for this column, falling back to the normalized id.
    pub fn display_header(&self) -> &str {
        if self.column_header.is_empty() {
            &self.sample_id
        } else {
            &self.column_header
        }
    }

    pub fn component(&self, analyte: Analyte) -> Option<f64> {
        self.components.get(&analyte).copied().flatten()
    }

    pub fn area_result(&self, analyte: Analyte) -> Option<f64> {
        self.area_results.get(&analyte).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookExtraction {
    pub metadata: RunMetadata,
    pub samples: Vec<SampleQuantification>,
}

impl WorkbookExtraction {
    /// Columns grouped by physical sample in first-seen order, each group sorted by
    /// test index.
    pub fn grouped_by_base_sample(&self) -> Vec<(String, Vec<SampleQuantification>)> {
        group_by_base_sample(&self.samples)
    }

    /// Unique base sample ids in first-seen order.
    pub fn base_sample_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for sample in &self.samples {
            if !ids.contains(&sample.base_sample_id) {
                ids.push(sample.base_sample_id.clone());
            }
        }
        ids
    }
}

pub fn group_by_base_sample(
    samples: &[SampleQuantification],
) -> Vec<(String, Vec<SampleQuantification>)> {
    let mut grouped: Vec<(String, Vec<SampleQuantification>)> = Vec::new();
    for sample in samples {
        match grouped
            .iter_mut()
            .find(|(base, _)| *base == sample.base_sample_id)
        {
            Some((_, columns)) => columns.push(sample.clone()),
            None => grouped.push((sample.base_sample_id.clone(), vec![sample.clone()])),
        }
    }
    for (_, columns) in &mut grouped {
        columns.sort_by_key(|sample| sample.test_index);
    }
    grouped
}

/// Physical sample id: the digit prefix of a `digits-digits` replicate id.
pub fn base_sample_id(sample_id: &str) -> String {
    if let Some((prefix, remainder)) = sample_id.split_once('-') {
        if is_all_digits(prefix) && is_all_digits(remainder) {
            return prefix.to_string();
        }
    }
    sample_id.to_string()
}

pub(crate) fn is_all_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_id_strips_numeric_replicate_suffix() {
        assert_eq!(base_sample_id("15042-2"), "15042");
        assert_eq!(base_sample_id("15042"), "15042");
        assert_eq!(base_sample_id("15042-A"), "15042-A");
    }

    #[test]
    fn workflow_state_parsing_is_case_insensitive() {
        let state: WorkflowState = " needs review (data team) ".parse().unwrap();
        assert_eq!(state, WorkflowState::NeedsReview);
        let other: WorkflowState = "ON HOLD".parse().unwrap();
        assert_eq!(other.priority(), 99);
    }

    #[test]
    fn analyte_order_matches_declaration() {
        let mut sorted = Analyte::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Analyte::ALL.to_vec());
        assert_eq!(Analyte::D9Thc.key(), "d9_thc");
    }
}
