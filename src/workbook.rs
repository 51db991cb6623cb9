use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use calamine::{Data, Range, Reader, open_workbook_auto};
use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::domain::{
    Analyte, RunMetadata, SampleQuantification, WorkbookExtraction, base_sample_id, is_all_digits,
};
use crate::error::UploadError;

pub const RESULTS_SHEET: &str = "Results Transfer";
pub const BATCH_SHEET: &str = "Blank Spike Recovery";
pub const BATCH_COLUMN_STEP: usize = 2;

// Zero-based row indices fixed by the instrument's report template.
pub const COMPONENT_ROW_OFFSET: usize = 1;
pub const AREA_RESULT_ROW_OFFSET: usize = 26;
pub const SAMPLE_MASS_ROW: usize = 22;
pub const DILUTION_ROW: usize = 23;
pub const SERVING_MASS_ROW: usize = 24;
pub const SERVINGS_PER_PACKAGE_ROW: usize = 25;

const SKIP_PREFIXES: [&str; 4] = ["dup", "blank", "bs", "low"];

static BATCH_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^BS[^0-9]*(\d+)").expect("valid batch marker regex"));
static BATCH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)BS[^0-9]*(\d+)").expect("valid batch token regex"));
static SAMPLE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:-\d+)?)").expect("valid sample header regex"));
static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}$").expect("valid date prefix regex"));

/// A spreadsheet cell reduced to what the template needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Number(value) => value.is_nan(),
            Cell::Text(text) => {
                let trimmed = text.trim();
                trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan")
            }
        }
    }

    fn as_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{}", *value as i64)
            }
            Cell::Number(value) => format!("{value}"),
            Cell::Text(text) => text.trim().to_string(),
        }
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Empty => Cell::Empty,
            Data::Int(n) => Cell::Number(*n as f64),
            Data::Float(n) => Cell::Number(*n),
            Data::String(s) => Cell::Text(s.clone()),
            Data::Bool(b) => Cell::Text(if *b { "True" } else { "False" }.to_string()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Text(format!("#{e:?}")),
        }
    }
}

/// Dense, zero-anchored copy of one worksheet.
#[derive(Debug, Clone, Default)]
pub struct SheetGrid {
    rows: Vec<Vec<Cell>>,
}

impl SheetGrid {
    pub fn from_rows(rows: Vec<Vec<Cell>>) -> Self {
        Self { rows }
    }

    fn from_range(range: &Range<Data>) -> Self {
        let Some((end_row, end_col)) = range.end() else {
            return Self::default();
        };
        let rows = (0..=end_row)
            .map(|row| {
                (0..=end_col)
                    .map(|col| range.get_value((row, col)).map(Cell::from).unwrap_or(Cell::Empty))
                    .collect()
            })
            .collect();
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .unwrap_or(&EMPTY)
    }

    fn header(&self) -> Vec<&Cell> {
        (0..self.width()).map(|col| self.cell(0, col)).collect()
    }
}

/// Parse a potency workbook into run metadata and per-column quantifications.
pub fn parse_workbook(path: &Path) -> Result<WorkbookExtraction, UploadError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Reject bad filenames before touching the file contents.
    parse_filename(path)?;

    let mut workbook = open_workbook_auto(path)
        .map_err(|err| UploadError::Workbook(path.to_path_buf(), err.to_string()))?;
    let sheet_names = workbook.sheet_names().to_vec();

    if !sheet_names.iter().any(|name| name == RESULTS_SHEET) {
        return Err(UploadError::malformed(
            file_name,
            format!("sheet '{RESULTS_SHEET}' not found"),
        ));
    }
    let results = workbook
        .worksheet_range(RESULTS_SHEET)
        .map_err(|err| UploadError::Workbook(path.to_path_buf(), err.to_string()))?;
    let results = SheetGrid::from_range(&results);

    let batch_sheet = if sheet_names.iter().any(|name| name == BATCH_SHEET) {
        let range = workbook
            .worksheet_range(BATCH_SHEET)
            .map_err(|err| UploadError::Workbook(path.to_path_buf(), err.to_string()))?;
        Some(SheetGrid::from_range(&range))
    } else {
        debug!(sheet = BATCH_SHEET, "sheet not found; skipping batch extraction");
        None
    };

    extract(path, &results, batch_sheet.as_ref())
}

/// Build the extraction from already-loaded sheets.
pub fn extract(
    path: &Path,
    results: &SheetGrid,
    batch_sheet: Option<&SheetGrid>,
) -> Result<WorkbookExtraction, UploadError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (run_date, file_batches) = parse_filename(path)?;

    if results.is_empty() || results.header().iter().all(|cell| cell.is_blank()) {
        return Err(UploadError::malformed(file_name, "no usable header row found"));
    }

    let sheet_batches = batch_sheet.map(extract_sheet_batches).unwrap_or_default();
    let assignments = extract_batch_assignments(results);

    let batch_numbers = deduplicate(
        file_batches
            .into_iter()
            .chain(sheet_batches)
            .chain(assignments.iter().map(|(batch, _)| batch.clone())),
    );

    let samples = parse_samples(results, &assignments);
    debug!(
        file = %file_name,
        samples = samples.len(),
        batches = batch_numbers.len(),
        "workbook parsed"
    );

    Ok(WorkbookExtraction {
        metadata: RunMetadata {
            run_date,
            batch_numbers,
            batch_sample_map: assignments.into_iter().collect(),
            source_filename: file_name,
        },
        samples,
    })
}

/// Run date and batch numbers from a `YYYYMMDD[_batch]* rest` file name.
pub fn parse_filename(path: &Path) -> Result<(NaiveDate, Vec<String>), UploadError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let primary = stem.split(' ').next().unwrap_or_default();
    let parts: Vec<&str> = primary.split('_').filter(|part| !part.is_empty()).collect();
    let Some(raw_date) = parts.first() else {
        return Err(UploadError::malformed(
            file_name,
            "file name does not contain the expected pattern",
        ));
    };
    if !DATE_PREFIX.is_match(raw_date) {
        return Err(UploadError::malformed(file_name, "missing YYYYMMDD date prefix"));
    }
    let run_date = NaiveDate::parse_from_str(raw_date, "%Y%m%d")
        .map_err(|err| UploadError::malformed(file_name.clone(), format!("invalid run date: {err}")))?;

    let batches = parts[1..]
        .iter()
        .filter(|part| is_all_digits(part))
        .map(|part| part.to_string())
        .collect();
    Ok((run_date, batches))
}

fn extract_sheet_batches(sheet: &SheetGrid) -> Vec<String> {
    let mut batches = Vec::new();
    for col in (0..sheet.width()).step_by(BATCH_COLUMN_STEP) {
        let cell = sheet.cell(0, col);
        if cell.is_blank() {
            break;
        }
        if let Some(token) = sanitize_batch_token(cell) {
            batches.push(token);
        }
    }
    batches
}

fn sanitize_batch_token(cell: &Cell) -> Option<String> {
    let text = cell.as_text();
    if let Some(captures) = BATCH_TOKEN.captures(&text) {
        return Some(captures[1].to_string());
    }
    if let Some(number) = coerce_number(cell) {
        if number.fract() == 0.0 {
            return Some(format!("{}", number as i64));
        }
        return Some(format!("{number}"));
    }
    let digits: String = text.chars().filter(|ch| ch.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Batch → sample ids inferred from blank-spike markers in the header row, in
/// first-seen batch order. Batches without samples are dropped.
fn extract_batch_assignments(results: &SheetGrid) -> Vec<(String, Vec<String>)> {
    let mut assignments: Vec<(String, Vec<String>)> = Vec::new();
    let mut current: Option<usize> = None;

    for cell in results.header() {
        if cell.is_blank() {
            continue;
        }
        let token = cell.as_text();
        let compact: String = token.chars().filter(|ch| !ch.is_whitespace()).collect();
        if let Some(captures) = BATCH_MARKER.captures(&compact) {
            let batch = captures[1].to_string();
            let position = match assignments.iter().position(|(name, _)| *name == batch) {
                Some(position) => position,
                None => {
                    assignments.push((batch, Vec::new()));
                    assignments.len() - 1
                }
            };
            current = Some(position);
            continue;
        }

        if should_skip_header(cell) {
            continue;
        }
        let Some(position) = current else {
            continue;
        };
        let Some(sample_id) = normalize_sample_header(&token) else {
            continue;
        };
        let bucket = &mut assignments[position].1;
        if !bucket.contains(&sample_id) {
            bucket.push(sample_id);
        }
    }

    assignments.retain(|(_, samples)| !samples.is_empty());
    assignments
}

fn parse_samples(
    results: &SheetGrid,
    assignments: &[(String, Vec<String>)],
) -> Vec<SampleQuantification> {
    let mut lookup: HashMap<&str, Vec<String>> = HashMap::new();
    for (batch, sample_ids) in assignments {
        for sample_id in sample_ids {
            lookup.entry(sample_id.as_str()).or_default().push(batch.clone());
        }
    }

    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut samples = Vec::new();

    for (col, cell) in results.header().into_iter().enumerate() {
        if should_skip_header(cell) {
            continue;
        }
        let raw_header = cell.as_text();
        let Some(sample_id) = normalize_sample_header(&raw_header) else {
            continue;
        };

        let base = base_sample_id(&sample_id);
        let counter = counters.entry(base.clone()).or_insert(0);
        let test_index = *counter;
        *counter += 1;

        let read_block = |offset: usize| -> BTreeMap<Analyte, Option<f64>> {
            Analyte::ALL
                .iter()
                .enumerate()
                .map(|(row, analyte)| (*analyte, coerce_number(results.cell(offset + row, col))))
                .collect()
        };

        samples.push(SampleQuantification {
            batch_numbers: lookup.get(sample_id.as_str()).cloned().unwrap_or_default(),
            sample_id,
            base_sample_id: base,
            test_index,
            column_header: format_column_header(&raw_header),
            components: read_block(COMPONENT_ROW_OFFSET),
            area_results: read_block(AREA_RESULT_ROW_OFFSET),
            sample_mass_mg: coerce_number(results.cell(SAMPLE_MASS_ROW, col)),
            dilution: coerce_number(results.cell(DILUTION_ROW, col)),
            serving_mass_g: coerce_number(results.cell(SERVING_MASS_ROW, col)),
            servings_per_package: coerce_number(results.cell(SERVINGS_PER_PACKAGE_ROW, col)),
        });
    }
    samples
}

/// Blank, `nan`, control columns (`dup`, `blank`, `bs`, `low`) and headers without a
/// digit never describe a sample.
pub fn should_skip_header(cell: &Cell) -> bool {
    if cell.is_blank() {
        return true;
    }
    let text = cell.as_text();
    let lowered = text.to_lowercase();
    if SKIP_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
        return true;
    }
    !text.chars().any(|ch| ch.is_ascii_digit())
}

/// Leading `digits` or `digits-digits` token of a header, `.0` float artifacts removed.
pub fn normalize_sample_header(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    let compact: String = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    if let Some(captures) = SAMPLE_HEADER.captures(&compact) {
        return Some(captures[1].to_string());
    }
    if let Some(integer) = text.strip_suffix(".0") {
        if is_all_digits(integer) {
            return Some(integer.to_string());
        }
    }
    Some(text.to_string())
}

fn format_column_header(value: &str) -> String {
    let text = value.trim();
    match text.strip_suffix(".0") {
        Some(integer) if is_all_digits(integer) => integer.to_string(),
        _ => text.to_string(),
    }
}

/// Lenient numeric coercion: comma-grouped text parses, anything else is `None`.
pub fn coerce_number(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Empty => None,
        Cell::Number(value) => (!value.is_nan()).then_some(*value),
        Cell::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
                return None;
            }
            trimmed
                .replace(',', "")
                .parse::<f64>()
                .ok()
                .filter(|value| !value.is_nan())
        }
    }
}

fn deduplicate(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for value in values {
        if !value.is_empty() && !result.contains(&value) {
            result.push(value);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Cell {
        Cell::Text(value.to_string())
    }

    #[test]
    fn skips_control_and_blank_headers() {
        for header in ["", "nan", "Dup 14956", "BLANK", "bs-con-8398", "Low std", "Sample"] {
            assert!(should_skip_header(&text(header)), "{header} should be skipped");
        }
        assert!(should_skip_header(&Cell::Empty));
        assert!(!should_skip_header(&text("14956-1")));
        assert!(!should_skip_header(&Cell::Number(14956.0)));
    }

    #[test]
    fn normalizes_headers() {
        assert_eq!(normalize_sample_header("14956 - 2 Inj").as_deref(), Some("14956-2"));
        assert_eq!(normalize_sample_header("14956.0").as_deref(), Some("14956"));
        assert_eq!(normalize_sample_header("  "), None);
        assert_eq!(format_column_header("14956.0"), "14956");
    }

    #[test]
    fn coerces_grouped_numbers_and_garbage() {
        assert_eq!(coerce_number(&text("1,021.5")), Some(1021.5));
        assert_eq!(coerce_number(&text("NaN")), None);
        assert_eq!(coerce_number(&text("<LOQ")), None);
        assert_eq!(coerce_number(&Cell::Number(f64::NAN)), None);
        assert_eq!(coerce_number(&Cell::Number(2.0)), Some(2.0));
    }

    #[test]
    fn sanitizes_batch_tokens() {
        assert_eq!(sanitize_batch_token(&text("BS-Con-8398")).as_deref(), Some("8398"));
        assert_eq!(sanitize_batch_token(&Cell::Number(1234.0)).as_deref(), Some("1234"));
        assert_eq!(sanitize_batch_token(&text("Batch #77")).as_deref(), Some("77"));
        assert_eq!(sanitize_batch_token(&text("none")), None);
    }

    #[test]
    fn filename_requires_date_prefix() {
        let (date, batches) = parse_filename(Path::new("20250101_8561_x_8545 run.xlsx")).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(batches, vec!["8561", "8545"]);
        assert!(parse_filename(Path::new("run_20250101.xlsx")).is_err());
        assert!(parse_filename(Path::new("20251399_1.xlsx")).is_err());
    }

    #[test]
    fn batch_assignments_follow_markers() {
        let grid = SheetGrid::from_rows(vec![vec![
            text("14000"),
            text("BS-Con-8398"),
            text("14956"),
            text("Dup 14956"),
            text("14957-1"),
            text("BS 8400"),
            text("BS 8401"),
            text("15000"),
        ]]);
        let assignments = extract_batch_assignments(&grid);
        assert_eq!(
            assignments,
            vec![
                ("8398".to_string(), vec!["14956".to_string(), "14957-1".to_string()]),
                ("8401".to_string(), vec!["15000".to_string()]),
            ]
        );
    }
}
