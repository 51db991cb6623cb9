use std::io::{self, Write};

use serde::Serialize;

use crate::app::{RunReport, UploadOutcome};
use crate::domain::{Analyte, SampleQuantification, WorkbookExtraction};
use crate::payload::format_number;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_extraction(extraction: &WorkbookExtraction) -> io::Result<()> {
        Self::print_json(extraction)
    }

    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub fn print_outcome(outcome: &UploadOutcome) {
    let (processed_label, skipped_label) = if outcome.dry_run {
        ("Samples analysed", "Samples skipped")
    } else {
        ("Samples updated", "Samples skipped")
    };
    println!("{processed_label}: {}", outcome.total_processed_samples());
    println!("{skipped_label}: {}", outcome.total_skipped_samples());
    println!();
    println!("{}", outcome.summary_text());
}

/// Field-by-column table of a parsed workbook, for review before publishing.
pub fn render_preview(extraction: &WorkbookExtraction) -> String {
    let mut samples: Vec<_> = extraction.samples.iter().collect();
    samples.sort_by(|a, b| {
        a.base_sample_id
            .cmp(&b.base_sample_id)
            .then(a.test_index.cmp(&b.test_index))
    });

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut header = vec!["Field".to_string()];
    header.extend(samples.iter().map(|sample| sample.display_header().to_string()));
    rows.push(header);

    let cell = |value: Option<f64>| value.map(format_number).unwrap_or_else(|| "-".to_string());
    for analyte in Analyte::ALL {
        let mut row = vec![analyte.label().to_string()];
        row.extend(samples.iter().map(|sample| cell(sample.component(analyte))));
        rows.push(row);
    }
    let metadata: [(&str, fn(&SampleQuantification) -> Option<f64>); 4] = [
        ("sample_mass", |s| s.sample_mass_mg),
        ("dilution", |s| s.dilution),
        ("serving_mass_g", |s| s.serving_mass_g),
        ("servings_per_package", |s| s.servings_per_package),
    ];
    for (label, getter) in metadata {
        let mut row = vec![label.to_string()];
        row.extend(samples.iter().map(|sample| cell(getter(sample))));
        rows.push(row);
    }
    for analyte in Analyte::ALL {
        let mut row = vec![format!("{} area", analyte.label())];
        row.extend(samples.iter().map(|sample| cell(sample.area_result(analyte))));
        rows.push(row);
    }

    let widths: Vec<usize> = (0..rows[0].len())
        .map(|col| rows.iter().map(|row| row[col].len()).max().unwrap_or(0))
        .collect();

    let meta = &extraction.metadata;
    let mut out = format!(
        "Run {} - {} tests - batches [{}]\n",
        meta.run_date,
        extraction.samples.len(),
        meta.batch_numbers.join(", ")
    );
    for row in rows {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(value, width)| format!("{value:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
