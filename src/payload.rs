//! Worksheet payloads in the flat `field -> text` shape QBench expects.

use std::collections::BTreeMap;

use crate::domain::{AREA_RESULT_SUFFIX, Analyte, SampleQuantification};

pub type WorksheetPayload = BTreeMap<String, String>;

/// Six fractional digits with trailing zeros and a dangling point removed.
pub fn format_number(value: f64) -> String {
    let text = format!("{value:.6}");
    if !text.contains('.') {
        return text;
    }
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Single-replicate cannabinoid payload. Empty when the column carries no values.
pub fn build_cannabinoid_payload(sample: &SampleQuantification) -> WorksheetPayload {
    let mut payload = WorksheetPayload::new();

    if let Some(value) = sample.sample_mass_mg {
        payload.insert("sample_mass".to_string(), format_number(value));
    }
    if let Some(value) = sample.dilution {
        payload.insert("dilution".to_string(), format_number(value));
    }
    if let Some(value) = sample.serving_mass_g {
        let formatted = format_number(value);
        payload.insert("serving_mass_g".to_string(), formatted.clone());
        payload.insert("unit_weight".to_string(), formatted);
    }
    if let Some(value) = sample.servings_per_package {
        let formatted = format_number(value);
        payload.insert("servings_per_package".to_string(), formatted.clone());
        payload.insert("units_per_package".to_string(), formatted);
    }

    for analyte in Analyte::ALL {
        if let Some(value) = sample.component(analyte) {
            payload.insert(analyte.key().to_string(), format_number(value));
        }
    }
    for analyte in Analyte::ALL {
        if let Some(value) = sample.area_result(analyte) {
            payload.insert(
                format!("{}{AREA_RESULT_SUFFIX}", analyte.key()),
                format_number(value),
            );
        }
    }

    payload
}

/// Homogeneity payload combining several replicates, every key suffixed with the
/// replicate index.
pub fn build_homogeneity_payload(
    samples: &[SampleQuantification],
    indices: &[usize],
) -> WorksheetPayload {
    let mut payload = WorksheetPayload::new();
    for (sample, index) in samples.iter().zip(indices) {
        populate_homogeneity_fields(&mut payload, sample, *index);
    }
    payload
}

fn populate_homogeneity_fields(
    payload: &mut WorksheetPayload,
    sample: &SampleQuantification,
    index: usize,
) {
    if let Some(value) = sample.sample_mass_mg {
        payload.insert(format!("sample_mass_{index}"), format_number(value));
    }
    if let Some(value) = sample.dilution {
        payload.insert(format!("dilution_{index}"), format_number(value));
    }
    for analyte in Analyte::ALL {
        if let Some(value) = sample.component(analyte) {
            payload.insert(format!("{}_{index}", analyte.key()), format_number(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_sample(index: usize) -> SampleQuantification {
        SampleQuantification {
            sample_id: if index == 0 {
                "15042".to_string()
            } else {
                format!("15042-{index}")
            },
            base_sample_id: "15042".to_string(),
            test_index: index,
            column_header: format!("15042 Inj {index}"),
            components: Analyte::ALL.iter().map(|a| (*a, None)).collect(),
            area_results: BTreeMap::new(),
            sample_mass_mg: None,
            dilution: None,
            serving_mass_g: None,
            servings_per_package: None,
            batch_numbers: Vec::new(),
        }
    }

    #[test]
    fn formats_numbers_like_the_worksheet() {
        assert_eq!(format_number(1021.0), "1021");
        assert_eq!(format_number(3.1), "3.1");
        assert_eq!(format_number(0.1213), "0.1213");
        assert_eq!(format_number(40.0), "40");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(0.00000049), "0");
        assert_eq!(format_number(-2.5), "-2.5");
    }

    #[test]
    fn cannabinoid_payload_formats_values() {
        let mut sample = make_sample(0);
        sample.components.insert(Analyte::Cbg, Some(0.1213));
        sample.components.insert(Analyte::D9Thc, Some(3.135));
        sample.area_results.insert(Analyte::Cbg, Some(27.31));
        sample.area_results.insert(Analyte::D9Thc, Some(634.4));
        sample.sample_mass_mg = Some(1021.0);
        sample.dilution = Some(40.0);
        sample.serving_mass_g = Some(3.1);
        sample.servings_per_package = Some(10.0);

        let payload = build_cannabinoid_payload(&sample);

        assert_eq!(payload["sample_mass"], "1021");
        assert_eq!(payload["dilution"], "40");
        assert_eq!(payload["serving_mass_g"], "3.1");
        assert_eq!(payload["unit_weight"], "3.1");
        assert_eq!(payload["servings_per_package"], "10");
        assert_eq!(payload["units_per_package"], "10");
        assert_eq!(payload["cbg"], "0.1213");
        assert_eq!(payload["d9_thc"], "3.135");
        assert_eq!(payload["cbg_area_result"], "27.31");
        assert_eq!(payload["d9_thc_area_result"], "634.4");
        assert_eq!(payload.len(), 10);
    }

    #[test]
    fn empty_column_yields_empty_payload() {
        assert!(build_cannabinoid_payload(&make_sample(0)).is_empty());
        assert!(build_homogeneity_payload(&[make_sample(0)], &[0]).is_empty());
    }

    #[test]
    fn homogeneity_payload_combines_indices() {
        let mut first = make_sample(0);
        first.components.insert(Analyte::Cbg, Some(0.12));
        first.sample_mass_mg = Some(100.0);
        first.dilution = Some(10.0);
        let mut second = make_sample(1);
        second.components.insert(Analyte::Cbg, Some(0.13));
        second.sample_mass_mg = Some(101.0);
        second.dilution = Some(11.0);
        second.serving_mass_g = Some(2.0);

        let payload = build_homogeneity_payload(&[first, second], &[0, 1]);

        assert_eq!(payload["sample_mass_0"], "100");
        assert_eq!(payload["sample_mass_1"], "101");
        assert_eq!(payload["dilution_0"], "10");
        assert_eq!(payload["dilution_1"], "11");
        assert_eq!(payload["cbg_0"], "0.12");
        assert_eq!(payload["cbg_1"], "0.13");
        assert_eq!(payload.len(), 6);
    }
}
