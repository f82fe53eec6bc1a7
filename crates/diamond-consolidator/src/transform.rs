//! Pure decode of an opaque upstream payload into a canonical draft. No IO,
//! no rule evaluation — those are separate stages so the transform itself
//! stays a deterministic, independently testable function of its input.

use diamond_schemas::DiamondAttributes;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// The shape the upstream payload blob is expected to carry. Distinct from
/// [`DiamondAttributes`] because the upstream side is free-form and grade
/// strings arrive in whatever case the supplier feels like that day.
#[derive(Debug, Deserialize)]
struct UpstreamPayload {
    shape: String,
    color: String,
    clarity: String,
    cut: Option<String>,
    carats: f64,
    polish: Option<String>,
    symmetry: Option<String>,
    fluorescence: Option<String>,
    lab: Option<String>,
    certificate: Option<String>,
    #[serde(default)]
    lab_grown: bool,
    fancy_color: Option<String>,
    length_mm: Option<f64>,
    width_mm: Option<f64>,
    depth_mm: Option<f64>,
    table_pct: Option<f64>,
    depth_pct: Option<f64>,
    crown_angle: Option<f64>,
    pavilion_angle: Option<f64>,
    girdle: Option<String>,
    culet: Option<String>,
    #[serde(default)]
    media_urls: Vec<String>,
    supplier_price: f64,
    #[serde(default)]
    availability: Option<String>,
}

/// Canonical availability signal as reported by the upstream side, kept
/// separate from `Diamond.availability` (which is operational state owned by
/// the hold/purchase workflow and must never be overwritten by a re-run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAvailability {
    InStock,
    OutOfStock,
    Unknown,
}

pub struct Draft {
    pub attributes: DiamondAttributes,
    pub supplier_price: f64,
    pub upstream_availability: UpstreamAvailability,
}

fn normalize_grade(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn normalize_fluorescence(raw: &str) -> String {
    match raw.trim().to_uppercase().as_str() {
        "NONE" | "N" | "NIL" => "None".to_string(),
        "FAINT" | "FNT" => "Faint".to_string(),
        "MEDIUM" | "MED" | "M" => "Medium".to_string(),
        "STRONG" | "STG" | "S" => "Strong".to_string(),
        "VERY STRONG" | "VSTG" | "VS" => "Very Strong".to_string(),
        other => other.to_string(),
    }
}

/// Decode and normalize one upstream payload into a canonical draft.
pub fn transform_payload(payload: &serde_json::Value) -> Result<Draft, TransformError> {
    let parsed: UpstreamPayload =
        serde_json::from_value(payload.clone()).map_err(|e| TransformError::Malformed(e.to_string()))?;

    if parsed.carats <= 0.0 {
        return Err(TransformError::Malformed("carats must be positive".into()));
    }

    let attributes = DiamondAttributes {
        shape: normalize_grade(&parsed.shape),
        color: normalize_grade(&parsed.color),
        clarity: normalize_grade(&parsed.clarity),
        cut: parsed.cut.as_deref().map(normalize_grade),
        carats: parsed.carats,
        polish: parsed.polish.as_deref().map(normalize_grade),
        symmetry: parsed.symmetry.as_deref().map(normalize_grade),
        fluorescence: parsed.fluorescence.as_deref().map(normalize_fluorescence),
        lab: parsed.lab.as_deref().map(normalize_grade),
        certificate: parsed.certificate,
        lab_grown: parsed.lab_grown,
        fancy_color: parsed.fancy_color.filter(|c| !c.trim().is_empty()),
        length_mm: parsed.length_mm,
        width_mm: parsed.width_mm,
        depth_mm: parsed.depth_mm,
        table_pct: parsed.table_pct,
        depth_pct: parsed.depth_pct,
        crown_angle: parsed.crown_angle,
        pavilion_angle: parsed.pavilion_angle,
        girdle: parsed.girdle.as_deref().map(normalize_grade),
        culet: parsed.culet.as_deref().map(normalize_grade),
        media_urls: parsed.media_urls,
    };

    let upstream_availability = match parsed.availability.as_deref().map(|s| s.to_lowercase()) {
        Some(s) if s == "available" || s == "in_stock" || s == "in stock" => UpstreamAvailability::InStock,
        Some(s) if s == "sold" || s == "unavailable" || s == "out_of_stock" => UpstreamAvailability::OutOfStock,
        _ => UpstreamAvailability::Unknown,
    };

    Ok(Draft {
        attributes,
        supplier_price: parsed.supplier_price,
        upstream_availability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> serde_json::Value {
        serde_json::json!({
            "shape": "round",
            "color": "g",
            "clarity": "vs1",
            "cut": "excellent",
            "carats": 1.01,
            "polish": "excellent",
            "symmetry": "excellent",
            "fluorescence": "none",
            "lab": "gia",
            "certificate": "1234567",
            "lab_grown": false,
            "fancy_color": null,
            "length_mm": 6.5,
            "width_mm": 6.52,
            "depth_mm": 4.0,
            "table_pct": 58.0,
            "depth_pct": 61.5,
            "crown_angle": 34.5,
            "pavilion_angle": 40.8,
            "girdle": "medium",
            "culet": "none",
            "media_urls": [],
            "supplier_price": 4200.0,
            "availability": "available",
        })
    }

    #[test]
    fn grades_are_normalized_to_uppercase() {
        let draft = transform_payload(&sample_payload()).unwrap();
        assert_eq!(draft.attributes.shape, "ROUND");
        assert_eq!(draft.attributes.color, "G");
        assert_eq!(draft.attributes.fluorescence.as_deref(), Some("None"));
    }

    #[test]
    fn empty_fancy_color_means_not_fancy() {
        let mut payload = sample_payload();
        payload["fancy_color"] = serde_json::json!("");
        let draft = transform_payload(&payload).unwrap();
        assert!(draft.attributes.fancy_color.is_none());
    }

    #[test]
    fn zero_carats_is_a_malformed_permanent_item_error() {
        let mut payload = sample_payload();
        payload["carats"] = serde_json::json!(0.0);
        assert!(transform_payload(&payload).is_err());
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let mut payload = sample_payload();
        payload.as_object_mut().unwrap().remove("shape");
        assert!(transform_payload(&payload).is_err());
    }
}
