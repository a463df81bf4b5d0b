use serde::{Deserialize, Serialize};

use crate::calc::CalcError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub grade: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradingModel {
    pub bands: Vec<GradeBand>,
}

/// Maps a score to a letter grade. Bands are inclusive at both ends; a score
/// outside every band falls through to the fixed default ladder.
pub fn calculate_grade(score: f64, model: Option<&GradingModel>) -> String {
    if let Some(model) = model {
        for band in &model.bands {
            if score >= band.min && score <= band.max {
                return band.grade.clone();
            }
        }
    }

    if score >= 70.0 {
        "A".to_string()
    } else if score >= 60.0 {
        "B".to_string()
    } else if score >= 50.0 {
        "C".to_string()
    } else if score >= 45.0 {
        "D".to_string()
    } else if score >= 40.0 {
        "E".to_string()
    } else {
        "F".to_string()
    }
}

/// Accepts the wire shape `{ "A": [70, 100], "B": [60, 69], ... }` and returns
/// bands sorted ascending by range start.
pub fn parse_grading_model(raw: &serde_json::Value) -> Result<GradingModel, CalcError> {
    let Some(obj) = raw.as_object() else {
        return Err(CalcError::new(
            "bad_params",
            "grading model must be an object mapping grade to [min, max]",
        ));
    };
    if obj.is_empty() {
        return Err(CalcError::new(
            "bad_params",
            "grading model must declare at least one band",
        ));
    }

    let mut bands: Vec<GradeBand> = Vec::with_capacity(obj.len());
    for (grade, range) in obj {
        let pair = range.as_array().filter(|a| a.len() == 2);
        let Some(pair) = pair else {
            return Err(CalcError::new(
                "bad_params",
                format!("band '{}' must be a [min, max] pair", grade),
            ));
        };
        let (Some(min), Some(max)) = (pair[0].as_f64(), pair[1].as_f64()) else {
            return Err(CalcError::new(
                "bad_params",
                format!("band '{}' bounds must be numeric", grade),
            ));
        };
        bands.push(GradeBand {
            grade: grade.trim().to_string(),
            min,
            max,
        });
    }

    bands.sort_by(|a, b| a.min.partial_cmp(&b.min).unwrap_or(std::cmp::Ordering::Equal));
    validate_bands(&bands)?;
    Ok(GradingModel { bands })
}

fn validate_bands(bands: &[GradeBand]) -> Result<(), CalcError> {
    for band in bands {
        if band.grade.is_empty() {
            return Err(CalcError::new("bad_params", "band grade must not be empty"));
        }
        if !band.min.is_finite() || !band.max.is_finite() {
            return Err(CalcError::new(
                "bad_params",
                format!("band '{}' bounds must be finite", band.grade),
            ));
        }
        if band.min > band.max {
            return Err(CalcError::new(
                "bad_params",
                format!("band '{}' has min above max", band.grade),
            ));
        }
        if band.min < 0.0 || band.max > 100.0 {
            return Err(CalcError::new(
                "bad_params",
                format!("band '{}' must lie within 0-100", band.grade),
            ));
        }
    }

    let first = bands.first().expect("validated non-empty");
    let last = bands.last().expect("validated non-empty");
    if first.min != 0.0 {
        return Err(CalcError::new(
            "bad_params",
            format!("coverage must start at 0, got {}", first.min),
        ));
    }
    if last.max != 100.0 {
        return Err(CalcError::new(
            "bad_params",
            format!("coverage must end at 100, got {}", last.max),
        ));
    }

    for pair in bands.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.min <= prev.max {
            return Err(CalcError::new(
                "bad_params",
                format!("bands '{}' and '{}' overlap", prev.grade, next.grade),
            ));
        }
        // Integer-convention adjacency: [0,39] then [40,44] is contiguous.
        if next.min - prev.max > 1.0 {
            return Err(CalcError::new(
                "bad_params",
                format!("gap between bands '{}' and '{}'", prev.grade, next.grade),
            ));
        }
    }

    Ok(())
}

pub fn model_to_wire(model: &GradingModel) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for band in &model.bands {
        obj.insert(
            band.grade.clone(),
            serde_json::json!([band.min, band.max]),
        );
    }
    serde_json::Value::Object(obj)
}
