//! Canonical units for recorded metrics and SI-prefix conversion.

use crate::MetricError;

/// Canonical unit a metric is stored in, if it has one.
pub fn canonical_unit(metric: &str) -> Option<&'static str> {
    match metric {
        "fmax" => Some("Hz"),
        "cellarea" | "totalarea" | "macroarea" | "padcellarea" | "stdcellarea" => Some("um^2"),
        "peakpower" | "averagepower" | "leakagepower" | "dozepower" | "idlepower"
        | "sleeppower" => Some("W"),
        "setupslack" | "holdslack" | "setuptns" | "holdtns" | "setupwns" | "holdwns"
        | "setupskew" | "holdskew" => Some("ns"),
        "exetime" | "tasktime" => Some("s"),
        "memory" => Some("B"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ParsedUnit {
    base: &'static str,
    scale: f64,
}

// "m^2" must be tried before the single-letter bases
const BASES: [(&str, i32); 5] = [("m^2", 2), ("Hz", 1), ("s", 1), ("W", 1), ("B", 1)];

fn prefix_scale(prefix: &str) -> Option<f64> {
    let scale = match prefix {
        "" => 1.0,
        "f" => 1e-15,
        "p" => 1e-12,
        "n" => 1e-9,
        "u" | "µ" | "μ" => 1e-6,
        "m" => 1e-3,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        _ => return None,
    };
    Some(scale)
}

fn parse_unit(unit: &str) -> Result<ParsedUnit, MetricError> {
    let unit = unit.trim();
    for (base, power) in BASES {
        if let Some(prefix) = unit.strip_suffix(base) {
            if let Some(scale) = prefix_scale(prefix) {
                return Ok(ParsedUnit {
                    base,
                    scale: scale.powi(power),
                });
            }
        }
    }
    Err(MetricError::UnknownUnit(unit.to_string()))
}

/// Convert `value` from `source_unit` into the canonical unit of `metric`.
///
/// Returns the converted value and the unit it is now expressed in. Metrics
/// without a canonical unit keep the value and the source unit untouched.
pub fn convert(
    metric: &str,
    value: f64,
    source_unit: Option<&str>,
) -> Result<(f64, Option<String>), MetricError> {
    let Some(canonical) = canonical_unit(metric) else {
        return Ok((value, source_unit.map(String::from)));
    };
    let Some(source_unit) = source_unit else {
        return Ok((value, Some(canonical.to_string())));
    };
    if source_unit == canonical {
        return Ok((value, Some(canonical.to_string())));
    }

    let from = parse_unit(source_unit)?;
    let to = parse_unit(canonical)?;
    if from.base != to.base {
        return Err(MetricError::UnitMismatch {
            metric: metric.to_string(),
            unit: source_unit.to_string(),
            canonical: canonical.to_string(),
        });
    }
    Ok((value * from.scale / to.scale, Some(canonical.to_string())))
}
