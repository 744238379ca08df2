use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::processing::reshape::PeriodSeries;
use crate::pipeline::sources::SourceSpec;

/// Declared scale of a source's raw values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scale {
    /// Values already in final units (rates, percentages, currency indices)
    #[default]
    Identity,
    /// Bounded ordinal scale mapped linearly onto 0-100
    Linear { min: f64, max: f64 },
}

impl Scale {
    /// Reject degenerate or non-finite bounds before any value is touched
    pub fn validate(&self) -> Result<()> {
        match *self {
            Scale::Identity => Ok(()),
            Scale::Linear { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(PipelineError::Configuration(format!(
                        "linear scale bounds must be finite (min={min}, max={max})"
                    )));
                }
                if max == min {
                    return Err(PipelineError::Configuration(format!(
                        "degenerate linear scale: min and max are both {min}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Map a raw value onto the canonical scale
    pub fn apply(&self, raw: f64) -> Result<f64> {
        self.validate()?;
        match *self {
            Scale::Identity => Ok(raw),
            Scale::Linear { min, max } => Ok(((raw - min) / (max - min) * 100.0).clamp(0.0, 100.0)),
        }
    }
}

/// Outlier handling; values past the bound are clamped, never dropped
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutlierClip {
    Absolute { lower: f64, upper: f64 },
    /// Tukey fences: [Q1 - k*IQR, Q3 + k*IQR] over the source's present values
    Iqr { multiplier: f64 },
}

impl OutlierClip {
    pub fn validate(&self) -> Result<()> {
        match *self {
            OutlierClip::Absolute { lower, upper } if !(lower <= upper) => Err(PipelineError::Configuration(format!(
                "absolute clip lower bound {lower} exceeds upper bound {upper}"
            ))),
            OutlierClip::Iqr { multiplier } if !(multiplier.is_finite() && multiplier >= 0.0) => Err(
                PipelineError::Configuration(format!("iqr clip multiplier must be a non-negative number, got {multiplier}")),
            ),
            _ => Ok(()),
        }
    }

    /// Clamp bounds for this series, or `None` when there is nothing to measure
    pub fn bounds(&self, values: &[f64]) -> Option<(f64, f64)> {
        match *self {
            OutlierClip::Absolute { lower, upper } => Some((lower, upper)),
            OutlierClip::Iqr { multiplier } => {
                if values.is_empty() {
                    return None;
                }
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let q1 = quantile(&sorted, 0.25);
                let q3 = quantile(&sorted, 0.75);
                let iqr = q3 - q1;
                Some((q1 - multiplier * iqr, q3 + multiplier * iqr))
            }
        }
    }
}

/// Linear-interpolated quantile of an ascending slice
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Clip then rescale a whole series. Absent entries stay absent.
pub fn normalize_values(
    source_id: &str,
    values: &[Option<f64>],
    scale: &Scale,
    clip: Option<&OutlierClip>,
) -> Result<Vec<Option<f64>>> {
    scale.validate()?;
    let bounds = match clip {
        Some(clip) => {
            clip.validate()?;
            let present: Vec<f64> = values.iter().flatten().copied().collect();
            clip.bounds(&present)
        }
        None => None,
    };

    let mut clipped = 0usize;
    let out = values
        .iter()
        .map(|value| {
            value
                .map(|raw| {
                    let bounded = match bounds {
                        Some((lo, hi)) if raw < lo || raw > hi => {
                            clipped += 1;
                            raw.clamp(lo, hi)
                        }
                        _ => raw,
                    };
                    scale.apply(bounded)
                })
                .transpose()
        })
        .collect::<Result<Vec<_>>>()?;

    if clipped > 0 {
        debug!(source_id, clipped, "Clamped outliers to bounds");
        crate::observability::metrics::normalize::values_clipped(source_id, clipped);
    }
    Ok(out)
}

/// Apply a source's declared clip and scale to its series, producing a new series
pub fn normalize_series(source: &SourceSpec, series: &PeriodSeries) -> Result<PeriodSeries> {
    let values = normalize_values(&source.id, &series.values(), &source.scale, source.clip.as_ref())?;
    Ok(series.with_values(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Frequency, Period};
    use crate::pipeline::processing::reshape::RawObservation;

    #[test]
    fn test_one_to_seven_pillar_scores() {
        let scale = Scale::Linear { min: 1.0, max: 7.0 };
        assert_eq!(scale.apply(7.0).unwrap(), 100.0);
        assert_eq!(scale.apply(1.0).unwrap(), 0.0);
        assert_eq!(scale.apply(4.0).unwrap(), 50.0);
    }

    #[test]
    fn test_linear_output_is_clipped() {
        let scale = Scale::Linear { min: 1.0, max: 7.0 };
        assert_eq!(scale.apply(7.6).unwrap(), 100.0);
        assert_eq!(scale.apply(0.2).unwrap(), 0.0);
    }

    #[test]
    fn test_degenerate_scale_is_configuration_error() {
        let scale = Scale::Linear { min: 3.0, max: 3.0 };
        assert!(matches!(scale.apply(3.0), Err(PipelineError::Configuration(_))));
        assert!(matches!(
            normalize_values("s", &[None], &scale, None),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_identity_passes_through() {
        assert_eq!(Scale::Identity.apply(-3.25).unwrap(), -3.25);
    }

    #[test]
    fn test_absent_values_stay_absent() {
        let scale = Scale::Linear { min: 1.0, max: 7.0 };
        let clip = OutlierClip::Iqr { multiplier: 1.5 };
        let out = normalize_values("s", &[Some(4.0), None, Some(7.0)], &scale, Some(&clip)).unwrap();
        assert_eq!(out, vec![Some(50.0), None, Some(100.0)]);
    }

    #[test]
    fn test_iqr_clip_clamps_instead_of_dropping() {
        let values = [Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(100.0)];
        let clip = OutlierClip::Iqr { multiplier: 1.5 };
        // Q1 = 2, Q3 = 4, fences [-1, 7]
        assert_eq!(clip.bounds(&[1.0, 2.0, 3.0, 4.0, 100.0]), Some((-1.0, 7.0)));
        let out = normalize_values("s", &values, &Scale::Identity, Some(&clip)).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[4], Some(7.0));
        assert_eq!(out[0], Some(1.0));
    }

    #[test]
    fn test_absolute_clip() {
        let clip = OutlierClip::Absolute { lower: 1.0, upper: 7.0 };
        let out = normalize_values("s", &[Some(7.4), Some(0.5)], &Scale::Identity, Some(&clip)).unwrap();
        assert_eq!(out, vec![Some(7.0), Some(1.0)]);
    }

    #[test]
    fn test_invalid_clip_configuration() {
        assert!(OutlierClip::Absolute { lower: 5.0, upper: 1.0 }.validate().is_err());
        assert!(OutlierClip::Iqr { multiplier: -1.0 }.validate().is_err());
        assert!(OutlierClip::Iqr { multiplier: 3.0 }.validate().is_ok());
    }

    #[test]
    fn test_normalize_series_leaves_input_untouched() {
        let source = SourceSpec::annual("wef", "wef.csv", "higher_education_score")
            .with_scale(Scale::Linear { min: 1.0, max: 7.0 });
        let series = PeriodSeries {
            source_id: "wef".into(),
            metric: "higher_education_score".into(),
            frequency: Frequency::Annual,
            observations: vec![
                RawObservation {
                    entity_code: "FR".into(),
                    entity_name: "France".into(),
                    period: Period::Year(2018),
                    value: Some(4.0),
                },
                RawObservation {
                    entity_code: "FR".into(),
                    entity_name: "France".into(),
                    period: Period::Year(2019),
                    value: None,
                },
            ],
            unparseable_cells: 0,
        };
        let normalized = normalize_series(&source, &series).unwrap();
        assert_eq!(normalized.values(), vec![Some(50.0), None]);
        assert_eq!(series.values(), vec![Some(4.0), None]);
    }
}
