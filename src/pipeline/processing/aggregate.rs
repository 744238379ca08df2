//! Reduces sub-annual series to one value per entity-year.
//!
//! The annual value is the arithmetic mean of the periods observed in that
//! year. A partially covered year (say 7 of 12 months) still gets a mean over
//! what is present; no minimum-coverage threshold is applied.
//! A year with no observed period yields no value at all.

use std::collections::BTreeMap;

use crate::domain::{Frequency, Period};
use crate::pipeline::processing::reshape::RawObservation;

/// Annual values keyed by (entity_code, year)
pub type AnnualValues = BTreeMap<(String, i32), f64>;

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Collapse observations to annual means.
///
/// Duplicate rows for the same (entity, period) are averaged first so every
/// period weighs the same in the yearly mean. Annual-native series come out
/// unchanged.
pub fn to_annual(observations: &[RawObservation], frequency: Frequency) -> AnnualValues {
    let mut per_period: BTreeMap<(String, Period), Mean> = BTreeMap::new();
    for obs in observations {
        if let Some(value) = obs.value {
            per_period
                .entry((obs.entity_code.clone(), obs.period))
                .or_default()
                .push(value);
        }
    }

    let mut per_year: BTreeMap<(String, i32), Mean> = BTreeMap::new();
    for ((code, period), mean) in per_period {
        if let Some(value) = mean.value() {
            per_year.entry((code, period.year())).or_default().push(value);
        }
    }

    let annual: AnnualValues = per_year
        .into_iter()
        .filter_map(|(key, mean)| mean.value().map(|v| (key, v)))
        .collect();

    tracing::debug!(?frequency, entity_years = annual.len(), "Aggregated series to annual values");
    annual
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(code: &str, period: Period, value: Option<f64>) -> RawObservation {
        RawObservation {
            entity_code: code.to_string(),
            entity_name: format!("{code} name"),
            period,
            value,
        }
    }

    fn month(year: i32, month: u32) -> Period {
        Period::Month { year, month }
    }

    #[test]
    fn test_monthly_mean_of_available_months() {
        // Jan..Jun 2020 present, nothing observed in 2021
        let mut series: Vec<RawObservation> = (1..=6).map(|m| obs("FR", month(2020, m), Some(m as f64 * 10.0))).collect();
        series.extend((1..=12).map(|m| obs("FR", month(2021, m), None)));

        let annual = to_annual(&series, Frequency::Monthly);
        assert_eq!(annual.get(&("FR".to_string(), 2020)), Some(&35.0));
        assert!(!annual.contains_key(&("FR".to_string(), 2021)));
    }

    #[test]
    fn test_quarterly_mean() {
        let series = vec![
            obs("DE", Period::Quarter { year: 2019, quarter: 1 }, Some(4.0)),
            obs("DE", Period::Quarter { year: 2019, quarter: 3 }, Some(6.0)),
            obs("DE", Period::Quarter { year: 2019, quarter: 4 }, None),
        ];
        let annual = to_annual(&series, Frequency::Quarterly);
        assert_eq!(annual.get(&("DE".to_string(), 2019)), Some(&5.0));
    }

    #[test]
    fn test_annual_passes_through() {
        let series = vec![obs("XX", Period::Year(2018), Some(2.7)), obs("XX", Period::Year(2019), None)];
        let annual = to_annual(&series, Frequency::Annual);
        assert_eq!(annual.len(), 1);
        assert_eq!(annual.get(&("XX".to_string(), 2018)), Some(&2.7));
    }

    #[test]
    fn test_duplicate_rows_weigh_each_period_once() {
        // two rows for January, one for February
        let series = vec![
            obs("IT", month(2020, 1), Some(10.0)),
            obs("IT", month(2020, 1), Some(20.0)),
            obs("IT", month(2020, 2), Some(45.0)),
        ];
        let annual = to_annual(&series, Frequency::Monthly);
        assert_eq!(annual.get(&("IT".to_string(), 2020)), Some(&30.0));
    }

    #[test]
    fn test_zero_is_a_value_not_absence() {
        let series = vec![obs("ZZ", Period::Year(2020), Some(0.0))];
        let annual = to_annual(&series, Frequency::Annual);
        assert_eq!(annual.get(&("ZZ".to_string(), 2020)), Some(&0.0));
    }
}
