use indexmap::IndexMap;
use serde::Serialize;

use crate::pipeline::domain::PlanktonResult;

/// Aggregates over all live (not soft-deleted) reports. Confidence figures only cover
/// reports where microplastics were found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportStatistics {
    pub total_reports: u64,
    pub with_microplastics: u64,
    /// Percentage of reports with microplastics present.
    pub detection_rate: f64,
    pub average_confidence: Option<f64>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub reports_last_7_days: u64,
    /// Organisms per species across all plankton results, most abundant first.
    pub species_distribution: IndexMap<String, u64>,
    /// Most recent months with reports, newest first.
    pub monthly_data: Vec<MonthlyDetections>,
}

/// Reports filed in one calendar month (UTC, `YYYY-MM`) and how many found microplastics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyDetections {
    pub month: String,
    pub total: u64,
    pub detections: u64,
}

impl ReportStatistics {
    pub(crate) fn detection_rate(total: u64, positive: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (positive as f64 / total as f64 * 1000.0).round() / 10.0
        }
    }
}

/// Sums species counts over many plankton results, ordered by total descending.
#[derive(Debug, Default)]
pub(crate) struct SpeciesTally {
    counts: IndexMap<String, u64>,
}

impl SpeciesTally {
    pub(crate) fn add(&mut self, result: &PlanktonResult) {
        for (species, count) in &result.species_summary {
            *self.counts.entry(species.clone()).or_insert(0) += *count as u64;
        }
    }

    pub(crate) fn finish(mut self) -> IndexMap<String, u64> {
        self.counts.sort_by(|ka, a, kb, b| b.cmp(a).then_with(|| ka.cmp(kb)));
        self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_rate_is_a_rounded_percentage() {
        assert_eq!(ReportStatistics::detection_rate(0, 0), 0.0);
        assert_eq!(ReportStatistics::detection_rate(3, 1), 33.3);
        assert_eq!(ReportStatistics::detection_rate(4, 4), 100.0);
    }

    #[test]
    fn tally_orders_by_total() {
        let result = |pairs: &[(&str, u32)]| PlanktonResult {
            species_summary: pairs.iter().map(|(s, c)| (s.to_string(), *c)).collect(),
            detailed: Vec::new(),
        };
        let mut tally = SpeciesTally::default();
        tally.add(&result(&[("Diatoms", 3), ("Copepods", 2)]));
        tally.add(&result(&[("Copepods", 4), ("Rotifers", 3)]));

        let distribution: Vec<(String, u64)> = tally.finish().into_iter().collect();
        assert_eq!(
            distribution,
            vec![
                ("Copepods".to_string(), 6),
                ("Diatoms".to_string(), 3),
                ("Rotifers".to_string(), 3)
            ]
        );
    }
}
