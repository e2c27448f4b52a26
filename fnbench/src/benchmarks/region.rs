//! Region allocation.
//!
//! Regions are used cleanest first (lowest grid carbon intensity). Each region
//! takes up to `max_per_region` functions before the next one is used.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RegionAllocator {
    regions: Vec<String>,
    max_per_region: usize,
    counts: HashMap<String, usize>,
}

impl RegionAllocator {
    pub fn new(regions: Vec<String>, max_per_region: usize) -> Self {
        Self {
            regions,
            max_per_region: max_per_region.max(1),
            counts: HashMap::new(),
        }
    }

    /// Allocator over `regions` ordered by ascending carbon intensity.
    ///
    /// Regions without a figure keep their configured order after every
    /// ranked region.
    pub fn ranked(
        mut regions: Vec<String>,
        intensity: &BTreeMap<String, f64>,
        max_per_region: usize,
    ) -> Self {
        regions.sort_by(|a, b| match (intensity.get(a), intensity.get(b)) {
            (Some(x), Some(y)) => x.total_cmp(y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        if !intensity.is_empty() {
            debug!(order = %regions.join(","), "Regions ranked by carbon intensity");
        }
        Self::new(regions, max_per_region)
    }

    /// Next region with spare capacity.
    ///
    /// Falls back to the first region once every region is full. Returns
    /// `None` only when no regions are configured.
    pub fn allocate(&mut self) -> Option<String> {
        let region = match self
            .regions
            .iter()
            .find(|r| self.counts.get(*r).copied().unwrap_or(0) < self.max_per_region)
        {
            Some(region) => region.clone(),
            None => {
                let first = self.regions.first()?.clone();
                warn!(region = %first, "All regions at capacity, reusing first region");
                first
            }
        };
        *self.counts.entry(region.clone()).or_default() += 1;
        Some(region)
    }

    pub fn allocated(&self, region: &str) -> usize {
        self.counts.get(region).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fills_cleanest_first() {
        let mut alloc = RegionAllocator::new(regions(&["a", "b", "c"]), 2);
        let got: Vec<_> = (0..5).filter_map(|_| alloc.allocate()).collect();
        assert_eq!(got, vec!["a", "a", "b", "b", "c"]);
    }

    #[test]
    fn test_overflow_falls_back_to_first() {
        let mut alloc = RegionAllocator::new(regions(&["a", "b"]), 1);
        assert_eq!(alloc.allocate().as_deref(), Some("a"));
        assert_eq!(alloc.allocate().as_deref(), Some("b"));
        assert_eq!(alloc.allocate().as_deref(), Some("a"));
        assert_eq!(alloc.allocated("a"), 2);
    }

    #[test]
    fn test_ranked_by_carbon_intensity() {
        let intensity = BTreeMap::from([
            ("us-east1".to_string(), 576.0),
            ("europe-north1".to_string(), 39.0),
            ("europe-west1".to_string(), 103.0),
        ]);
        let mut alloc = RegionAllocator::ranked(
            regions(&["us-east1", "asia-south1", "europe-west1", "me-west1", "europe-north1"]),
            &intensity,
            1,
        );
        let got: Vec<_> = (0..5).filter_map(|_| alloc.allocate()).collect();
        assert_eq!(
            got,
            vec!["europe-north1", "europe-west1", "us-east1", "asia-south1", "me-west1"]
        );
    }

    #[test]
    fn test_ranked_without_figures_keeps_order() {
        let mut alloc = RegionAllocator::ranked(regions(&["c", "a", "b"]), &BTreeMap::new(), 1);
        let got: Vec<_> = (0..3).filter_map(|_| alloc.allocate()).collect();
        assert_eq!(got, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_no_regions() {
        let mut alloc = RegionAllocator::new(Vec::new(), 20);
        assert_eq!(alloc.allocate(), None);
    }
}
