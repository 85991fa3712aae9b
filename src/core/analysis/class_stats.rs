use std::collections::BTreeMap;

use crate::core::taxonomy::class_label;

/// Raw annotation count per class id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassFrequencyStats {
    counts: BTreeMap<u32, u64>,
}

impl ClassFrequencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, class_id: u32) {
        *self.counts.entry(class_id).or_insert(0) += 1;
    }

    pub fn get(&self, class_id: u32) -> u64 {
        self.counts.get(&class_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Fold another partial tally into this one
    pub fn merge(&mut self, other: &ClassFrequencyStats) {
        for (&class_id, &count) in &other.counts {
            *self.counts.entry(class_id).or_insert(0) += count;
        }
    }

    /// (class id, count) pairs in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.counts.iter().map(|(&id, &count)| (id, count))
    }

    /// Human readable lines, one per class
    pub fn summary_lines(&self) -> Vec<String> {
        self.iter()
            .map(|(id, count)| format!("Class {} ({}): {}", id, class_label(id), count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut a = ClassFrequencyStats::new();
        a.record(3);
        a.record(3);
        a.record(4);

        let mut b = ClassFrequencyStats::new();
        b.record(4);
        b.record(0);

        a.merge(&b);
        assert_eq!(a.get(3), 2);
        assert_eq!(a.get(4), 2);
        assert_eq!(a.get(0), 1);
        assert_eq!(a.get(8), 0);
        assert_eq!(a.total(), 5);
        assert_eq!(a.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![0, 3, 4]);
    }

    #[test]
    fn test_summary_lines_use_taxonomy_names() {
        let mut stats = ClassFrequencyStats::new();
        stats.record(1);
        stats.record(42);
        assert_eq!(
            stats.summary_lines(),
            vec!["Class 1 (RBC_Sickle): 1", "Class 42 (class_42): 1"]
        );
    }
}
