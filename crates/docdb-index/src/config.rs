use serde::Deserialize;

/// Process-wide knobs for composite indexes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct IndexConfig {
    /// Upper bound on a serialized index entry, shared between the paths of
    /// a composite index.
    pub index_term_size_limit: usize,
    /// Allows definitions that ask for reduced correlated terms to use them.
    pub enable_reduced_correlated_terms: bool,
    pub enable_composite_term_truncation: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            index_term_size_limit: 2048,
            enable_reduced_correlated_terms: false,
            enable_composite_term_truncation: true,
        }
    }
}

impl IndexConfig {
    /// Byte budget for one path's term: `floor(limit / paths) - 4`.
    pub fn path_term_budget(&self, num_paths: usize) -> Option<usize> {
        if !self.enable_composite_term_truncation {
            return None;
        }
        let per_path = self.index_term_size_limit / num_paths.max(1);
        Some(per_path.saturating_sub(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_splits_the_limit() {
        let config = IndexConfig::default();
        assert_eq!(config.path_term_budget(1), Some(2044));
        assert_eq!(config.path_term_budget(3), Some(678));

        let config = IndexConfig {
            enable_composite_term_truncation: false,
            ..IndexConfig::default()
        };
        assert_eq!(config.path_term_budget(2), None);
    }
}
