/// Narrows a run to selected operator ids and names. Empty lists admit all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseFilter {
    id_prefixes: Vec<String>,
    name_patterns: Vec<String>,
}

impl CaseFilter {
    #[must_use]
    pub fn new(ids: &[String], names: &[String]) -> Self {
        Self {
            id_prefixes: ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            name_patterns: names
                .iter()
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.id_prefixes.is_empty() && self.name_patterns.is_empty()
    }

    /// `"0_1"` admits `0_1` and `0_1_7` but not `0_10`.
    #[must_use]
    pub fn matches_id(&self, op_id: &str) -> bool {
        if self.id_prefixes.is_empty() {
            return true;
        }
        if op_id.is_empty() {
            return false;
        }
        self.id_prefixes.iter().any(|prefix| {
            op_id == prefix
                || op_id
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('_'))
        })
    }

    #[must_use]
    pub fn matches_name(&self, op_name: &str) -> bool {
        if self.name_patterns.is_empty() {
            return true;
        }
        if op_name.is_empty() {
            return false;
        }
        let lowered = op_name.to_lowercase();
        self.name_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }

    #[must_use]
    pub fn admits(&self, op_id: &str, op_name: &str) -> bool {
        self.matches_id(op_id) && self.matches_name(op_name)
    }
}

#[cfg(test)]
mod tests {
    use super::CaseFilter;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn open_filter_admits_everything() {
        let filter = CaseFilter::new(&[], &[]);
        assert!(filter.is_open());
        assert!(filter.admits("", ""));
        assert!(filter.admits("3_4", "ConcatOperation"));
    }

    #[test]
    fn id_prefix_respects_segment_boundaries() {
        let filter = CaseFilter::new(&strings(&["0_1"]), &[]);
        assert!(filter.matches_id("0_1"));
        assert!(filter.matches_id("0_1_7"));
        assert!(!filter.matches_id("0_10"));
        assert!(!filter.matches_id("1_0_1"));
        assert!(!filter.matches_id(""));
    }

    #[test]
    fn names_match_case_insensitive_substrings() {
        let filter = CaseFilter::new(&[], &strings(&["norm"]));
        assert!(filter.matches_name("RmsNormOperation"));
        assert!(filter.matches_name("LAYERNORM"));
        assert!(!filter.matches_name("Concat"));
        assert!(!filter.matches_name(""));
    }

    #[test]
    fn both_filters_must_match() {
        let filter = CaseFilter::new(&strings(&["2"]), &strings(&["linear"]));
        assert!(filter.admits("2_5", "LinearOperation"));
        assert!(!filter.admits("3_5", "LinearOperation"));
        assert!(!filter.admits("2_5", "MatMulOperation"));
    }
}
