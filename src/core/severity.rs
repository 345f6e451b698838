use crate::core::macros::string_enum;

string_enum! {
    /// Severity shared by risk bands, tests, results and alerts.
    pub enum Severity {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

impl Severity {
    /// Higher is worse; used for sorting.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_orders_worst_first() {
        let mut all = Severity::ALL.to_vec();
        all.sort_by_key(|s| std::cmp::Reverse(s.rank()));
        assert_eq!(all[0], Severity::Critical);
        assert_eq!(all[3], Severity::Low);
    }
}
