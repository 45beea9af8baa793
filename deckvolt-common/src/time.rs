//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Compact UTC stamp safe for file names (`20250101T120000.123Z`)
pub fn file_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_stamp_has_no_separators() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let stamp = file_stamp(at);
        assert_eq!(stamp, "20250304T050607.000Z");
        assert!(!stamp.contains(':'));
        assert!(!stamp.contains('/'));
    }

    #[test]
    fn test_file_stamps_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 11, 4, 5, 6, 7).unwrap();
        assert!(file_stamp(earlier) < file_stamp(later));
    }
}
