use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One day of attendance history as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct AttendanceDay {
    pub date: NaiveDate,
    pub status: String,
    #[serde(rename = "checkIn", default)]
    pub check_in: Option<String>,
    #[serde(rename = "checkOut", default)]
    pub check_out: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl AttendanceDay {
    /// Both punches recorded for the day.
    pub fn is_complete(&self) -> bool {
        self.check_in.is_some() && self.check_out.is_some()
    }

    pub fn punch_display(&self) -> String {
        format!(
            "{} - {}",
            self.check_in.as_deref().unwrap_or("--:--"),
            self.check_out.as_deref().unwrap_or("--:--")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attendance_day() {
        let json = r#"{"date":"2024-01-02","status":"present","checkIn":"08:58","checkOut":"17:30","location":"SiteA"}"#;
        let day: AttendanceDay = serde_json::from_str(json).unwrap();
        assert_eq!(day.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert!(day.is_complete());
        assert_eq!(day.punch_display(), "08:58 - 17:30");
        assert_eq!(day.note, None);
    }

    #[test]
    fn test_missing_check_out() {
        let json = r#"{"date":"2024-01-03","status":"present","checkIn":"09:10"}"#;
        let day: AttendanceDay = serde_json::from_str(json).unwrap();
        assert!(!day.is_complete());
        assert_eq!(day.punch_display(), "09:10 - --:--");
    }

    #[test]
    fn test_rejects_malformed_date() {
        let json = r#"{"date":"03/01/2024","status":"present"}"#;
        assert!(serde_json::from_str::<AttendanceDay>(json).is_err());
    }
}
