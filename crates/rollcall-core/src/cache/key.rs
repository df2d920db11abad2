use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// Separator between the date and the project in a key's string form.
pub const KEY_DELIMITER: char = '|';

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Identifies one cacheable resource-day: a project's task list on a date.
///
/// Serializes as `YYYY-MM-DD|project`, which is also the key used in the
/// persisted snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    date: NaiveDate,
    project: String,
}

impl CacheKey {
    pub fn new(date: NaiveDate, project: impl Into<String>) -> Result<Self, CacheError> {
        let project = project.into();
        let invalid = |reason: &str| CacheError::InvalidKey {
            key: format!("{}{}{}", date.format(DATE_FORMAT), KEY_DELIMITER, project),
            reason: reason.to_string(),
        };
        if project.trim().is_empty() {
            return Err(invalid("project must not be empty"));
        }
        if project.contains(KEY_DELIMITER) {
            return Err(invalid("project must not contain '|'"));
        }
        Ok(Self { date, project })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn project(&self) -> &str {
        &self.project
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.date.format(DATE_FORMAT), KEY_DELIMITER, self.project)
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date, project) = s.split_once(KEY_DELIMITER).ok_or_else(|| CacheError::InvalidKey {
            key: s.to_string(),
            reason: "missing '|' delimiter".to_string(),
        })?;
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|e| CacheError::InvalidKey {
            key: s.to_string(),
            reason: format!("bad date: {}", e),
        })?;
        Self::new(date, project)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}
