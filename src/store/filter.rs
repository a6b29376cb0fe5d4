use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::error::StoreError;

/// Conditions for listing reports. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportFilter {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the location.
    pub location: Option<String>,
    /// Case-insensitive substring of the user.
    pub user: Option<String>,
    pub microplastics_present: Option<bool>,
    /// Case-insensitive substring of slide name, location or user.
    pub search: Option<String>,
}

impl ReportFilter {
    pub const KEYS: [&'static str; 6] = [
        "date_from",
        "date_to",
        "location",
        "user",
        "microplastics_present",
        "search",
    ];

    /// Parses query-string style pairs. Empty values are ignored; unknown keys and
    /// malformed values are rejected.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filter = ReportFilter::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if !Self::KEYS.contains(&key) {
                return Err(StoreError::InvalidQuery(format!("unknown filter '{key}'")));
            }
            if value.is_empty() {
                continue;
            }
            match key {
                "date_from" => filter.date_from = Some(parse_date(key, value, false)?),
                "date_to" => filter.date_to = Some(parse_date(key, value, true)?),
                "location" => filter.location = Some(value.to_string()),
                "user" => filter.user = Some(value.to_string()),
                "microplastics_present" => filter.microplastics_present = Some(parse_bool(key, value)?),
                _ => filter.search = Some(value.to_string()),
            }
        }

        if let (Some(from), Some(to)) = (filter.date_from, filter.date_to) {
            if from > to {
                return Err(StoreError::InvalidQuery(format!(
                    "date_from {from} is after date_to {to}"
                )));
            }
        }
        Ok(filter)
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn microplastics_present(mut self, present: bool) -> Self {
        self.microplastics_present = Some(present);
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    /// Appends ` AND ...` clauses; the builder must already hold a `WHERE`.
    pub(crate) fn push_conditions<'a>(&'a self, query: &mut QueryBuilder<'a, Sqlite>) {
        if let Some(from) = self.date_from {
            query.push(" AND created_at >= ").push_bind(from.timestamp_micros());
        }
        if let Some(to) = self.date_to {
            query.push(" AND created_at <= ").push_bind(to.timestamp_micros());
        }
        if let Some(location) = &self.location {
            query
                .push(" AND instr(lower(location), lower(")
                .push_bind(location.as_str())
                .push(")) > 0");
        }
        if let Some(user) = &self.user {
            query
                .push(" AND instr(lower(user), lower(")
                .push_bind(user.as_str())
                .push(")) > 0");
        }
        if let Some(present) = self.microplastics_present {
            query.push(" AND microplastics_present = ").push_bind(present);
        }
        if let Some(term) = &self.search {
            query
                .push(" AND instr(lower(slide_name || ' ' || location || ' ' || user), lower(")
                .push_bind(term.as_str())
                .push(")) > 0");
        }
    }
}

fn parse_date(key: &str, value: &str, end_of_day: bool) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        StoreError::InvalidQuery(format!(
            "{key} '{value}' is neither RFC 3339 nor YYYY-MM-DD"
        ))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    };
    let time = time.ok_or_else(|| StoreError::InvalidQuery(format!("{key} '{value}' is out of range")))?;
    Ok(date.and_time(time).and_utc())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, StoreError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(StoreError::InvalidQuery(format!("{key} '{value}' is not a boolean"))),
    }
}
