use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::ScanPolicy;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d %b %Y"];

/// Inclusive `YYYY-MM` bounds; `None` leaves that side open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl ScanRange {
    pub fn single_month(key: &str) -> Self {
        Self {
            start: Some(key.to_string()),
            end: Some(key.to_string()),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, key: &str) -> bool {
        let after_start = self.start.as_deref().is_none_or(|start| start <= key);
        let before_end = self.end.as_deref().is_none_or(|end| key <= end);
        after_start && before_end
    }

    pub fn describe(&self) -> String {
        match (&self.start, &self.end) {
            (None, None) => "all".to_string(),
            (start, end) => format!(
                "{}..{}",
                start.as_deref().unwrap_or("*"),
                end.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// Decides which months to (re-)scan.
///
/// A store that has been idle for more than `resume_gap_months` resumes from
/// the month of its newest post; otherwise the last `rescan_window_months`
/// are rescanned so replies added to recent threads are picked up.
pub fn plan_range(latest: Option<NaiveDate>, today: NaiveDate, policy: &ScanPolicy) -> ScanRange {
    let Some(latest) = latest else {
        return ScanRange::default();
    };
    let gap_months = (i64::from(today.year()) - i64::from(latest.year())) * 12
        + (i64::from(today.month()) - i64::from(latest.month()));

    let start = if gap_months > i64::from(policy.resume_gap_months) {
        latest
    } else {
        today
            .checked_sub_months(Months::new(policy.rescan_window_months))
            .unwrap_or(NaiveDate::MIN)
    };
    ScanRange {
        start: Some(format_month(start)),
        end: Some(format_month(today)),
    }
}

pub fn format_month(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Parses the timestamp shapes found in backups: RFC 2822 with or without a
/// time (`Wed, 31 Oct 2018 16:00:47 GMT`, `Wed, 31 Dec 2008`), RFC 3339, ISO or
/// slash-separated local datetimes and bare dates.
pub fn parse_posted(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.date_naive());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.date_naive());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.date());
        }
    }
    // a leading weekday is not cross-checked against the date
    let without_weekday = match value.split_once(", ") {
        Some((weekday, rest)) if weekday.len() == 3 && weekday.chars().all(char::is_alphabetic) => {
            rest.trim()
        }
        _ => value,
    };
    NAIVE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(without_weekday, format).ok())
}

/// Newest posting date across every stored post. Values that do not parse
/// are skipped, so mixed formats never hide the true maximum. A store whose
/// posts all carry unreadable dates is an error rather than an empty store.
pub fn latest_imported_date(connection: &Connection) -> Result<Option<NaiveDate>> {
    let mut statement = connection
        .prepare("SELECT posted FROM posts WHERE posted IS NOT NULL")
        .context("failed to prepare latest posted query")?;
    let rows = statement
        .query_map([], |row| row.get::<_, String>(0))
        .context("failed to read posted timestamps")?;

    let mut latest: Option<NaiveDate> = None;
    let mut unparsed = 0usize;
    let mut sample = None;
    for row in rows {
        let posted = row.context("failed to decode posted timestamp")?;
        match parse_posted(&posted) {
            Some(date) => latest = latest.max(Some(date)),
            None => {
                unparsed += 1;
                sample.get_or_insert(posted);
            }
        }
    }
    if latest.is_none()
        && let Some(sample) = sample
    {
        bail!(
            "none of the {unparsed} stored posted values could be parsed (first: '{sample}'), \
             refusing to treat the store as empty"
        );
    }
    if unparsed > 0 {
        log::debug!("skipped {unparsed} unparseable posted values");
    }
    Ok(latest)
}
