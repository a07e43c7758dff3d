use crate::error::{AppError, Result};
use crate::models::appointment::DEFAULT_DURATION_MINUTES;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::ops::RangeInclusive;
use chrono_tz::Tz;

const LOCAL_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Years the stored RFC 3339 form can be read back with.
const STORABLE_YEARS: RangeInclusive<i32> = 1..=9999;

pub fn default_duration() -> Duration {
    Duration::minutes(DEFAULT_DURATION_MINUTES)
}

/// Reads a client timestamp. Values without an offset are wall-clock time in
/// `tz`; a bare date means local midnight. Returns `None` for anything else,
/// including local times skipped by a DST transition.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let naive = LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Start/end normalization for new appointments: a missing or unreadable
/// start becomes `now`, a missing or unreadable end becomes start + 1h. A
/// readable end earlier than the start is rejected.
pub fn normalize_range(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = start.and_then(|s| parse_timestamp(s, tz)).unwrap_or(now);
    let end = match end.and_then(|e| parse_timestamp(e, tz)) {
        Some(end) => end,
        None => start + default_duration(),
    };

    ensure_ordered(start, end)?;
    Ok((start, end))
}

/// Re-normalization on update. A new start without a new end keeps the
/// previous duration.
pub fn renormalize_range(
    current: (DateTime<Utc>, DateTime<Utc>),
    start: Option<&str>,
    end: Option<&str>,
    tz: Tz,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (old_start, old_end) = current;
    let previous = if old_end >= old_start {
        old_end - old_start
    } else {
        default_duration()
    };

    let new_start = start.and_then(|s| parse_timestamp(s, tz));
    let new_end = end.and_then(|e| parse_timestamp(e, tz));

    let (start, end) = match (new_start, new_end) {
        (Some(s), Some(e)) => (s, e),
        (Some(s), None) => (s, s + previous),
        (None, Some(e)) => (old_start, e),
        (None, None) => (old_start, old_end),
    };

    ensure_ordered(start, end)?;
    Ok((start, end))
}

fn ensure_ordered(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if !STORABLE_YEARS.contains(&start.year()) || !STORABLE_YEARS.contains(&end.year()) {
        return Err(AppError::Validation(
            "Data fora do intervalo permitido (anos 1 a 9999)".to_string(),
        ));
    }
    if end < start {
        return Err(AppError::Validation(
            "A data de término não pode ser anterior à data de início".to_string(),
        ));
    }
    Ok(())
}

pub fn same_local_day(a: DateTime<Utc>, b: DateTime<Utc>, tz: Tz) -> bool {
    a.with_timezone(&tz).date_naive() == b.with_timezone(&tz).date_naive()
}
