//! Scheduling Resolver
//!
//! Converts a member's local wall-clock match time into an absolute instant.
//! The zone comes from the member's explicit timezone, or else from the
//! default zone of their country.

use chrono::{DateTime, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::models::Member;
use crate::service::country_zones::default_zone_for_country;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("No timezone configured: set a timezone or a country first")]
    NoTimezoneConfigured,

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Invalid date or time: {0}")]
    InvalidDateTime(String),

    #[error("Requested time {0} is not in the future")]
    PastInstantRejected(DateTime<Utc>),
}

/// Wall-clock time as typed by a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

/// Zone to interpret a member's wall-clock input in.
pub fn resolve_timezone(timezone: Option<&str>, country_code: Option<&str>) -> Result<Tz, ScheduleError> {
    if let Some(name) = timezone.map(str::trim).filter(|s| !s.is_empty()) {
        return name
            .parse::<Tz>()
            .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()));
    }

    let code = country_code
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ScheduleError::NoTimezoneConfigured)?;
    let zone = default_zone_for_country(code).ok_or(ScheduleError::NoTimezoneConfigured)?;
    zone.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(zone.to_string()))
}

/// Resolves `at` in `tz` to UTC, rejecting anything at or before `now`.
///
/// A wall-clock time repeated by a DST fall-back resolves to its earlier
/// occurrence; one skipped by a spring-forward is invalid.
pub fn resolve_instant(tz: Tz, at: WallClock, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let naive = NaiveDate::from_ymd_opt(at.year, at.month, at.day)
        .and_then(|d| d.and_hms_opt(at.hour, at.minute, 0))
        .ok_or_else(|| {
            ScheduleError::InvalidDateTime(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}",
                at.year, at.month, at.day, at.hour, at.minute
            ))
        })?;

    let local = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            return Err(ScheduleError::InvalidDateTime(format!(
                "{} does not exist in {}",
                naive, tz
            )))
        }
    };

    let instant = local.with_timezone(&Utc);
    if instant <= now {
        return Err(ScheduleError::PastInstantRejected(instant));
    }
    Ok(instant)
}

/// Both steps for a member.
pub fn resolve_for_member(member: &Member, at: WallClock, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let tz = resolve_timezone(member.timezone.as_deref(), member.country_code.as_deref())?;
    resolve_instant(tz, at, now)
}
