//! Schedule-expression parsing and next-run computation.
//!
//! Four forms are accepted, detected in this precedence:
//!
//! 1. numeric seconds (`"300"`)
//! 2. daily fixed time (`"AT 10:00"`, `"AT 10:00:30"`)
//! 3. cron, 5-field or 6-field with leading seconds (`"*/5 * * * *"`)
//! 4. human intervals (`"3 hours 15 minutes"`, `"5m"`, `"1 week"`)
//!
//! Cron and daily fixed times are evaluated in the job's configured zone;
//! spring-forward gaps are skipped and fall-back overlaps resolve to the
//! earliest mapping.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Error, Result};

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub enum Interval {
    /// Plain seconds count.
    Seconds(i64),
    /// Daily at a fixed wall-clock time.
    DailyAt(NaiveTime),
    /// Cron expression (normalized to the 6-field seconds form).
    Cron(Box<Schedule>),
    /// Sum of human-interval components.
    Human(Duration),
}

impl Interval {
    /// Parse a schedule expression into its tagged form.
    ///
    /// Cron is attempted before the human-interval branch: if normalization
    /// and validation succeed the expression is cron, otherwise it falls
    /// through to human parsing.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::invalid_schedule("schedule expression is blank"));
        }

        if spec.bytes().all(|b| b.is_ascii_digit()) {
            let seconds: i64 = spec
                .parse()
                .map_err(|_| Error::invalid_schedule(format!("seconds out of range: {spec}")))?;
            if seconds <= 0 {
                return Err(Error::invalid_schedule(format!(
                    "seconds must be positive: {spec}"
                )));
            }
            return Ok(Interval::Seconds(seconds));
        }

        if let Some(time_of_day) = spec.strip_prefix("AT ") {
            return Ok(Interval::DailyAt(parse_time_of_day(time_of_day)?));
        }

        if let Some(schedule) = parse_cron(spec) {
            return Ok(Interval::Cron(Box::new(schedule)));
        }

        parse_human(spec).map(Interval::Human)
    }

    /// Compute the next run instant strictly after `base`, evaluated in `tz`.
    pub fn next_after(&self, base: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        match self {
            Interval::Seconds(seconds) => base
                .checked_add_signed(Duration::seconds(*seconds))
                .ok_or_else(|| Error::invalid_schedule("next run overflows the time range")),
            Interval::Human(duration) => base
                .checked_add_signed(*duration)
                .ok_or_else(|| Error::invalid_schedule("next run overflows the time range")),
            Interval::DailyAt(time_of_day) => next_daily(*time_of_day, base, tz),
            Interval::Cron(schedule) => schedule
                .after(&base.with_timezone(&tz))
                .next()
                .map(|next| next.with_timezone(&Utc))
                .ok_or_else(|| Error::invalid_schedule("cron expression has no upcoming fire time")),
        }
    }
}

/// Compute the next run instant for an optional schedule expression.
///
/// Returns `None` when the spec is absent or blank. The base instant is
/// `max(previous_next_run_at, finished_at)` (null-safe, `now` when both are
/// absent), so a run that finished late does not replay missed occurrences.
pub fn compute_next_run_at(
    spec: Option<&str>,
    zone: Option<&str>,
    previous_next_run_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    let Some(spec) = spec.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    let base = match (previous_next_run_at, finished_at) {
        (Some(previous), Some(finished)) => previous.max(finished),
        (Some(previous), None) => previous,
        (None, Some(finished)) => finished,
        (None, None) => Utc::now(),
    };

    Interval::parse(spec)?
        .next_after(base, resolve_timezone(zone))
        .map(Some)
}

/// Parse an IANA zone id, falling back to UTC when absent or unparseable.
pub fn resolve_timezone(zone: Option<&str>) -> Tz {
    zone.and_then(|z| z.parse::<Tz>().ok()).unwrap_or(Tz::UTC)
}

/// Parse `HH:mm` or `HH:mm:ss`.
pub(crate) fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| Error::invalid_schedule(format!("invalid time of day: {s}")))
}

/// Earliest instant in `tz` whose wall clock equals `time_of_day`, strictly
/// after `base`. Rolls forward one calendar day when today's time has passed.
fn next_daily(time_of_day: NaiveTime, base: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    let mut date = base.with_timezone(&tz).date_naive();

    // At most a couple of iterations: today, tomorrow, plus skipped DST gaps.
    for _ in 0..4 {
        let candidate = date.and_time(time_of_day);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(local) | LocalResult::Ambiguous(local, _) => {
                let instant = local.with_timezone(&Utc);
                if instant > base {
                    return Ok(instant);
                }
            }
            // DST gap: this wall-clock time does not exist today.
            LocalResult::None => {}
        }
        date = date
            .succ_opt()
            .ok_or_else(|| Error::invalid_schedule("next run overflows the time range"))?;
    }

    Err(Error::invalid_schedule(
        "no valid occurrence within the next days",
    ))
}

/// Normalize and validate a cron expression.
///
/// 5-field specs get a leading `"0"` seconds field. When both day-of-month
/// and day-of-week are `*`, day-of-week becomes `?` to match the extended
/// cron semantics. Returns `None` when the expression is not cron at all,
/// letting the caller fall through to the human-interval branch.
fn parse_cron(spec: &str) -> Option<Schedule> {
    let mut fields: Vec<&str> = spec.split_whitespace().collect();
    match fields.len() {
        5 => fields.insert(0, "0"),
        6 => {}
        _ => return None,
    }
    let normalized = fields.join(" ");

    if fields[3] == "*" && fields[5] == "*" {
        fields[5] = "?";
    }

    Schedule::from_str(&fields.join(" "))
        .or_else(|_| Schedule::from_str(&normalized))
        .ok()
}

/// Seconds per recognized unit, accepting plurals and the compact
/// single-letter forms. A month counts as 30 days.
fn unit_seconds(unit: &str) -> Option<(&'static str, i64)> {
    let singular = unit
        .strip_suffix('s')
        .filter(|stripped| !stripped.is_empty())
        .unwrap_or(unit);

    match singular {
        "s" | "second" => Some(("second", 1)),
        "m" | "minute" => Some(("minute", 60)),
        "h" | "hour" => Some(("hour", 3_600)),
        "d" | "day" => Some(("day", 86_400)),
        "w" | "week" => Some(("week", 604_800)),
        "month" => Some(("month", 30 * 86_400)),
        _ => None,
    }
}

/// Parse a human interval: whitespace-separated `N unit` pairs or compact
/// `Nu` tokens, summed. Duplicate units, non-integer or non-positive counts
/// all fail.
fn parse_human(spec: &str) -> Result<Duration> {
    let mut seen: HashSet<&'static str> = HashSet::new();
    let mut total: i64 = 0;
    let mut tokens = spec.split_whitespace();

    while let Some(token) = tokens.next() {
        let (count, unit) = if token.bytes().all(|b| b.is_ascii_digit()) {
            let unit = tokens.next().ok_or_else(|| {
                Error::invalid_schedule(format!("count without a unit in interval: {spec}"))
            })?;
            (token, unit)
        } else {
            // Compact form: digits immediately followed by a unit letter.
            let split = token.find(|c: char| !c.is_ascii_digit()).unwrap_or(0);
            let (digits, unit) = token.split_at(split);
            if digits.is_empty() || unit.is_empty() {
                return Err(Error::invalid_schedule(format!(
                    "unrecognized interval component: {token}"
                )));
            }
            (digits, unit)
        };

        let count: i64 = count
            .parse()
            .map_err(|_| Error::invalid_schedule(format!("invalid count in interval: {count}")))?;
        let (canonical, seconds) = unit_seconds(unit).ok_or_else(|| {
            Error::invalid_schedule(format!("unrecognized interval unit: {unit}"))
        })?;

        if !seen.insert(canonical) {
            return Err(Error::invalid_schedule(format!(
                "duplicate interval unit: {canonical}"
            )));
        }

        total = count
            .checked_mul(seconds)
            .and_then(|component| total.checked_add(component))
            .ok_or_else(|| Error::invalid_schedule(format!("interval out of range: {spec}")))?;
    }

    if total <= 0 {
        return Err(Error::invalid_schedule(format!(
            "interval must be positive: {spec}"
        )));
    }

    Ok(Duration::seconds(total))
}
