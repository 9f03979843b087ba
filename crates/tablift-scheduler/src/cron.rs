//! Cron expression evaluator.
//! Supports 5-field ("MIN HOUR DOM MON DOW") and 6-field (leading SEC)
//! syntax with wildcards (*), steps (*/N, A-B/N), ranges (A-B) and lists.
//! Day-of-week accepts 0-7, with both 0 and 7 meaning Sunday.
//!
//! Parse failure ([`ScheduleError`]) is distinct from "well-formed but never
//! fires" (e.g. `0 0 30 2 *`): the latter makes [`Schedule::next_after`]
//! return `None`.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// How far `next_after` searches before declaring the expression exhausted.
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// Invalid cron expression.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid cron expression '{expr}': {reason}")]
pub struct ScheduleError {
    pub expr: String,
    pub reason: String,
}

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>, // 0 = Sunday .. 6 = Saturday
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Schedule {
    /// Parse a cron expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let err = |reason: &str| ScheduleError {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = expr.split_whitespace().collect();
        let (sec_spec, rest) = match parts.len() {
            5 => (None, &parts[..]),
            6 => (Some(parts[0]), &parts[1..]),
            n => return Err(err(&format!("expected 5 or 6 fields, got {n}"))),
        };

        let seconds = match sec_spec {
            Some(spec) => parse_field(spec, 0, 59).map_err(|r| err(&format!("seconds: {r}")))?.0,
            None => vec![0],
        };
        let (minutes, _) = parse_field(rest[0], 0, 59).map_err(|r| err(&format!("minute: {r}")))?;
        let (hours, _) = parse_field(rest[1], 0, 23).map_err(|r| err(&format!("hour: {r}")))?;
        let (days_of_month, dom_restricted) =
            parse_field(rest[2], 1, 31).map_err(|r| err(&format!("day-of-month: {r}")))?;
        let (months, _) = parse_field(rest[3], 1, 12).map_err(|r| err(&format!("month: {r}")))?;
        let (raw_dow, dow_restricted) =
            parse_field(rest[4], 0, 7).map_err(|r| err(&format!("day-of-week: {r}")))?;

        // Fold 7 into 0 (both mean Sunday).
        let mut days_of_week: Vec<u32> = raw_dow.into_iter().map(|d| d % 7).collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    /// The next fire instant strictly after `from`, or `None` when the
    /// expression never fires within the search horizon.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (from + Duration::seconds(1)).with_nanosecond(0)?;
        let mut date = start.date_naive();
        let mut tod = Some((start.hour(), start.minute(), start.second()));

        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.months.contains(&date.month()) && self.day_matches(date) {
                let floor = tod.unwrap_or((0, 0, 0));
                if let Some((h, m, s)) = self.first_time_at_or_after(floor) {
                    let naive = date.and_hms_opt(h, m, s)?;
                    return Utc.from_local_datetime(&naive).single();
                }
            }
            date = date.succ_opt()?;
            tod = None;
        }
        None
    }

    /// Vixie-cron day matching: when both day fields are restricted, a day
    /// matches if either matches.
    fn day_matches(&self, date: chrono::NaiveDate) -> bool {
        let dom_ok = self.days_of_month.contains(&date.day());
        let dow_ok = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Smallest (hour, minute, second) in the schedule at or after `floor`,
    /// within a single day.
    fn first_time_at_or_after(&self, floor: (u32, u32, u32)) -> Option<(u32, u32, u32)> {
        let (fh, fm, fs) = floor;
        for &h in &self.hours {
            if h < fh {
                continue;
            }
            for &m in &self.minutes {
                if h == fh && m < fm {
                    continue;
                }
                for &s in &self.seconds {
                    if h == fh && m == fm && s < fs {
                        continue;
                    }
                    return Some((h, m, s));
                }
            }
        }
        None
    }
}

/// Parse one cron field into a sorted value list plus a "restricted" flag
/// (false only for a bare `*`).
fn parse_field(field: &str, min: u32, max: u32) -> Result<(Vec<u32>, bool), String> {
    if field == "*" {
        return Ok(((min..=max).collect(), false));
    }

    let mut values = Vec::new();
    for item in field.split(',') {
        let (range_part, step) = match item.split_once('/') {
            Some((r, s)) => {
                let n: u32 = s.parse().map_err(|_| format!("bad step '{s}'"))?;
                if n == 0 {
                    return Err("step must be nonzero".into());
                }
                (r, n)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo: u32 = a.parse().map_err(|_| format!("bad value '{a}'"))?;
            let hi: u32 = b.parse().map_err(|_| format!("bad value '{b}'"))?;
            if lo > hi {
                return Err(format!("inverted range '{range_part}'"));
            }
            (lo, hi)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| format!("bad value '{range_part}'"))?;
            // "N/step" means N through the field maximum.
            if step > 1 { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(format!("value out of range {min}-{max}: '{item}'"));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }

    if values.is_empty() {
        return Err("empty field".into());
    }
    values.sort_unstable();
    values.dedup();
    Ok((values, true))
}
