//! Date and time processing
//!
//! Pure translation from human temporal input to concrete instants:
//! - Vague terms ("urgent", "whenever") to date + priority pairs
//! - Natural language ("next monday", "in 2 hours") to instants
//! - Interval expressions ("30 minutes") and cron next-fire times
//!
//! All parsing happens at task-store time; the polling loop only ever
//! compares concrete instants. Parsers return `None` on unrecognised
//! input; `calculate_interval` is the one trusted-path exception that
//! errors on malformed format.

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Result of translating a vague term
#[derive(Debug, Clone, PartialEq)]
pub struct VagueTranslation {
    pub date: DateTime<Utc>,
    pub priority: u8,
}

/// Output format labels for `format_date`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    Iso,
    Short,
    Long,
    Time,
    DateTime,
}

impl FromStr for DateFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "iso" => Ok(DateFormat::Iso),
            "short" => Ok(DateFormat::Short),
            "long" => Ok(DateFormat::Long),
            "time" => Ok(DateFormat::Time),
            "datetime" => Ok(DateFormat::DateTime),
            _ => Err(anyhow::anyhow!("Unknown date format: {}", s)),
        }
    }
}

enum VagueOffset {
    Immediate,
    Hours(i64),
    Days(i64),
    EndOfDay,
    EndOfDayPlus(i64),
    EndOfWeek,
    EndOfMonth,
}

/// Vague-term dictionary. Ordered so that more specific phrases are tried
/// before their substrings ("very soon" before "soon").
const VAGUE_TERMS: &[(&str, VagueOffset, u8)] = &[
    ("immediately", VagueOffset::Immediate, 10),
    ("immediate", VagueOffset::Immediate, 10),
    ("right away", VagueOffset::Immediate, 10),
    ("urgent", VagueOffset::Immediate, 10),
    ("asap", VagueOffset::Hours(2), 9),
    ("very soon", VagueOffset::Hours(2), 9),
    ("shortly", VagueOffset::Hours(4), 8),
    ("soon", VagueOffset::Hours(4), 8),
    ("end of day", VagueOffset::EndOfDay, 7),
    ("by today", VagueOffset::EndOfDay, 7),
    ("today", VagueOffset::EndOfDay, 7),
    ("by tomorrow", VagueOffset::EndOfDayPlus(1), 6),
    ("couple of days", VagueOffset::Days(2), 5),
    ("couple days", VagueOffset::Days(2), 5),
    ("few days", VagueOffset::Days(3), 5),
    ("end of week", VagueOffset::EndOfWeek, 4),
    ("this week", VagueOffset::EndOfWeek, 4),
    ("end of month", VagueOffset::EndOfMonth, 3),
    ("this month", VagueOffset::EndOfMonth, 3),
    ("low priority", VagueOffset::Days(7), 2),
    ("whenever", VagueOffset::Days(30), 1),
];

/// Stateless translator from human descriptions to instants. Carries only
/// the timezone used for day boundaries and cron evaluation; safe to share
/// across threads.
#[derive(Debug, Clone)]
pub struct DateTimeProcessor {
    timezone: Tz,
}

impl Default for DateTimeProcessor {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
        }
    }
}

impl DateTimeProcessor {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    // ------------------------------------------------------------------
    // Vague terms
    // ------------------------------------------------------------------

    /// Map a vague term to a concrete date and priority. Case-insensitive;
    /// exact match wins, then substring containment.
    pub fn translate_vague_term(
        &self,
        expression: &str,
        reference: DateTime<Utc>,
    ) -> Option<VagueTranslation> {
        let normalized = expression.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }

        let entry = VAGUE_TERMS
            .iter()
            .find(|(term, _, _)| normalized == *term)
            .or_else(|| {
                VAGUE_TERMS
                    .iter()
                    .find(|(term, _, _)| normalized.contains(term))
            })?;

        let (_, offset, priority) = entry;
        let date = match offset {
            VagueOffset::Immediate => reference,
            VagueOffset::Hours(h) => reference + Duration::hours(*h),
            VagueOffset::Days(d) => reference + Duration::days(*d),
            VagueOffset::EndOfDay => self.end_of_day(reference),
            VagueOffset::EndOfDayPlus(d) => self.end_of_day(reference) + Duration::days(*d),
            VagueOffset::EndOfWeek => self.end_of_week(reference),
            VagueOffset::EndOfMonth => self.end_of_month(reference),
        };

        Some(VagueTranslation {
            date,
            priority: *priority,
        })
    }

    // ------------------------------------------------------------------
    // Natural language
    // ------------------------------------------------------------------

    /// Parse a natural-language expression relative to `reference`.
    /// Returns `None` on unrecognised input.
    pub fn parse_natural_language(
        &self,
        expression: &str,
        reference: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let normalized = expression.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }

        match normalized.as_str() {
            "now" => return Some(reference),
            "today" => return Some(self.start_of_day(reference)),
            "tomorrow" => return Some(self.start_of_day(reference) + Duration::days(1)),
            "yesterday" => return Some(self.start_of_day(reference) - Duration::days(1)),
            "day after tomorrow" => {
                return Some(self.start_of_day(reference) + Duration::days(2))
            }
            "day before yesterday" => {
                return Some(self.start_of_day(reference) - Duration::days(2))
            }
            "next week" => return Some(reference + Duration::days(7)),
            "next month" => return reference.checked_add_months(Months::new(1)),
            "next year" => return reference.checked_add_months(Months::new(12)),
            "end of day" | "by the end of day" => return Some(self.end_of_day(reference)),
            "end of week" | "by the end of week" => return Some(self.end_of_week(reference)),
            "end of month" | "by the end of month" => return Some(self.end_of_month(reference)),
            "end of year" | "by the end of year" => return Some(self.end_of_year(reference)),
            _ => {}
        }

        // "next week monday": the named weekday in the calendar week after
        // the reference's (weeks start on Monday)
        if let Some(rest) = normalized.strip_prefix("next week ") {
            if let Ok(weekday) = rest.trim().parse::<Weekday>() {
                let local = reference.with_timezone(&self.timezone).date_naive();
                let monday = local - Duration::days(local.weekday().num_days_from_monday() as i64);
                let target =
                    monday + Duration::days(7 + weekday.num_days_from_monday() as i64);
                return Some(self.midnight(target));
            }
        }

        // "next monday": next occurrence strictly after the reference;
        // the same weekday resolves a full week ahead
        if let Some(rest) = normalized.strip_prefix("next ") {
            if let Ok(weekday) = rest.trim().parse::<Weekday>() {
                let local = reference.with_timezone(&self.timezone).date_naive();
                let mut days_ahead = (weekday.num_days_from_monday() as i64
                    - local.weekday().num_days_from_monday() as i64)
                    .rem_euclid(7);
                if days_ahead == 0 {
                    days_ahead = 7;
                }
                return Some(self.midnight(local + Duration::days(days_ahead)));
            }
        }

        if let Some(rest) = normalized.strip_prefix("in ") {
            return self.calculate_interval(reference, rest).ok();
        }
        if let Some(rest) = normalized.strip_suffix(" from now") {
            return self.calculate_interval(reference, rest).ok();
        }

        parse_iso(expression.trim())
    }

    // ------------------------------------------------------------------
    // Intervals
    // ------------------------------------------------------------------

    /// Add an "N unit" interval to `base`. Month and year arithmetic
    /// preserves the day-of-month where possible (Jan 31 + 1 month clamps
    /// to the end of February).
    pub fn calculate_interval(
        &self,
        base: DateTime<Utc>,
        expression: &str,
    ) -> SchedulerResult<DateTime<Utc>> {
        let normalized = expression.trim().to_lowercase();
        let digits_end = normalized
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(normalized.len());
        let amount: i64 = normalized[..digits_end]
            .parse()
            .map_err(|_| SchedulerError::InvalidInterval(expression.to_string()))?;
        let unit = normalized[digits_end..].trim();

        let result = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Some(base + Duration::seconds(amount)),
            "m" | "min" | "mins" | "minute" | "minutes" => Some(base + Duration::minutes(amount)),
            "h" | "hr" | "hrs" | "hour" | "hours" => Some(base + Duration::hours(amount)),
            "d" | "day" | "days" => Some(base + Duration::days(amount)),
            "w" | "wk" | "wks" | "week" | "weeks" => Some(base + Duration::weeks(amount)),
            "mo" | "mos" | "month" | "months" => {
                base.checked_add_months(Months::new(amount as u32))
            }
            "y" | "yr" | "yrs" | "year" | "years" => {
                base.checked_add_months(Months::new(amount as u32 * 12))
            }
            _ => return Err(SchedulerError::InvalidInterval(expression.to_string())),
        };

        result.ok_or_else(|| SchedulerError::InvalidInterval(expression.to_string()))
    }

    // ------------------------------------------------------------------
    // Cron
    // ------------------------------------------------------------------

    /// Map a recurrence phrase to a standard 5-field cron expression.
    /// Unknown input falls back to daily at midnight ("0 0 * * *").
    pub fn generate_cron_expression(&self, expression: &str) -> String {
        let normalized = expression.trim().to_lowercase();
        let cron = match normalized.as_str() {
            "every minute" => "* * * * *",
            "every hour" | "hourly" => "0 * * * *",
            "every hour during work hours" => "0 9-17 * * 1-5",
            "every day" | "daily" => "0 0 * * *",
            "every week" | "weekly" => "0 0 * * 0",
            "every month" | "monthly" => "0 0 1 * *",
            "every year" | "yearly" | "annually" => "0 0 1 1 *",
            "weekdays" | "every weekday" => "0 0 * * 1-5",
            "weekends" | "every weekend" => "0 0 * * 0,6",
            "every morning" => "0 9 * * *",
            "every evening" => "0 18 * * *",
            "twice daily" | "twice a day" => "0 9,18 * * *",
            other => {
                debug!("unrecognised cron phrase '{}', defaulting to daily", other);
                "0 0 * * *"
            }
        };
        cron.to_string()
    }

    /// Next fire time strictly after `reference` for a cron expression.
    /// Accepts standard 5-field expressions (a seconds field is prepended
    /// for the cron crate) as well as native 6/7-field ones.
    pub fn next_execution_from_cron(
        &self,
        cron_expr: &str,
        reference: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let trimmed = cron_expr.trim();
        let with_seconds = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };

        let schedule = Schedule::from_str(&with_seconds).ok()?;
        let local = reference.with_timezone(&self.timezone);
        schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    // ------------------------------------------------------------------
    // Utilities
    // ------------------------------------------------------------------

    pub fn is_same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        a.with_timezone(&self.timezone).date_naive() == b.with_timezone(&self.timezone).date_naive()
    }

    pub fn format_date(&self, date: DateTime<Utc>, format: DateFormat) -> String {
        let local = date.with_timezone(&self.timezone);
        match format {
            DateFormat::Iso => date.to_rfc3339(),
            DateFormat::Short => local.format("%Y-%m-%d").to_string(),
            DateFormat::Long => local.format("%B %-d, %Y").to_string(),
            DateFormat::Time => local.format("%H:%M:%S").to_string(),
            DateFormat::DateTime => local.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Describe the gap between two instants: "now", "N minute(s)",
    /// "N hour(s) and M minute(s)", or "N day(s)", with " ago" appended
    /// when `end` precedes `start`.
    pub fn human_readable_interval(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let delta = end - start;
        let past = delta < Duration::zero();
        let delta = delta.abs();

        if delta.num_seconds() < 60 {
            return "now".to_string();
        }

        let label = if delta.num_days() >= 1 {
            plural(delta.num_days(), "day")
        } else if delta.num_hours() >= 1 {
            let minutes = delta.num_minutes() % 60;
            if minutes > 0 {
                format!("{} and {}", plural(delta.num_hours(), "hour"), plural(minutes, "minute"))
            } else {
                plural(delta.num_hours(), "hour")
            }
        } else {
            plural(delta.num_minutes(), "minute")
        };

        if past {
            format!("{label} ago")
        } else {
            label
        }
    }

    // ------------------------------------------------------------------
    // Day boundary helpers (computed in the processor's timezone)
    // ------------------------------------------------------------------

    fn start_of_day(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        self.midnight(reference.with_timezone(&self.timezone).date_naive())
    }

    fn end_of_day(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        self.at_time(
            reference.with_timezone(&self.timezone).date_naive(),
            end_of_day_time(),
        )
    }

    /// The coming Sunday at 23:59:59.999 (the reference day itself when it
    /// already is a Sunday)
    fn end_of_week(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let local = reference.with_timezone(&self.timezone).date_naive();
        let days_ahead = 6 - local.weekday().num_days_from_monday() as i64;
        self.at_time(local + Duration::days(days_ahead), end_of_day_time())
    }

    fn end_of_month(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let local = reference.with_timezone(&self.timezone).date_naive();
        let first_of_next = if local.month() == 12 {
            NaiveDate::from_ymd_opt(local.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(local.year(), local.month() + 1, 1)
        };
        let last_day = first_of_next
            .map(|d| d - Duration::days(1))
            .unwrap_or(local);
        self.at_time(last_day, end_of_day_time())
    }

    fn end_of_year(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let local = reference.with_timezone(&self.timezone).date_naive();
        let dec31 = NaiveDate::from_ymd_opt(local.year(), 12, 31).unwrap_or(local);
        self.at_time(dec31, end_of_day_time())
    }

    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at_time(date, NaiveTime::MIN)
    }

    fn at_time(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        match self.timezone.from_local_datetime(&date.and_time(time)) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            // DST gap: shift forward an hour and retry
            chrono::LocalResult::None => self
                .timezone
                .from_local_datetime(&(date.and_time(time) + Duration::hours(1)))
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| date.and_time(time).and_utc()),
        }
    }
}

fn end_of_day_time() -> NaiveTime {
    NaiveTime::from_hms_milli_opt(23, 59, 59, 999).expect("valid end-of-day time")
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// ISO / common-format fallback parse; naive datetimes are taken as UTC
fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN).and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> DateTimeProcessor {
        DateTimeProcessor::default()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    // ------------------------------------------------------------------
    // Vague terms
    // ------------------------------------------------------------------

    #[test]
    fn test_urgent_is_reference_with_priority_10() {
        let reference = at(2023, 1, 15, 12, 0, 0);
        let translated = processor()
            .translate_vague_term("urgent", reference)
            .unwrap();
        assert_eq!(translated.date, reference);
        assert_eq!(translated.priority, 10);
    }

    #[test]
    fn test_vague_dictionary_offsets() {
        let p = processor();
        let reference = at(2023, 1, 15, 12, 0, 0); // a Sunday

        let asap = p.translate_vague_term("asap", reference).unwrap();
        assert_eq!(asap.date, reference + Duration::hours(2));
        assert_eq!(asap.priority, 9);

        let soon = p.translate_vague_term("soon", reference).unwrap();
        assert_eq!(soon.date, reference + Duration::hours(4));
        assert_eq!(soon.priority, 8);

        let today = p.translate_vague_term("by today", reference).unwrap();
        assert_eq!(today.date, at(2023, 1, 15, 23, 59, 59) + Duration::milliseconds(999));
        assert_eq!(today.priority, 7);

        let tomorrow = p.translate_vague_term("by tomorrow", reference).unwrap();
        assert_eq!(tomorrow.date.date_naive(), at(2023, 1, 16, 0, 0, 0).date_naive());
        assert_eq!(tomorrow.priority, 6);

        let whenever = p.translate_vague_term("whenever", reference).unwrap();
        assert_eq!(whenever.date, reference + Duration::days(30));
        assert_eq!(whenever.priority, 1);
    }

    #[test]
    fn test_vague_term_substring_containment() {
        let p = processor();
        let reference = at(2023, 1, 15, 12, 0, 0);

        let t = p
            .translate_vague_term("please do this very soon!", reference)
            .unwrap();
        // "very soon" must win over its substring "soon"
        assert_eq!(t.priority, 9);

        let t = p
            .translate_vague_term("LOW PRIORITY cleanup", reference)
            .unwrap();
        assert_eq!(t.priority, 2);
        assert_eq!(t.date, reference + Duration::days(7));
    }

    #[test]
    fn test_vague_end_of_week_is_sunday() {
        let p = processor();
        // Wednesday 2023-01-11
        let t = p
            .translate_vague_term("this week", at(2023, 1, 11, 9, 0, 0))
            .unwrap();
        assert_eq!(t.date.date_naive(), at(2023, 1, 15, 0, 0, 0).date_naive());
        assert_eq!(t.priority, 4);
    }

    #[test]
    fn test_vague_end_of_month() {
        let p = processor();
        let t = p
            .translate_vague_term("end of month", at(2023, 2, 10, 9, 0, 0))
            .unwrap();
        assert_eq!(t.date.date_naive(), at(2023, 2, 28, 0, 0, 0).date_naive());
    }

    #[test]
    fn test_unknown_vague_term_is_none() {
        assert!(processor()
            .translate_vague_term("quxish", at(2023, 1, 15, 12, 0, 0))
            .is_none());
    }

    // ------------------------------------------------------------------
    // Natural language
    // ------------------------------------------------------------------

    #[test]
    fn test_next_weekday_after_sunday() {
        // 2023-01-15 is a Sunday; next monday is the 16th at midnight
        let parsed = processor()
            .parse_natural_language("next monday", at(2023, 1, 15, 12, 0, 0))
            .unwrap();
        assert_eq!(parsed, at(2023, 1, 16, 0, 0, 0));
    }

    #[test]
    fn test_next_same_weekday_is_a_week_ahead() {
        // Reference is a Sunday; "next sunday" must not resolve to today
        let parsed = processor()
            .parse_natural_language("next sunday", at(2023, 1, 15, 12, 0, 0))
            .unwrap();
        assert_eq!(parsed, at(2023, 1, 22, 0, 0, 0));
    }

    #[test]
    fn test_next_week_weekday_lands_in_following_calendar_week() {
        // Wednesday 2023-01-11; next week's Monday is the 16th
        let parsed = processor()
            .parse_natural_language("next week monday", at(2023, 1, 11, 12, 0, 0))
            .unwrap();
        assert_eq!(parsed, at(2023, 1, 16, 0, 0, 0));

        // From Sunday the 15th (same calendar week), still the 16th
        let parsed = processor()
            .parse_natural_language("next week monday", at(2023, 1, 15, 12, 0, 0))
            .unwrap();
        assert_eq!(parsed, at(2023, 1, 16, 0, 0, 0));
    }

    #[test]
    fn test_relative_day_phrases() {
        let p = processor();
        let reference = at(2023, 1, 15, 12, 30, 0);

        assert_eq!(p.parse_natural_language("now", reference), Some(reference));
        assert_eq!(
            p.parse_natural_language("tomorrow", reference),
            Some(at(2023, 1, 16, 0, 0, 0))
        );
        assert_eq!(
            p.parse_natural_language("day after tomorrow", reference),
            Some(at(2023, 1, 17, 0, 0, 0))
        );
        assert_eq!(
            p.parse_natural_language("yesterday", reference),
            Some(at(2023, 1, 14, 0, 0, 0))
        );
    }

    #[test]
    fn test_in_n_units_and_from_now() {
        let p = processor();
        let reference = at(2023, 1, 15, 12, 0, 0);

        assert_eq!(
            p.parse_natural_language("in 2 hours", reference),
            Some(reference + Duration::hours(2))
        );
        assert_eq!(
            p.parse_natural_language("3 days from now", reference),
            Some(reference + Duration::days(3))
        );
    }

    #[test]
    fn test_end_of_phrases() {
        let p = processor();
        let reference = at(2023, 1, 11, 9, 0, 0);

        let eod = p.parse_natural_language("by the end of day", reference).unwrap();
        assert_eq!(eod.date_naive(), reference.date_naive());

        let eoy = p.parse_natural_language("end of year", reference).unwrap();
        assert_eq!(eoy.date_naive(), at(2023, 12, 31, 0, 0, 0).date_naive());
    }

    #[test]
    fn test_iso_fallback() {
        let p = processor();
        let reference = at(2023, 1, 15, 12, 0, 0);

        assert_eq!(
            p.parse_natural_language("2023-06-01T08:30:00Z", reference),
            Some(at(2023, 6, 1, 8, 30, 0))
        );
        assert_eq!(
            p.parse_natural_language("2023-06-01", reference),
            Some(at(2023, 6, 1, 0, 0, 0))
        );
        assert_eq!(p.parse_natural_language("gibberish", reference), None);
    }

    // ------------------------------------------------------------------
    // Intervals
    // ------------------------------------------------------------------

    #[test]
    fn test_calculate_interval_units() {
        let p = processor();
        let base = at(2023, 1, 15, 0, 0, 0);

        assert_eq!(
            p.calculate_interval(base, "3 days").unwrap(),
            at(2023, 1, 18, 0, 0, 0)
        );
        assert_eq!(
            p.calculate_interval(base, "90m").unwrap(),
            base + Duration::minutes(90)
        );
        assert_eq!(
            p.calculate_interval(base, "2 wk").unwrap(),
            base + Duration::weeks(2)
        );
        assert_eq!(
            p.calculate_interval(base, "1 year").unwrap(),
            at(2024, 1, 15, 0, 0, 0)
        );
    }

    #[test]
    fn test_calculate_interval_month_clamps_day() {
        let p = processor();
        let jan31 = at(2023, 1, 31, 10, 0, 0);
        assert_eq!(
            p.calculate_interval(jan31, "1 month").unwrap(),
            at(2023, 2, 28, 10, 0, 0)
        );
        // Day-of-month preserved when possible
        let jan15 = at(2023, 1, 15, 10, 0, 0);
        assert_eq!(
            p.calculate_interval(jan15, "1 month").unwrap(),
            at(2023, 2, 15, 10, 0, 0)
        );
    }

    #[test]
    fn test_calculate_interval_rejects_malformed() {
        let p = processor();
        let base = at(2023, 1, 15, 0, 0, 0);
        assert!(matches!(
            p.calculate_interval(base, "soonish"),
            Err(SchedulerError::InvalidInterval(_))
        ));
        assert!(p.calculate_interval(base, "5 fortnights").is_err());
        assert!(p.calculate_interval(base, "").is_err());
    }

    // ------------------------------------------------------------------
    // Cron
    // ------------------------------------------------------------------

    #[test]
    fn test_generate_cron_expression_mappings() {
        let p = processor();
        assert_eq!(p.generate_cron_expression("every minute"), "* * * * *");
        assert_eq!(p.generate_cron_expression("every hour"), "0 * * * *");
        assert_eq!(p.generate_cron_expression("every morning"), "0 9 * * *");
        assert_eq!(p.generate_cron_expression("every evening"), "0 18 * * *");
        assert_eq!(p.generate_cron_expression("twice daily"), "0 9,18 * * *");
        assert_eq!(p.generate_cron_expression("weekdays"), "0 0 * * 1-5");
        assert_eq!(
            p.generate_cron_expression("every hour during work hours"),
            "0 9-17 * * 1-5"
        );
        // Documented fallback
        assert_eq!(p.generate_cron_expression("whenever it rains"), "0 0 * * *");
    }

    #[test]
    fn test_next_execution_from_cron_is_strictly_after() {
        let p = processor();
        let reference = at(2023, 1, 15, 9, 0, 0);

        // Daily at 09:00; the reference itself must not be returned
        let next = p.next_execution_from_cron("0 9 * * *", reference).unwrap();
        assert_eq!(next, at(2023, 1, 16, 9, 0, 0));

        let next = p
            .next_execution_from_cron("0 9 * * *", at(2023, 1, 15, 8, 59, 0))
            .unwrap();
        assert_eq!(next, at(2023, 1, 15, 9, 0, 0));
    }

    #[test]
    fn test_next_execution_invalid_cron_is_none() {
        assert!(processor()
            .next_execution_from_cron("not cron", at(2023, 1, 15, 9, 0, 0))
            .is_none());
    }

    // ------------------------------------------------------------------
    // Utilities
    // ------------------------------------------------------------------

    #[test]
    fn test_format_iso_roundtrip() {
        let p = processor();
        let date = at(2023, 6, 1, 8, 30, 0) + Duration::milliseconds(123);
        let formatted = p.format_date(date, DateFormat::Iso);
        let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(&formatted)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parsed, date);
    }

    #[test]
    fn test_format_labels() {
        let p = processor();
        let date = at(2023, 6, 1, 8, 30, 5);
        assert_eq!(p.format_date(date, DateFormat::Short), "2023-06-01");
        assert_eq!(p.format_date(date, DateFormat::Long), "June 1, 2023");
        assert_eq!(p.format_date(date, DateFormat::Time), "08:30:05");
        assert_eq!(
            p.format_date(date, DateFormat::DateTime),
            "2023-06-01 08:30:05"
        );
    }

    #[test]
    fn test_is_same_day() {
        let p = processor();
        assert!(p.is_same_day(at(2023, 6, 1, 0, 0, 1), at(2023, 6, 1, 23, 59, 59)));
        assert!(!p.is_same_day(at(2023, 6, 1, 23, 59, 59), at(2023, 6, 2, 0, 0, 0)));
    }

    #[test]
    fn test_human_readable_interval() {
        let p = processor();
        let start = at(2023, 6, 1, 8, 0, 0);

        assert_eq!(p.human_readable_interval(start, start), "now");
        assert_eq!(
            p.human_readable_interval(start, start + Duration::minutes(5)),
            "5 minutes"
        );
        assert_eq!(
            p.human_readable_interval(start, start + Duration::minutes(90)),
            "1 hour and 30 minutes"
        );
        assert_eq!(
            p.human_readable_interval(start, start + Duration::days(3)),
            "3 days"
        );
        assert_eq!(
            p.human_readable_interval(start + Duration::hours(2), start),
            "2 hours ago"
        );
    }
}
