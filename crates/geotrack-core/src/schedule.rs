//! # Schedule Windows
//!
//! Parsing and evaluation of tracking schedules.
//!
//! ## Grammar
//! ```text
//! Recurring:  "<days> <HH:MM>-<HH:MM> [location|geofence]"
//!             days: 1..7 (1 = Sunday), lists "1,3,5", ranges "2-6"
//!             "2-6 09:00-17:00"            weekdays, office hours
//!             "1,7 22:00-06:00 geofence"   weekend nights, wraps midnight
//!
//! Literal:    "<YYYY-MM-DD>-<HH:MM> <YYYY-MM-DD>-<HH:MM> [mode]"
//!             "2024-03-01-08:00 2024-03-03-20:00"
//! ```
//!
//! Evaluation works on local wall-clock time (`NaiveDateTime`); the
//! engine supplies `now` and arms a timer for the returned boundary.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::TrackingMode;

/// Recurring windows are searched this many days ahead.
pub const SEARCH_HORIZON_DAYS: i64 = 7;

const LITERAL_FORMAT: &str = "%Y-%m-%d-%H:%M";
const TIME_FORMAT: &str = "%H:%M";

// =============================================================================
// Window
// =============================================================================

/// When a window applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScheduleSpan {
    /// `days[0]` is Sunday.
    Recurring {
        days: [bool; 7],
        start: NaiveTime,
        end: NaiveTime,
    },
    Literal {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

/// One parsed schedule entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub source: String,
    pub span: ScheduleSpan,
    pub mode: TrackingMode,
    /// Set once a literal window has ended; it is skipped afterwards.
    pub triggered: bool,
}

impl ScheduleWindow {
    /// Parses one schedule string.
    pub fn parse(entry: &str) -> CoreResult<Self> {
        let tokens: Vec<&str> = entry.split_whitespace().collect();
        if tokens.len() < 2 || tokens.len() > 3 {
            return Err(CoreError::invalid_schedule(
                entry,
                "expected '<days> <start>-<end> [mode]' or '<start> <end> [mode]'",
            ));
        }

        let mode = match tokens.get(2) {
            None => TrackingMode::Location,
            Some(raw) => parse_mode(entry, raw)?,
        };

        let span = if looks_literal(tokens[0]) {
            let start = parse_literal(entry, tokens[0])?;
            let end = parse_literal(entry, tokens[1])?;
            if end <= start {
                return Err(CoreError::invalid_schedule(entry, "end must be after start"));
            }
            ScheduleSpan::Literal { start, end }
        } else {
            let days = parse_days(entry, tokens[0])?;
            let (start, end) = parse_time_range(entry, tokens[1])?;
            ScheduleSpan::Recurring { days, start, end }
        };

        Ok(ScheduleWindow {
            source: entry.to_string(),
            span,
            mode,
            triggered: false,
        })
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.span, ScheduleSpan::Literal { .. })
    }

    /// Occurrences whose end is after `now`, sorted by start, within the
    /// search horizon.
    fn occurrences(&self, now: NaiveDateTime) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        if self.triggered {
            return Vec::new();
        }
        match &self.span {
            ScheduleSpan::Literal { start, end } => {
                if *end > now {
                    vec![(*start, *end)]
                } else {
                    Vec::new()
                }
            }
            ScheduleSpan::Recurring { days, start, end } => {
                let today = now.date();
                // Start one day back so a window that wrapped past
                // midnight is still seen as active.
                (-1..=SEARCH_HORIZON_DAYS)
                    .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
                    .filter(|date| days[date.weekday().num_days_from_sunday() as usize])
                    .map(|date| occurrence_on(date, *start, *end))
                    .filter(|(_, occ_end)| *occ_end > now)
                    .collect()
            }
        }
    }
}

fn occurrence_on(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> (NaiveDateTime, NaiveDateTime) {
    let occ_start = date.and_time(start);
    let occ_end = if end > start {
        date.and_time(end)
    } else {
        date.and_time(end) + Duration::days(1)
    };
    (occ_start, occ_end)
}

// =============================================================================
// Schedule
// =============================================================================

/// The window currently in force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindow {
    pub index: usize,
    pub mode: TrackingMode,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Result of [`Schedule::evaluate_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEvaluation {
    pub active: Option<ActiveWindow>,
    /// When to evaluate again. None when nothing is left to schedule.
    pub next_boundary: Option<NaiveDateTime>,
}

/// Ordered set of schedule windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    windows: Vec<ScheduleWindow>,
}

impl Schedule {
    /// Parses every entry; fails on the first invalid one.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> CoreResult<Self> {
        let windows = entries
            .iter()
            .map(|entry| ScheduleWindow::parse(entry.as_ref()))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Schedule { windows })
    }

    pub fn windows(&self) -> &[ScheduleWindow] {
        &self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Computes the active window (if any) and the next boundary.
    ///
    /// Literal windows that have ended are marked `triggered`. When
    /// several windows contain `now`, the one ending first wins.
    pub fn evaluate_at(&mut self, now: NaiveDateTime) -> ScheduleEvaluation {
        for window in &mut self.windows {
            if let ScheduleSpan::Literal { end, .. } = window.span {
                if !window.triggered && end <= now {
                    window.triggered = true;
                }
            }
        }

        let mut active: Option<ActiveWindow> = None;
        let mut next_start: Option<NaiveDateTime> = None;

        for (index, window) in self.windows.iter().enumerate() {
            for (start, end) in window.occurrences(now) {
                if start <= now {
                    let better = active.as_ref().map_or(true, |current| end < current.end);
                    if better {
                        active = Some(ActiveWindow {
                            index,
                            mode: window.mode,
                            start,
                            end,
                        });
                    }
                } else {
                    next_start = Some(next_start.map_or(start, |n| n.min(start)));
                }
            }
        }

        let next_boundary = match (&active, next_start) {
            (Some(a), Some(s)) => Some(a.end.min(s)),
            (Some(a), None) => Some(a.end),
            (None, s) => s,
        };

        ScheduleEvaluation {
            active,
            next_boundary,
        }
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn looks_literal(token: &str) -> bool {
    token.len() == 16 && token.as_bytes()[4] == b'-' && token.contains(':')
}

fn parse_literal(entry: &str, token: &str) -> CoreResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(token, LITERAL_FORMAT)
        .map_err(|e| CoreError::invalid_schedule(entry, format!("bad date '{token}': {e}")))
}

fn parse_mode(entry: &str, raw: &str) -> CoreResult<TrackingMode> {
    match raw.to_ascii_lowercase().as_str() {
        "location" => Ok(TrackingMode::Location),
        "geofence" => Ok(TrackingMode::Geofence),
        other => Err(CoreError::invalid_schedule(
            entry,
            format!("unknown mode '{other}'"),
        )),
    }
}

fn parse_day(entry: &str, raw: &str) -> CoreResult<usize> {
    let day: usize = raw
        .trim()
        .parse()
        .map_err(|_| CoreError::invalid_schedule(entry, format!("bad day '{raw}'")))?;
    if !(1..=7).contains(&day) {
        return Err(CoreError::invalid_schedule(
            entry,
            format!("day {day} outside 1..7"),
        ));
    }
    Ok(day - 1)
}

fn parse_days(entry: &str, token: &str) -> CoreResult<[bool; 7]> {
    let mut days = [false; 7];
    for part in token.split(',') {
        match part.split_once('-') {
            Some((from, to)) => {
                let from = parse_day(entry, from)?;
                let to = parse_day(entry, to)?;
                // "6-2" wraps over the weekend.
                let mut day = from;
                loop {
                    days[day] = true;
                    if day == to {
                        break;
                    }
                    day = (day + 1) % 7;
                }
            }
            None => days[parse_day(entry, part)?] = true,
        }
    }
    Ok(days)
}

fn parse_time_range(entry: &str, token: &str) -> CoreResult<(NaiveTime, NaiveTime)> {
    let (start, end) = token
        .split_once('-')
        .ok_or_else(|| CoreError::invalid_schedule(entry, "expected <HH:MM>-<HH:MM>"))?;
    let start = NaiveTime::parse_from_str(start, TIME_FORMAT)
        .map_err(|e| CoreError::invalid_schedule(entry, format!("bad start '{start}': {e}")))?;
    let end = NaiveTime::parse_from_str(end, TIME_FORMAT)
        .map_err(|e| CoreError::invalid_schedule(entry, format!("bad end '{end}': {e}")))?;
    if start == end {
        return Err(CoreError::invalid_schedule(entry, "start and end are equal"));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // 2024-01-01 is a Monday (day 2).
    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .expect("valid test date")
    }

    #[test]
    fn test_parse_recurring() {
        let window = ScheduleWindow::parse("2-6 09:00-17:00 geofence").expect("parse");
        match window.span {
            ScheduleSpan::Recurring { days, .. } => {
                assert_eq!(days, [false, true, true, true, true, true, false]);
            }
            other => panic!("unexpected span {other:?}"),
        }
        assert_eq!(window.mode, TrackingMode::Geofence);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for entry in ["", "0-8 09:00-17:00", "1-5 9am-5pm", "1 09:00-09:00", "1 09:00-10:00 walk"] {
            assert!(ScheduleWindow::parse(entry).is_err(), "{entry:?} should fail");
        }
        assert!(ScheduleWindow::parse("2024-01-02-08:00 2024-01-01-08:00").is_err());
    }

    #[test]
    fn test_office_hours() {
        let mut schedule = Schedule::parse(&["2-6 09:00-17:00"]).expect("parse");

        let inside = schedule.evaluate_at(at(1, 10, 0));
        let active = inside.active.expect("active on Monday morning");
        assert_eq!(active.end, at(1, 17, 0));
        assert_eq!(inside.next_boundary, Some(at(1, 17, 0)));

        let evening = schedule.evaluate_at(at(1, 18, 0));
        assert!(evening.active.is_none());
        assert_eq!(evening.next_boundary, Some(at(2, 9, 0)));
    }

    #[test]
    fn test_window_wraps_past_midnight() {
        let mut schedule = Schedule::parse(&["2 22:00-06:00"]).expect("parse");
        let after_midnight = schedule.evaluate_at(at(2, 3, 0));
        assert_eq!(
            after_midnight.active.map(|a| (a.start, a.end)),
            Some((at(1, 22, 0), at(2, 6, 0)))
        );
    }

    #[test]
    fn test_overlap_resolves_to_earliest_end() {
        let mut schedule =
            Schedule::parse(&["1-7 08:00-20:00", "1-7 09:00-12:00 geofence"]).expect("parse");
        let eval = schedule.evaluate_at(at(1, 10, 0));
        let active = eval.active.expect("active");
        assert_eq!(active.index, 1);
        assert_eq!(active.mode, TrackingMode::Geofence);
    }

    #[test]
    fn test_literal_window_triggers_once() {
        let mut schedule =
            Schedule::parse(&["2024-01-01-08:00 2024-01-01-12:00"]).expect("parse");

        assert_eq!(schedule.evaluate_at(at(1, 7, 0)).next_boundary, Some(at(1, 8, 0)));
        assert!(schedule.evaluate_at(at(1, 9, 0)).active.is_some());

        let after = schedule.evaluate_at(at(1, 13, 0));
        assert!(after.active.is_none());
        assert_eq!(after.next_boundary, None);
        assert!(schedule.windows()[0].triggered);
    }
}
