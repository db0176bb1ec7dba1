// src/schedule.rs

//! Next-fire computation for cron expressions and schedule windows.
//!
//! Cron expressions use the `cron` crate syntax, with a leading seconds
//! field (`"0 */5 * * * *"`).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::errors::{JobflowError, Result};
use crate::task::model::ScheduleWindow;

/// Parse `expr`, mapping failures to [`JobflowError::InvalidSchedule`].
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| JobflowError::InvalidSchedule(format!("'{expr}': {e}")))
}

/// When a target with `cron` and `window` should fire next, strictly after
/// `after`.
///
/// - With a cron expression: the first fire time after `after` that is not
///   before the window start, or `None` once it would fall past the window
///   end.
/// - Without one: a one-shot at the window start, if that is still ahead
///   and nothing has run yet (`has_run == false`). Otherwise `None`, which
///   means manual triggers only.
pub fn next_fire(
    cron: Option<&str>,
    window: &ScheduleWindow,
    after: DateTime<Utc>,
    has_run: bool,
) -> Result<Option<DateTime<Utc>>> {
    let Some(expr) = cron else {
        return Ok(match window.start {
            Some(start) if !has_run && start > after => Some(start),
            _ => None,
        });
    };

    let schedule = parse_cron(expr)?;
    let from = match window.start {
        Some(start) if start > after => start - chrono::Duration::seconds(1),
        _ => after,
    };

    let next = schedule.after(&from).next();
    Ok(next.filter(|at| window.end.is_none_or(|end| *at <= end)))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let next = next_fire(
            Some("0 */5 * * * *"),
            &ScheduleWindow::default(),
            at(10, 2, 0),
            true,
        )
        .unwrap();
        assert_eq!(next, Some(at(10, 5, 0)));
    }

    #[test]
    fn window_start_pushes_the_first_fire() {
        let window = ScheduleWindow {
            start: Some(at(12, 0, 0)),
            end: None,
        };
        let next = next_fire(Some("0 0 * * * *"), &window, at(10, 30, 0), false).unwrap();
        assert_eq!(next, Some(at(12, 0, 0)));
    }

    #[test]
    fn nothing_after_the_window_end() {
        let window = ScheduleWindow {
            start: None,
            end: Some(at(10, 59, 0)),
        };
        let next = next_fire(Some("0 0 * * * *"), &window, at(10, 30, 0), true).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn one_shot_without_cron() {
        let window = ScheduleWindow {
            start: Some(at(11, 0, 0)),
            end: None,
        };
        assert_eq!(
            next_fire(None, &window, at(10, 0, 0), false).unwrap(),
            Some(at(11, 0, 0))
        );
        assert_eq!(next_fire(None, &window, at(10, 0, 0), true).unwrap(), None);
        assert_eq!(
            next_fire(None, &ScheduleWindow::default(), at(10, 0, 0), false).unwrap(),
            None
        );
    }

    #[test]
    fn bad_expression_is_an_invalid_schedule() {
        let err = next_fire(Some("every tuesday"), &ScheduleWindow::default(), at(0, 0, 0), false)
            .unwrap_err();
        assert!(matches!(err, JobflowError::InvalidSchedule(_)));
    }
}
