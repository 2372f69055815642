//! Work schedule arithmetic. [WorkSchedule] is the only thing here: it knows
//! which hours of which weekdays count as working time and can measure how
//! much of it passed between two instants.

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};
use thiserror::Error;

use crate::utils::time::next_day_start;

#[derive(Debug, Error)]
#[error("invalid work schedule: {0}")]
pub struct InvalidSchedule(pub String);

/// Immutable description of a working week. Built once from configuration.
#[derive(Debug, Clone)]
pub struct WorkSchedule {
    day_start: NaiveTime,
    break_start: NaiveTime,
    break_end: NaiveTime,
    day_end: NaiveTime,
    // Indexed by Weekday::num_days_from_monday.
    working: [bool; 7],
}

impl WorkSchedule {
    pub fn new(
        day_start: NaiveTime,
        break_start: NaiveTime,
        break_end: NaiveTime,
        day_end: NaiveTime,
        weekdays: impl IntoIterator<Item = Weekday>,
    ) -> Result<Self, InvalidSchedule> {
        if !(day_start < break_start && break_start < break_end && break_end < day_end) {
            return Err(InvalidSchedule(format!(
                "day must be ordered as {day_start} < {break_start} < {break_end} < {day_end}"
            )));
        }

        let mut working = [false; 7];
        for day in weekdays {
            working[day.num_days_from_monday() as usize] = true;
        }
        if !working.contains(&true) {
            return Err(InvalidSchedule("at least one working weekday is required".into()));
        }

        Ok(Self {
            day_start,
            break_start,
            break_end,
            day_end,
            working,
        })
    }

    pub fn is_working_day(&self, day: Weekday) -> bool {
        self.working[day.num_days_from_monday() as usize]
    }

    /// Working time between `start` and `end`, both in the schedule's local
    /// time. Only hours between day start and day end on working weekdays
    /// count, minus the break window. `start > end` yields zero.
    pub fn elapsed_working_time(&self, start: NaiveDateTime, end: NaiveDateTime) -> Duration {
        let mut total = Duration::zero();
        let mut cursor = start;

        // Walks day by day, crediting the clipped portions of each working
        // day the range touches.
        while cursor < end {
            if !self.is_working_day(cursor.weekday()) {
                cursor = next_day_start(cursor);
                continue;
            }

            let date = cursor.date();
            let day_start = date.and_time(self.day_start);
            let break_start = date.and_time(self.break_start);
            let break_end = date.and_time(self.break_end);
            let day_end = date.and_time(self.day_end);

            if cursor < day_start {
                cursor = day_start;
                continue;
            }
            if cursor >= day_end {
                cursor = next_day_start(cursor);
                continue;
            }

            if cursor <= break_start {
                if end <= break_start {
                    total += end - cursor;
                    cursor = end;
                } else {
                    total += break_start - cursor;
                    cursor = break_end;
                }
            } else if cursor < break_end {
                // The range starts inside the break. Nothing credited.
                cursor = break_end;
            } else if end <= day_end {
                total += end - cursor;
                cursor = end;
            } else {
                total += day_end - cursor;
                cursor = next_day_start(cursor);
            }
        }

        total
    }
}
