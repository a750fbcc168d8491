//! Calendar math for automatic backups. No I/O.
//!
//! All functions are generic over the time zone so the host decides which
//! wall clock the plan's hour and minute refer to.

use crate::models::{BackupPlan, ScheduleType};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

/// First slot of `plan` strictly after `reference`.
pub fn next_run_after<Tz: TimeZone>(plan: &BackupPlan, reference: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = reference.timezone();
    let (hour, minute) = plan.clamped_time();
    let today = reference.date_naive();
    let at = |date: NaiveDate| slot(&tz, date, hour, minute);

    match plan.schedule_type {
        ScheduleType::Daily => {
            let candidate = at(today);
            if candidate > *reference {
                candidate
            } else {
                at(add_days(today, 1))
            }
        }
        ScheduleType::Weekly => {
            let target = u32::from(plan.weekday % 7);
            let current = today.weekday().num_days_from_sunday();
            let offset = (target + 7 - current) % 7;
            let candidate = at(add_days(today, u64::from(offset)));
            if candidate > *reference {
                candidate
            } else {
                at(add_days(today, u64::from(offset) + 7))
            }
        }
        ScheduleType::MonthlyStart => {
            let first = first_of_month(today.year(), today.month());
            let candidate = at(first);
            if candidate > *reference {
                candidate
            } else {
                let (y, m) = next_month(today.year(), today.month());
                at(first_of_month(y, m))
            }
        }
        ScheduleType::MonthlyEnd => {
            let candidate = at(last_day_of_month(today.year(), today.month()));
            if candidate > *reference {
                candidate
            } else {
                let (y, m) = next_month(today.year(), today.month());
                at(last_day_of_month(y, m))
            }
        }
    }
}

/// Whether a run is due at `now`, given the previous run (or `now` when none).
///
/// Monthly-end plans are also due at any point of the month's actual last
/// day once the slot time has passed. That branch ignores `last_run`, so
/// callers must de-duplicate against the persisted last run themselves.
pub fn should_run_by_plan<Tz: TimeZone>(
    plan: &BackupPlan,
    last_run: Option<&DateTime<Tz>>,
    now: &DateTime<Tz>,
) -> bool {
    if plan.schedule_type == ScheduleType::MonthlyEnd {
        let today = now.date_naive();
        let (hour, minute) = plan.clamped_time();
        if is_last_day_of_month(today) && *now >= slot(&now.timezone(), today, hour, minute) {
            return true;
        }
    }

    let reference = last_run.cloned().unwrap_or_else(|| now.clone());
    next_run_after(plan, &reference) <= *now
}

pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    date == last_day_of_month(date.year(), date.month())
}

/// "Day 0 of next month".
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (y, m) = next_month(year, month);
    first_of_month(y, m).pred_opt().unwrap_or(NaiveDate::MIN)
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX)
}

/// Wall-clock `hour:minute` on `date`. A time skipped by a DST jump resolves
/// to the first valid instant after it.
fn slot<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Tz> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| date.and_time(NaiveTime::default()));
    resolve_local(tz, naive)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt;
    }
    let shifted = naive + chrono::Duration::hours(1);
    tz.from_local_datetime(&shifted)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}
