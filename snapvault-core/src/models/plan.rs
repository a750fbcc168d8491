use crate::error::BackupError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Daily,
    Weekly,
    MonthlyStart,
    MonthlyEnd,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::MonthlyStart => "monthly_start",
            ScheduleType::MonthlyEnd => "monthly_end",
        }
    }
}

impl FromStr for ScheduleType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(ScheduleType::Daily),
            "weekly" => Ok(ScheduleType::Weekly),
            "monthly_start" => Ok(ScheduleType::MonthlyStart),
            "monthly_end" => Ok(ScheduleType::MonthlyEnd),
            other => anyhow::bail!("Unknown schedule type {other:?}"),
        }
    }
}

/// The singleton automatic-backup plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPlan {
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    /// 0 = Sunday. Only meaningful for weekly plans.
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub retention_days: u32,
    pub keep_last_successful: u32,
    pub include_files: bool,
    pub last_auto_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BackupPlan {
    pub fn default_at(now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            schedule_type: ScheduleType::Daily,
            weekday: 0,
            hour: 2,
            minute: 0,
            retention_days: 30,
            keep_last_successful: 7,
            include_files: false,
            last_auto_run_at: None,
            updated_at: now,
        }
    }

    /// Hour and minute forced into 0-23 / 0-59.
    pub fn clamped_time(&self) -> (u32, u32) {
        (u32::from(self.hour.min(23)), u32::from(self.minute.min(59)))
    }
}

/// Changes accepted by `update_plan`. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub enabled: Option<bool>,
    pub schedule_type: Option<ScheduleType>,
    pub weekday: Option<i64>,
    pub hour: Option<i64>,
    pub minute: Option<i64>,
    pub retention_days: Option<i64>,
    pub keep_last_successful: Option<i64>,
    pub include_files: Option<bool>,
}

impl PlanUpdate {
    /// Apply to `plan`, validating the result.
    pub fn apply(&self, plan: &BackupPlan, now: DateTime<Utc>) -> Result<BackupPlan, BackupError> {
        let mut next = plan.clone();
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(schedule_type) = self.schedule_type {
            next.schedule_type = schedule_type;
        }
        if let Some(weekday) = self.weekday {
            if !(0..=6).contains(&weekday) {
                return Err(BackupError::InvalidPlan(format!(
                    "weekday must be between 0 and 6, got {weekday}"
                )));
            }
            next.weekday = weekday as u8;
        } else if self.schedule_type == Some(ScheduleType::Weekly)
            && plan.schedule_type != ScheduleType::Weekly
        {
            return Err(BackupError::InvalidPlan("weekly plans require a weekday".into()));
        }
        if let Some(hour) = self.hour {
            next.hour = hour.clamp(0, 23) as u8;
        }
        if let Some(minute) = self.minute {
            next.minute = minute.clamp(0, 59) as u8;
        }
        if let Some(days) = self.retention_days {
            if !(1..=3650).contains(&days) {
                return Err(BackupError::InvalidPlan(format!(
                    "retention_days must be between 1 and 3650, got {days}"
                )));
            }
            next.retention_days = days as u32;
        }
        if let Some(keep) = self.keep_last_successful {
            if !(1..=1000).contains(&keep) {
                return Err(BackupError::InvalidPlan(format!(
                    "keep_last_successful must be between 1 and 1000, got {keep}"
                )));
            }
            next.keep_last_successful = keep as u32;
        }
        if let Some(include_files) = self.include_files {
            next.include_files = include_files;
        }
        next.updated_at = now;
        Ok(next)
    }
}

/// System-wide maintenance flag, set while a real restore runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceState {
    pub enabled: bool,
    pub reason: Option<String>,
    pub restore_run_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl MaintenanceState {
    pub fn for_restore(run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            reason: Some("restore".into()),
            restore_run_id: Some(run_id.to_string()),
            since: Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_minute_clamped() {
        let now = Utc::now();
        let plan = BackupPlan::default_at(now);
        let update = PlanUpdate {
            hour: Some(99),
            minute: Some(-5),
            ..Default::default()
        };
        let next = update.apply(&plan, now).unwrap();
        assert_eq!((next.hour, next.minute), (23, 0));

        let mut raw = plan.clone();
        raw.hour = 200;
        raw.minute = 75;
        assert_eq!(raw.clamped_time(), (23, 59));
    }

    #[test]
    fn test_weekly_needs_valid_weekday() {
        let now = Utc::now();
        let plan = BackupPlan::default_at(now);

        let missing = PlanUpdate {
            schedule_type: Some(ScheduleType::Weekly),
            ..Default::default()
        };
        assert!(matches!(missing.apply(&plan, now), Err(BackupError::InvalidPlan(_))));

        let bad = PlanUpdate {
            schedule_type: Some(ScheduleType::Weekly),
            weekday: Some(7),
            ..Default::default()
        };
        assert!(matches!(bad.apply(&plan, now), Err(BackupError::InvalidPlan(_))));

        let good = PlanUpdate {
            schedule_type: Some(ScheduleType::Weekly),
            weekday: Some(0),
            ..Default::default()
        };
        let next = good.apply(&plan, now).unwrap();
        assert_eq!(next.schedule_type, ScheduleType::Weekly);
        assert_eq!(next.weekday, 0);
    }

    #[test]
    fn test_retention_bounds() {
        let now = Utc::now();
        let plan = BackupPlan::default_at(now);
        for bad in [
            PlanUpdate {
                retention_days: Some(0),
                ..Default::default()
            },
            PlanUpdate {
                keep_last_successful: Some(0),
                ..Default::default()
            },
        ] {
            assert!(matches!(bad.apply(&plan, now), Err(BackupError::InvalidPlan(_))));
        }
    }

    #[test]
    fn test_update_preserves_last_run() {
        let now = Utc::now();
        let mut plan = BackupPlan::default_at(now);
        plan.last_auto_run_at = Some(now);
        let next = PlanUpdate {
            include_files: Some(true),
            ..Default::default()
        }
        .apply(&plan, now)
        .unwrap();
        assert_eq!(next.last_auto_run_at, Some(now));
        assert!(next.include_files);
    }
}
