//! Staleness policy: decides whether a point is due for another run.
//!
//! Schedules are written as short strings in point files:
//!
//! - `""` or anything unparseable: always due
//! - `"3600"`: due once more than 3600 seconds have elapsed
//! - `"daily"` / `"weekly"`: fixed 24h / 7 day intervals
//! - `"daily:H"`: due once the last success is older than hour `H` of today
//!   (or of yesterday, before `H`)
//! - `"weekly:D"`: aligned on weekday `D` (Monday = 0)
//! - `"monthly:D"`: aligned on day-of-month `D` (1..=28)
//!
//! Calendar boundaries keep the time of day of `now`. All times are UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tracing::warn;

const DAY_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Frequency {
    #[default]
    Always,
    Every { seconds: u64 },
    Monthly { day: u32 },
    Weekly { weekday: u32 },
    Daily { hour: u32 },
}

impl Frequency {
    /// Parses a schedule string. Never fails: unknown input means "always due".
    pub fn parse(schedule: &str) -> Self {
        let schedule = schedule.trim();
        if schedule.is_empty() {
            return Frequency::Always;
        }
        let parsed = match schedule.split_once(':') {
            None => match schedule {
                "daily" => Some(Frequency::Every { seconds: DAY_SECS }),
                "weekly" => Some(Frequency::Every { seconds: 7 * DAY_SECS }),
                n => n.parse().ok().map(|seconds| Frequency::Every { seconds }),
            },
            Some((unit, value)) => {
                let value: Option<u32> = value.trim().parse().ok();
                match (unit.trim(), value) {
                    ("monthly", Some(day @ 1..=28)) => Some(Frequency::Monthly { day }),
                    ("weekly", Some(weekday @ 0..=6)) => Some(Frequency::Weekly { weekday }),
                    ("daily", Some(hour @ 0..=23)) => Some(Frequency::Daily { hour }),
                    _ => None,
                }
            }
        };
        parsed.unwrap_or_else(|| {
            warn!("Unrecognized frequency '{}', point will always be due", schedule);
            Frequency::Always
        })
    }

    /// Most recent calendar boundary at or before `now`, for aligned schedules.
    pub fn boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Frequency::Always | Frequency::Every { .. } => None,
            Frequency::Monthly { day } => {
                let (year, month) = if now.day() >= day {
                    (now.year(), now.month())
                } else if now.month() == 1 {
                    (now.year() - 1, 12)
                } else {
                    (now.year(), now.month() - 1)
                };
                NaiveDate::from_ymd_opt(year, month, day)
                    .map(|date| date.and_time(now.time()).and_utc())
            }
            Frequency::Weekly { weekday } => {
                let back = (now.weekday().num_days_from_monday() + 7 - weekday) % 7;
                Some(now - Duration::days(back as i64))
            }
            Frequency::Daily { hour } => {
                let day = if now.hour() >= hour {
                    now
                } else {
                    now - Duration::days(1)
                };
                day.with_hour(hour)
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>, last_success: Option<DateTime<Utc>>) -> bool {
        let Some(last) = last_success else {
            return true;
        };
        match *self {
            Frequency::Always => true,
            Frequency::Every { seconds } => (now - last).num_seconds() > seconds as i64,
            _ => self.boundary(now).map_or(true, |floor| last < floor),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Always => f.write_str(""),
            Frequency::Every { seconds } => write!(f, "{}", seconds),
            Frequency::Monthly { day } => write!(f, "monthly:{}", day),
            Frequency::Weekly { weekday } => write!(f, "weekly:{}", weekday),
            Frequency::Daily { hour } => write!(f, "daily:{}", hour),
        }
    }
}

impl Serialize for Frequency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Frequency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Frequency::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(Frequency::parse(""), Frequency::Always);
        assert_eq!(Frequency::parse("bogus"), Frequency::Always);
        assert_eq!(Frequency::parse("monthly:31"), Frequency::Always);
        assert_eq!(Frequency::parse("3600"), Frequency::Every { seconds: 3600 });
        assert_eq!(Frequency::parse("daily"), Frequency::Every { seconds: 86_400 });
        assert_eq!(Frequency::parse("weekly"), Frequency::Every { seconds: 604_800 });
        assert_eq!(Frequency::parse("monthly:15"), Frequency::Monthly { day: 15 });
        assert_eq!(Frequency::parse("weekly:2"), Frequency::Weekly { weekday: 2 });
        assert_eq!(Frequency::parse("daily:4"), Frequency::Daily { hour: 4 });
    }

    #[test]
    fn test_daily_interval() {
        let now = at(2016, 6, 10, 12, 0);
        let daily = Frequency::parse("daily");
        assert!(!daily.is_due(now, Some(now - Duration::hours(23))));
        assert!(daily.is_due(now, Some(now - Duration::hours(25))));
        assert!(daily.is_due(now, None));
    }

    #[test]
    fn test_monthly_boundary() {
        let monthly = Frequency::parse("monthly:15");
        assert_eq!(monthly.boundary(at(2016, 6, 10, 8, 30)), Some(at(2016, 5, 15, 8, 30)));
        assert_eq!(monthly.boundary(at(2016, 6, 20, 8, 30)), Some(at(2016, 6, 15, 8, 30)));
        assert_eq!(monthly.boundary(at(2016, 1, 3, 0, 0)), Some(at(2015, 12, 15, 0, 0)));

        let now = at(2016, 6, 20, 8, 30);
        assert!(monthly.is_due(now, Some(at(2016, 6, 14, 23, 0))));
        assert!(!monthly.is_due(now, Some(at(2016, 6, 16, 0, 0))));
    }

    #[test]
    fn test_weekly_and_daily_boundary() {
        // 2016-06-10 is a Friday
        let now = at(2016, 6, 10, 9, 15);
        assert_eq!(Frequency::parse("weekly:0").boundary(now), Some(at(2016, 6, 6, 9, 15)));
        assert_eq!(Frequency::parse("weekly:4").boundary(now), Some(now));
        assert_eq!(Frequency::parse("daily:3").boundary(now), Some(at(2016, 6, 10, 3, 15)));
        assert_eq!(Frequency::parse("daily:22").boundary(now), Some(at(2016, 6, 9, 22, 15)));
    }

    #[test]
    fn test_always_due() {
        let now = Utc::now();
        assert!(Frequency::Always.is_due(now, Some(now)));
    }

    proptest! {
        #[test]
        fn boundary_never_after_now(secs in 0i64..2_000_000_000, day in 1u32..=28, hour in 0u32..24) {
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            for freq in [Frequency::Monthly { day }, Frequency::Daily { hour }, Frequency::Weekly { weekday: hour % 7 }] {
                let floor = freq.boundary(now).unwrap();
                prop_assert!(floor <= now);
                prop_assert!(now - floor < Duration::days(31));
                prop_assert!(!freq.is_due(now, Some(now)));
            }
        }
    }
}
