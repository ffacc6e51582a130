//! Daily run time computation for `watch` mode.

use chrono::{DateTime, Days, FixedOffset, Local, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use papermonitor_shared::{PaperMonitorError, Result, ScheduleSettings};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Local,
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    /// `local`, `UTC`/`Z`, a fixed offset like `+02:00`, or an IANA name.
    /// Unknown names fall back to local time.
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "local" | "" => return Self::Local,
            "utc" | "z" => return Self::Utc,
            _ => {}
        }
        if let Ok(offset) = raw.parse::<FixedOffset>() {
            return Self::Fixed(offset);
        }
        match raw.parse::<Tz>() {
            Ok(tz) => Self::Named(tz),
            Err(e) => {
                warn!(timezone = raw, error = %e, "unknown `schedule.timezone`; using local time");
                Self::Local
            }
        }
    }
}

/// A wall-clock time of day in a configured zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
    zone: Zone,
}

impl DailySchedule {
    /// Parse `schedule.run_time` (`HH:MM`) and `schedule.timezone`.
    pub fn from_settings(settings: &ScheduleSettings) -> Result<Self> {
        let at = NaiveTime::parse_from_str(settings.run_time.trim(), "%H:%M").map_err(|e| {
            PaperMonitorError::config(format!(
                "invalid `schedule.run_time` {:?} (expected HH:MM): {e}",
                settings.run_time
            ))
        })?;
        let zone = Zone::parse(&settings.timezone);
        info!(run_time = %at.format("%H:%M"), zone = ?zone, "daily schedule configured");

        Ok(Self { at, zone })
    }

    /// The first scheduled instant strictly after `now`.
    ///
    /// A day on which the run time does not exist (a DST gap) is skipped.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self.zone {
            Zone::Local => next_in(&Local, self.at, now),
            Zone::Utc => next_in(&Utc, self.at, now),
            Zone::Fixed(offset) => next_in(&offset, self.at, now),
            Zone::Named(tz) => next_in(&tz, self.at, now),
        };
        // Only reachable if three consecutive days skip the time entirely.
        next.unwrap_or_else(|| now + chrono::Duration::days(1))
    }

    /// Time to sleep from now until the next run.
    pub fn until_next(&self) -> std::time::Duration {
        let now = Utc::now();
        (self.next_run_after(now) - now)
            .to_std()
            .unwrap_or_default()
    }
}

fn next_in<Z: TimeZone>(tz: &Z, at: NaiveTime, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(tz).date_naive();
    (0..3u64)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .filter_map(|day| tz.from_local_datetime(&day.and_time(at)).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .find(|candidate| *candidate > now)
}
