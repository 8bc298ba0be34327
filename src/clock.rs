use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// Time source for interest accrual, cooldowns and retry scheduling.
/// Engines take this as a trait object so tests can drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Calendar day in UTC, used for once-per-day gates.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Millisecond timestamp of the UTC midnight that ends `today`. Daily
/// quotas and the login bonus reset at this instant.
pub fn next_midnight_ms(today: NaiveDate) -> i64 {
    today
        .succ_opt()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
        .unwrap_or(i64::MAX)
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let before = clock.now_millis();
        clock.advance(chrono::Duration::hours(3));
        assert_eq!(clock.now_millis() - before, 3 * 3600 * 1000);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn midnight_ends_the_current_day() {
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap());
        let midnight = next_midnight_ms(clock.today());
        assert_eq!(midnight - clock.now_millis(), 6 * 3600 * 1000);
    }
}
