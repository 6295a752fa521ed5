use chrono::{DateTime, Utc};

/// Source of "now" for every scheduling decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Mutex;

    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        pub fn fixed() -> Self {
            Self::new(Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap())
        }

        pub fn advance(&self, by: Duration) {
            let mut guard = self.now.lock().unwrap();
            *guard += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
