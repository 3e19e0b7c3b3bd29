//! Rate limits for OCR API calls, written as `"10/s"` or `"600/m"`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// A maximum number of calls per second or per minute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    /// Calls allowed per `period`.
    pub calls: u32,
    /// `1s` or `60s`.
    pub period: Duration,
}

impl RateLimit {
    /// Build a limiter enforcing this rate.
    ///
    /// The bucket starts full, so the first `calls` requests go out at once,
    /// and then refills one token at a time, spreading later calls evenly
    /// across the period.
    pub fn to_rate_limiter(self) -> RateLimiter {
        let calls = self.calls.max(1);
        let interval = (self.period / calls).max(Duration::from_millis(1));
        RateLimiter::builder()
            .initial(calls as usize)
            .max(calls as usize)
            .refill(1)
            .interval(interval)
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = if self.period == Duration::from_secs(60) {
            "m"
        } else {
            "s"
        };
        write!(f, "{}/{unit}", self.calls)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Result<Self> {
            let (calls, unit) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected CALLS/s or CALLS/m"))?;
            let calls = calls.trim().parse::<u32>()?;
            if calls == 0 {
                return Err(anyhow!("rate must be positive"));
            }
            let period = match unit.trim() {
                "s" => Duration::from_secs(1),
                "m" => Duration::from_secs(60),
                other => return Err(anyhow!("unsupported period {:?}", other)),
            };
            Ok(Self { calls, period })
        };
        parse().with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let limit = "10/s".parse::<RateLimit>().unwrap();
        assert_eq!(limit.calls, 10);
        assert_eq!(limit.period, Duration::from_secs(1));
        assert_eq!(limit.to_string(), "10/s");

        let limit = "600/m".parse::<RateLimit>().unwrap();
        assert_eq!(limit.period, Duration::from_secs(60));
        assert_eq!(limit.to_string(), "600/m");
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["10", "10/h", "0/s", "x/s", "4294967296/s"] {
            assert!(bad.parse::<RateLimit>().is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_largest_rate_builds_a_limiter() {
        let limit = "4294967295/s".parse::<RateLimit>().unwrap();
        assert_eq!(limit.calls, u32::MAX);
        let limiter = limit.to_rate_limiter();
        assert!(limiter.try_acquire(1));
    }

    #[tokio::test]
    async fn test_limiter_starts_full() {
        let limiter = "5/s".parse::<RateLimit>().unwrap().to_rate_limiter();
        assert!(limiter.try_acquire(5));
    }
}
