//! Resolution/retention tier descriptor.

use crate::core::{Result, TierError, Timestamp};
use nom::{
    character::complete::{char, digit1, one_of},
    combinator::{all_consuming, map_res},
    sequence::{pair, separated_pair},
    IResult,
};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

const MINUTE: u32 = 60;
const HOUR: u32 = 60 * MINUTE;
const DAY: u32 = 24 * HOUR;
const YEAR: u32 = 365 * DAY;

/// One tier: `precision` seconds per point kept for `retention` seconds.
///
/// Policies are named like `60s:24h`; the archive directory uses the name
/// without the colon (`60s24h`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetentionPolicy {
    name: String,
    precision: u32,
    retention: u32,
    db_name: String,
}

impl RetentionPolicy {
    /// Parse a policy name such as `5m:7d`.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        let (_, (precision, retention)) = policy(name)
            .map_err(|e| TierError::config(format!("invalid retention policy {name:?}: {e}")))?;
        Self::new(name, precision, retention)
    }

    /// Parse a comma separated chain, highest precision first.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let policies = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;
        validate_chain(&policies)?;
        Ok(policies)
    }

    fn new(name: &str, precision: u32, retention: u32) -> Result<Self> {
        if precision == 0 {
            return Err(TierError::config(format!("{name}: precision must be > 0")));
        }
        if retention < precision {
            return Err(TierError::config(format!(
                "{name}: retention shorter than precision"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            precision,
            retention,
            db_name: name.replace(':', ""),
        })
    }

    /// Policy name, e.g. `60s:24h`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Archive name, e.g. `60s24h`.
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Seconds per point.
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Seconds of history kept.
    pub fn retention(&self) -> u32 {
        self.retention
    }

    /// Start of the interval `ts` falls into.
    pub fn interval(&self, ts: Timestamp) -> Timestamp {
        ts - ts % self.precision
    }

    /// Whether `ts` is still inside this tier's window as of `now`.
    ///
    /// Both sides are interval aligned, so a point in the same interval as
    /// `now - retention` is kept.
    pub fn includes(&self, ts: Timestamp, now: Timestamp) -> bool {
        self.interval(now.saturating_sub(self.retention)) <= self.interval(ts)
    }

    /// Fails unless `ts` sits exactly on an interval boundary.
    pub fn assert_aligned(&self, ts: Timestamp) -> Result<()> {
        if self.interval(ts) == ts {
            Ok(())
        } else {
            Err(TierError::IntervalMismatch {
                ts,
                precision: self.precision,
                policy: self.name.clone(),
            })
        }
    }

    /// Upper bound of points this tier returns for `[from, until]`.
    pub fn max_points(&self, from: Timestamp, until: Timestamp, now: Timestamp) -> u64 {
        let until = until.min(now);
        let start = now.saturating_sub(self.retention).max(from);
        if start > until {
            return 0;
        }
        u64::from((until - start) / self.precision)
    }

    /// Finest policy whose window includes both `from` and `until`.
    pub fn pick_for_query<'a, I>(
        policies: I,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Option<&'a Arc<RetentionPolicy>>
    where
        I: IntoIterator<Item = &'a Arc<RetentionPolicy>>,
    {
        policies
            .into_iter()
            .filter(|p| p.includes(from, now) && p.includes(until, now))
            .min_by_key(|p| p.precision)
    }
}

impl Ord for RetentionPolicy {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precision
            .cmp(&other.precision)
            .then_with(|| self.retention.cmp(&other.retention))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for RetentionPolicy {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn validate_chain(policies: &[RetentionPolicy]) -> Result<()> {
    for pair in policies.windows(2) {
        if pair[0].precision >= pair[1].precision {
            return Err(TierError::config(format!(
                "retention chain must go from fine to coarse: {} then {}",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

fn seconds(input: &str) -> IResult<&str, u32> {
    map_res(pair(digit1, one_of("smhdy")), |(n, unit): (&str, char)| {
        let n: u32 = n.parse().map_err(|_| "number out of range")?;
        let scale = match unit {
            's' => 1,
            'm' => MINUTE,
            'h' => HOUR,
            'd' => DAY,
            _ => YEAR,
        };
        n.checked_mul(scale).ok_or("duration overflows u32")
    })(input)
}

/// Parse a single span such as `90s` or `7d` into seconds.
pub fn parse_span(span: &str) -> Result<u32> {
    let span = span.trim();
    all_consuming(seconds)(span)
        .map(|(_, secs)| secs)
        .map_err(|e| TierError::parse(format!("invalid time span {span:?}: {e}")))
}

fn policy(input: &str) -> IResult<&str, (u32, u32)> {
    all_consuming(separated_pair(seconds, char(':'), seconds))(input)
}
