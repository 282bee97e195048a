//! Time horizons: the granularities events are bucketed at.
//!
//! A [`TimeHorizon`] maps an instant to a bucket value string. Two instants
//! that fall in the same bucket always render to the same string, which is
//! what lets rows from different records accumulate into one aggregate.
//!
//! ```
//! use stream_aggregators::horizon::TimeHorizon;
//! use time::macros::datetime;
//!
//! let at = datetime!(2024-03-09 14:47:31.250 UTC);
//! assert_eq!(TimeHorizon::Minute.bucket_value(at), "2024-03-09 14:47:00");
//!
//! let quarter = TimeHorizon::minutes_grouped(15)?;
//! assert_eq!(quarter.bucket_value(at), "2024-03-09 14:45:00");
//! assert_eq!(TimeHorizon::Forever.bucket_value(at), "*");
//! # Ok::<(), stream_aggregators::Error>(())
//! ```

mod timezone;

use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;

use crate::{Error, Result};

pub use timezone::Timezone;

/// Bucket value of [`TimeHorizon::Forever`]. Key syntax forbids empty values.
pub const FOREVER_VALUE: &str = "*";

/// Rank of [`TimeHorizon::Forever`], coarser than every other horizon.
pub const FOREVER_RANK: u16 = 999;

/// Horizons eligible for automatic hierarchies, finest first.
const HIERARCHY: [TimeHorizon; 8] = [
    TimeHorizon::Millisecond,
    TimeHorizon::Second,
    TimeHorizon::Minute,
    TimeHorizon::Hour,
    TimeHorizon::Day,
    TimeHorizon::Month,
    TimeHorizon::Year,
    TimeHorizon::Forever,
];

/// Width of a grouped-minutes bucket, in minutes (1..=59).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct GroupWidth(u8);

impl GroupWidth {
    pub fn new(minutes: u32) -> Result<Self> {
        match minutes {
            1..=59 => Ok(Self(minutes as u8)),
            _ => Err(Error::InvalidGranularity(minutes)),
        }
    }

    pub fn minutes(&self) -> u32 {
        u32::from(self.0)
    }

    /// Widths that do not divide 60 leave a short final bucket each hour.
    pub fn divides_hour(&self) -> bool {
        60 % self.0 == 0
    }

    fn floor(&self, minute: u8) -> u8 {
        (minute / self.0) * self.0
    }
}

impl TryFrom<u32> for GroupWidth {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        GroupWidth::new(value)
    }
}

impl From<GroupWidth> for u32 {
    fn from(value: GroupWidth) -> Self {
        value.minutes()
    }
}

/// A bucketing granularity.
///
/// `MinutesGrouped` shares its rank with `Minute` but is a sibling choice,
/// never part of a derived hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeHorizon {
    Millisecond,
    Second,
    Minute,
    MinutesGrouped(GroupWidth),
    Hour,
    Day,
    Month,
    Year,
    Forever,
}

impl TimeHorizon {
    /// Grouped-minutes horizon with the given bucket width.
    pub fn minutes_grouped(width: u32) -> Result<Self> {
        GroupWidth::new(width).map(TimeHorizon::MinutesGrouped)
    }

    pub fn rank(&self) -> u16 {
        match self {
            TimeHorizon::Millisecond => 0,
            TimeHorizon::Second => 1,
            TimeHorizon::Minute | TimeHorizon::MinutesGrouped(_) => 2,
            TimeHorizon::Hour => 3,
            TimeHorizon::Day => 4,
            TimeHorizon::Month => 5,
            TimeHorizon::Year => 6,
            TimeHorizon::Forever => FOREVER_RANK,
        }
    }

    /// Short tag used when several horizons share one key.
    pub fn abbreviation(&self) -> &'static str {
        match self {
            TimeHorizon::Millisecond => "S",
            TimeHorizon::Second => "s",
            TimeHorizon::Minute => "m",
            TimeHorizon::MinutesGrouped(_) => "mb",
            TimeHorizon::Hour => "H",
            TimeHorizon::Day => "d",
            TimeHorizon::Month => "M",
            TimeHorizon::Year => "Y",
            TimeHorizon::Forever => "*",
        }
    }

    /// Rendering template, absent for computed horizons.
    pub fn format_pattern(&self) -> Option<&'static str> {
        match self {
            TimeHorizon::Millisecond => Some("yyyy-MM-dd HH:mm:ss.SSS"),
            TimeHorizon::Second => Some("yyyy-MM-dd HH:mm:ss"),
            TimeHorizon::Minute => Some("yyyy-MM-dd HH:mm:00"),
            TimeHorizon::Hour => Some("yyyy-MM-dd HH:00:00"),
            TimeHorizon::Day => Some("yyyy-MM-dd 00:00:00"),
            TimeHorizon::Month => Some("yyyy-MM-01 00:00:00"),
            TimeHorizon::Year => Some("yyyy-01-01 00:00:00"),
            TimeHorizon::MinutesGrouped(_) | TimeHorizon::Forever => None,
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self, TimeHorizon::MinutesGrouped(_))
    }

    /// Bucket value of `at`, rendered in the offset it carries.
    pub fn bucket_value(&self, at: OffsetDateTime) -> String {
        self.render(at)
    }

    /// Bucket value of `at` after shifting it into `timezone`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidKey`: the shifted instant leaves the supported
    ///   calendar range
    pub fn bucket_value_in(&self, at: OffsetDateTime, timezone: Timezone) -> Result<String> {
        Ok(self.render(timezone.apply(at)?))
    }

    fn render(&self, at: OffsetDateTime) -> String {
        let (year, month, day) = (at.year(), at.month() as u8, at.day());
        let (hour, minute, second) = (at.hour(), at.minute(), at.second());

        match self {
            TimeHorizon::Millisecond => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
                year,
                month,
                day,
                hour,
                minute,
                second,
                at.millisecond()
            ),
            TimeHorizon::Second => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ),
            TimeHorizon::Minute => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:00",
                year, month, day, hour, minute
            ),
            TimeHorizon::MinutesGrouped(width) => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:00",
                year,
                month,
                day,
                hour,
                width.floor(minute)
            ),
            TimeHorizon::Hour => format!("{:04}-{:02}-{:02} {:02}:00:00", year, month, day, hour),
            TimeHorizon::Day => format!("{:04}-{:02}-{:02} 00:00:00", year, month, day),
            TimeHorizon::Month => format!("{:04}-{:02}-01 00:00:00", year, month),
            TimeHorizon::Year => format!("{:04}-01-01 00:00:00", year),
            TimeHorizon::Forever => FOREVER_VALUE.to_string(),
        }
    }

    /// `abbreviation-bucketvalue`, for keys that mix several horizons.
    pub fn key_with_abbreviation(&self, at: OffsetDateTime, timezone: Timezone) -> Result<String> {
        Ok(format!("{}-{}", self.abbreviation(), self.bucket_value_in(at, timezone)?))
    }

    /// This horizon through `Forever`, finest first.
    pub fn full_hierarchy(&self) -> Vec<TimeHorizon> {
        self.ranks_through(FOREVER_RANK)
    }

    /// Every hierarchy horizon from this one up to `other`, finest first.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRange`: `other` is finer than `self`
    pub fn hierarchy_to(&self, other: TimeHorizon) -> Result<Vec<TimeHorizon>> {
        if other.rank() < self.rank() {
            return Err(Error::InvalidRange {
                from: *self,
                to: other,
            });
        }
        Ok(self.ranks_through(other.rank()))
    }

    fn ranks_through(&self, last: u16) -> Vec<TimeHorizon> {
        let first = self.rank();
        HIERARCHY
            .iter()
            .copied()
            .filter(|h| h.rank() >= first && h.rank() <= last)
            .collect()
    }

    /// Bucket width of a grouped horizon, in minutes.
    pub fn granularity(&self) -> Result<u32> {
        match self {
            TimeHorizon::MinutesGrouped(width) => Ok(width.minutes()),
            _ => Err(Error::UnsupportedOperation(
                "granularity is only defined for grouped minutes",
            )),
        }
    }

    /// Copy of this grouped horizon with a different width.
    pub fn with_granularity(&self, minutes: u32) -> Result<TimeHorizon> {
        match self {
            TimeHorizon::MinutesGrouped(_) => TimeHorizon::minutes_grouped(minutes),
            _ => Err(Error::UnsupportedOperation(
                "granularity is only defined for grouped minutes",
            )),
        }
    }
}

impl fmt::Display for TimeHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeHorizon::Millisecond => f.write_str("millisecond"),
            TimeHorizon::Second => f.write_str("second"),
            TimeHorizon::Minute => f.write_str("minute"),
            TimeHorizon::MinutesGrouped(width) => write!(f, "minutes_grouped:{}", width.minutes()),
            TimeHorizon::Hour => f.write_str("hour"),
            TimeHorizon::Day => f.write_str("day"),
            TimeHorizon::Month => f.write_str("month"),
            TimeHorizon::Year => f.write_str("year"),
            TimeHorizon::Forever => f.write_str("forever"),
        }
    }
}

impl FromStr for TimeHorizon {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        if let Some(width) = lowered.strip_prefix("minutes_grouped:") {
            let width: u32 = width
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("invalid grouped width in '{s}'")))?;
            return TimeHorizon::minutes_grouped(width);
        }
        match lowered.as_str() {
            "millisecond" => Ok(TimeHorizon::Millisecond),
            "second" => Ok(TimeHorizon::Second),
            "minute" => Ok(TimeHorizon::Minute),
            "hour" => Ok(TimeHorizon::Hour),
            "day" => Ok(TimeHorizon::Day),
            "month" => Ok(TimeHorizon::Month),
            "year" => Ok(TimeHorizon::Year),
            "forever" => Ok(TimeHorizon::Forever),
            _ => Err(Error::InvalidConfig(format!("unknown time horizon: {s}"))),
        }
    }
}

impl TryFrom<String> for TimeHorizon {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeHorizon> for String {
    fn from(value: TimeHorizon) -> Self {
        value.to_string()
    }
}
