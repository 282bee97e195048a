//! Offset applied to an instant before it is rendered into a bucket value.

use std::fmt;
use std::str::FromStr;

use time::{OffsetDateTime, UtcOffset};

use crate::{Error, Result};

/// Which offset bucket values are rendered in.
///
/// `Utc` is the usual choice for aggregates read from several regions; the
/// default keeps whatever offset the event carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timezone {
    /// Render in the offset attached to the event timestamp.
    #[default]
    Recorded,
    /// Shift to UTC before rendering.
    Utc,
    /// Shift to a fixed offset before rendering.
    Fixed(UtcOffset),
}

impl Timezone {
    /// Build a fixed offset from whole seconds east of UTC.
    pub fn fixed(offset_seconds: i32) -> Result<Self> {
        UtcOffset::from_whole_seconds(offset_seconds)
            .map(Timezone::Fixed)
            .map_err(|err| Error::InvalidConfig(format!("timezone offset {offset_seconds}: {err}")))
    }

    /// Whether instants are converted to UTC before formatting.
    pub fn is_utc(&self) -> bool {
        matches!(self, Timezone::Utc)
    }

    /// Convert `at` into the offset this timezone renders in.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidKey`: the shifted date falls outside the supported
    ///   year range
    pub fn apply(&self, at: OffsetDateTime) -> Result<OffsetDateTime> {
        let offset = match self {
            Timezone::Recorded => return Ok(at),
            Timezone::Utc => UtcOffset::UTC,
            Timezone::Fixed(offset) => *offset,
        };
        at.checked_to_offset(offset).ok_or_else(|| {
            Error::InvalidKey(format!("{at} cannot be shifted to {self}: out of range"))
        })
    }
}

impl FromStr for Timezone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recorded" | "" => Ok(Timezone::Recorded),
            "UTC" | "utc" | "Z" => Ok(Timezone::Utc),
            _ if (s.starts_with('+') || s.starts_with('-'))
                && s.len() == 5
                && s[1..].bytes().all(|b| b.is_ascii_digit()) =>
            {
                let hours: i32 = s[1..3]
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid timezone offset: {s}")))?;
                let minutes = s[3..5]
                    .parse::<i32>()
                    .ok()
                    .filter(|minutes| (0..60).contains(minutes))
                    .ok_or_else(|| Error::InvalidConfig(format!("invalid timezone offset: {s}")))?;
                let sign = if s.starts_with('-') { -1 } else { 1 };
                Timezone::fixed(sign * (hours * 3600 + minutes * 60))
            }
            _ => Err(Error::InvalidConfig(format!("unknown timezone: {s}"))),
        }
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timezone::Recorded => f.write_str("recorded"),
            Timezone::Utc => f.write_str("UTC"),
            Timezone::Fixed(offset) => {
                let total = offset.whole_seconds();
                let sign = if total < 0 { '-' } else { '+' };
                let total = total.abs();
                write!(f, "{sign}{:02}{:02}", total / 3600, (total % 3600) / 60)
            }
        }
    }
}

impl TryFrom<String> for Timezone {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timezone> for String {
    fn from(value: Timezone) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_named_and_offset_forms() {
        assert_eq!("UTC".parse::<Timezone>().expect("parse"), Timezone::Utc);
        assert_eq!("recorded".parse::<Timezone>().expect("parse"), Timezone::Recorded);
        assert_eq!(
            "+0800".parse::<Timezone>().expect("+0800"),
            Timezone::fixed(8 * 3600).expect("valid offset")
        );
        assert_eq!(
            "-0530".parse::<Timezone>().expect("parse"),
            Timezone::fixed(-(5 * 3600 + 30 * 60)).expect("valid offset")
        );
        assert!("Mars/Olympus".parse::<Timezone>().is_err());
        assert!("+0099".parse::<Timezone>().is_err());
        assert!("-0160".parse::<Timezone>().is_err());
        assert!("+00+5".parse::<Timezone>().is_err());
    }

    #[test]
    fn display_round_trips_offsets() {
        let tz = Timezone::fixed(-(5 * 3600 + 30 * 60)).expect("valid offset");
        assert_eq!(tz.to_string(), "-0530");
        assert_eq!(tz.to_string().parse::<Timezone>().expect("parse"), tz);
    }

    #[test]
    fn utc_shift_moves_across_midnight() {
        let at = datetime!(2024-01-29 07:30 +08:00);
        let shifted = Timezone::Utc.apply(at).expect("in range");
        assert_eq!(shifted.day(), 28);
        assert_eq!(shifted.hour(), 23);
        assert_eq!(Timezone::Recorded.apply(at).expect("recorded"), at);
    }

    #[test]
    fn shift_out_of_calendar_range_is_an_error() {
        let late = datetime!(9999-12-31 23:30 -01:00);
        assert!(matches!(Timezone::Utc.apply(late), Err(Error::InvalidKey(_))));
        assert_eq!(Timezone::Recorded.apply(late).expect("recorded"), late);

        let west = Timezone::fixed(-2 * 3600).expect("valid offset");
        assert!(west.apply(datetime!(9999-12-31 23:30 +01:00)).is_ok());
        let east = Timezone::fixed(2 * 3600).expect("valid offset");
        assert!(matches!(east.apply(late), Err(Error::InvalidKey(_))));
    }
}
