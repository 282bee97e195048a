//! Composite store keys: an entity key followed by horizon segments.
//!
//! Rendered form: `<entity><sep><abbrev>-<value>[<sep><abbrev>-<value>...]`,
//! e.g. `E1|m-2024-01-29 15:42:00`.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::horizon::{TimeHorizon, Timezone};
use crate::{Error, Result};

/// Escape character that lets an entity key carry the separator.
pub const ESCAPE: char = '\\';

/// How the configured horizon set maps onto store rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLayout {
    /// One row per horizon: `E1|m-...`, `E1|H-...`.
    #[default]
    PerHorizon,
    /// One row carrying every horizon segment: `E1|m-...|H-...`.
    Combined,
}

/// A store row identifier.
///
/// Equality and hashing use the rendered string, so two keys built from the
/// same entity and bucket values always group together.
#[derive(Debug, Clone)]
pub struct BucketKey {
    entity: String,
    segments: Vec<(TimeHorizon, String)>,
    rendered: String,
}

impl BucketKey {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn segments(&self) -> &[(TimeHorizon, String)] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl PartialEq for BucketKey {
    fn eq(&self, other: &Self) -> bool {
        self.rendered == other.rendered
    }
}

impl Eq for BucketKey {}

impl std::hash::Hash for BucketKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rendered.hash(state);
    }
}

impl PartialOrd for BucketKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BucketKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rendered.cmp(&other.rendered)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for BucketKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Builds [`BucketKey`]s for a fixed separator and timezone.
#[derive(Debug, Clone)]
pub struct BucketKeyBuilder {
    separator: char,
    timezone: Timezone,
}

impl BucketKeyBuilder {
    /// # Errors
    ///
    /// - `Error::InvalidConfig`: separator is `-` or the escape character,
    ///   both of which already appear inside rendered segments
    pub fn new(separator: char, timezone: Timezone) -> Result<Self> {
        if separator == '-' || separator == ESCAPE {
            return Err(Error::InvalidConfig(format!(
                "key separator {separator:?} is reserved"
            )));
        }
        Ok(Self {
            separator,
            timezone,
        })
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn timezone(&self) -> Timezone {
        self.timezone
    }

    /// Key for `entity` with one segment per horizon, in the order given.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidKey`: entity is empty, carries an unescaped
    ///   separator, or ends in a dangling escape; `horizons` is empty; or
    ///   `at` cannot be shifted into the builder's timezone
    pub fn build(
        &self,
        entity: &str,
        at: OffsetDateTime,
        horizons: &[TimeHorizon],
    ) -> Result<BucketKey> {
        self.validate_entity(entity)?;
        if horizons.is_empty() {
            return Err(Error::InvalidKey(format!(
                "no horizons given for entity '{entity}'"
            )));
        }

        let mut rendered = String::with_capacity(entity.len() + horizons.len() * 24);
        rendered.push_str(entity);
        let mut segments = Vec::with_capacity(horizons.len());
        for horizon in horizons {
            let value = horizon.bucket_value_in(at, self.timezone)?;
            rendered.push(self.separator);
            rendered.push_str(horizon.abbreviation());
            rendered.push('-');
            rendered.push_str(&value);
            segments.push((*horizon, value));
        }

        Ok(BucketKey {
            entity: entity.to_string(),
            segments,
            rendered,
        })
    }

    /// Every key one event contributes to under `layout`.
    pub fn keys_for(
        &self,
        entity: &str,
        at: OffsetDateTime,
        horizons: &[TimeHorizon],
        layout: KeyLayout,
    ) -> Result<Vec<BucketKey>> {
        match layout {
            KeyLayout::PerHorizon => horizons
                .iter()
                .map(|horizon| self.build(entity, at, std::slice::from_ref(horizon)))
                .collect(),
            KeyLayout::Combined => self.build(entity, at, horizons).map(|key| vec![key]),
        }
    }

    fn validate_entity(&self, entity: &str) -> Result<()> {
        if entity.is_empty() {
            return Err(Error::InvalidKey("entity key is empty".to_string()));
        }
        let mut chars = entity.chars();
        while let Some(ch) = chars.next() {
            if ch == ESCAPE {
                if chars.next().is_none() {
                    return Err(Error::InvalidKey(format!(
                        "entity key '{entity}' ends with a dangling escape"
                    )));
                }
            } else if ch == self.separator {
                return Err(Error::InvalidKey(format!(
                    "entity key '{entity}' contains unescaped separator {:?}",
                    self.separator
                )));
            }
        }
        Ok(())
    }
}

impl Default for BucketKeyBuilder {
    fn default() -> Self {
        Self {
            separator: '|',
            timezone: Timezone::Recorded,
        }
    }
}
