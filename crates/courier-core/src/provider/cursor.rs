//! Typed sync cursors.
//!
//! Each provider tracks its position differently (a millisecond timestamp, a
//! date, a numeric update offset, a Slack `ts`). The stored column is a plain
//! string; in memory the cursor is tagged with its provider so that two
//! cursors can only be compared when they mean the same thing.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::connection::ProviderKind;
use crate::error::{Error, Result};

/// Slack message timestamp (`"1712345678.000200"`), unique per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlackTs {
    seconds: i64,
    micros: u32,
}

impl SlackTs {
    /// Parse a Slack `ts` string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (secs, frac) = value.split_once('.').unwrap_or((value, ""));
        let seconds = secs.parse().ok()?;
        if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let micros = format!("{frac:0<6}").parse().ok()?;
        Some(Self { seconds, micros })
    }

    /// Whole seconds since the epoch.
    #[must_use]
    pub const fn seconds(&self) -> i64 {
        self.seconds
    }

    /// The timestamp as a date.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.micros * 1000)
    }
}

impl fmt::Display for SlackTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.seconds, self.micros)
    }
}

/// Position of the last ingested item for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCursor {
    /// Gmail `internalDate` in milliseconds.
    Gmail {
        /// Milliseconds since the epoch.
        internal_date_ms: i64,
    },
    /// Outlook `receivedDateTime`.
    Outlook {
        /// Receipt time of the newest message seen.
        received_at: DateTime<Utc>,
    },
    /// Telegram `update_id`.
    Telegram {
        /// Highest update id processed.
        update_id: i64,
    },
    /// Slack message `ts`.
    Slack {
        /// Newest message timestamp seen.
        ts: SlackTs,
    },
}

impl SyncCursor {
    /// Parse a stored cursor for the given provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCursor`] if the value does not match the
    /// provider's format, or the provider keeps no cursor.
    pub fn parse(provider: ProviderKind, value: &str) -> Result<Self> {
        let invalid = || Error::InvalidCursor {
            provider,
            value: value.to_string(),
        };
        let value = value.trim();

        match provider {
            ProviderKind::Gmail => value
                .parse()
                .map(|internal_date_ms| Self::Gmail { internal_date_ms })
                .map_err(|_| invalid()),
            ProviderKind::Outlook => DateTime::parse_from_rfc3339(value)
                .map(|dt| Self::Outlook {
                    received_at: dt.with_timezone(&Utc),
                })
                .map_err(|_| invalid()),
            ProviderKind::Telegram => value
                .parse()
                .map(|update_id| Self::Telegram { update_id })
                .map_err(|_| invalid()),
            ProviderKind::Slack => SlackTs::parse(value)
                .map(|ts| Self::Slack { ts })
                .ok_or_else(invalid),
            ProviderKind::Teams | ProviderKind::WhatsApp | ProviderKind::Discord => Err(invalid()),
        }
    }

    /// Provider this cursor belongs to.
    #[must_use]
    pub const fn provider(&self) -> ProviderKind {
        match self {
            Self::Gmail { .. } => ProviderKind::Gmail,
            Self::Outlook { .. } => ProviderKind::Outlook,
            Self::Telegram { .. } => ProviderKind::Telegram,
            Self::Slack { .. } => ProviderKind::Slack,
        }
    }

    /// Storage representation.
    #[must_use]
    pub fn to_raw(&self) -> String {
        match self {
            Self::Gmail { internal_date_ms } => internal_date_ms.to_string(),
            Self::Outlook { received_at } => {
                received_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            }
            Self::Telegram { update_id } => update_id.to_string(),
            Self::Slack { ts } => ts.to_string(),
        }
    }

    /// Whether `self` is strictly past `other`.
    ///
    /// Cursors of different providers are never ordered.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Greater)
    }

    /// The later of an optional high-water mark and a new position.
    #[must_use]
    pub fn latest(current: Option<Self>, candidate: Self) -> Self {
        match current {
            Some(current) if !candidate.is_after(&current) => current,
            _ => candidate,
        }
    }
}

impl PartialOrd for SyncCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Gmail { internal_date_ms: a }, Self::Gmail { internal_date_ms: b })
            | (Self::Telegram { update_id: a }, Self::Telegram { update_id: b }) => {
                Some(a.cmp(b))
            }
            (Self::Outlook { received_at: a }, Self::Outlook { received_at: b }) => {
                Some(a.cmp(b))
            }
            (Self::Slack { ts: a }, Self::Slack { ts: b }) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}
