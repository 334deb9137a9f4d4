use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separates the user part of an identifier from the device suffix.
pub const DEVICE_DELIMITER: char = '-';
/// Separates an identifier from the topic in a device channel name.
pub const CHANNEL_DELIMITER: char = '_';

/// Names one device within one user's fleet: `<user>-<device>`.
///
/// The user part never contains `-`, so the first `-` is always the
/// boundary; the device suffix may contain further dashes. Neither part may
/// contain `_`, which keeps `<identifier>_<topic>` unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    raw: String,
    boundary: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier `{0}` has no `-` between user and device")]
    MissingDevice(String),
    #[error("identifier `{0}` has an empty user part")]
    EmptyUser(String),
    #[error("identifier `{0}` has an empty device part")]
    EmptyDevice(String),
    #[error("identifier `{0}` contains a reserved character")]
    Reserved(String),
}

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if raw.contains(CHANNEL_DELIMITER) || raw.chars().any(char::is_whitespace) {
            return Err(IdentifierError::Reserved(raw.to_string()));
        }
        let Some(boundary) = raw.find(DEVICE_DELIMITER) else {
            return Err(IdentifierError::MissingDevice(raw.to_string()));
        };
        if boundary == 0 {
            return Err(IdentifierError::EmptyUser(raw.to_string()));
        }
        if boundary + 1 == raw.len() {
            return Err(IdentifierError::EmptyDevice(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            boundary,
        })
    }

    /// Parses a registration payload; payloads are UTF-8 identifiers.
    pub fn from_payload(payload: &[u8]) -> Result<Self, IdentifierError> {
        Self::parse(&String::from_utf8_lossy(payload))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn user(&self) -> &str {
        &self.raw[..self.boundary]
    }

    pub fn device(&self) -> &str {
        &self.raw[self.boundary + 1..]
    }

    /// Fully-qualified channel for `topic`: `<identifier>_<topic>`.
    pub fn channel(&self, topic: &str) -> String {
        format!("{}{}{}", self.raw, CHANNEL_DELIMITER, topic)
    }
}

/// Splits a device channel back into its identifier and topic.
pub fn split_channel(channel: &str) -> Option<(Identifier, &str)> {
    let (identifier, topic) = channel.split_once(CHANNEL_DELIMITER)?;
    if topic.is_empty() {
        return None;
    }
    let identifier = Identifier::parse(identifier).ok()?;
    Some((identifier, topic))
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
