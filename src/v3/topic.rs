//! Topic names, topic filters and the wildcard matching between them.
//!
//! <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718106>

use core::fmt::Display;

use memchr::{memchr, memchr2};

use super::header::{Str, StrError};

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Error for an invalid topic name or topic filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TopicError {
    /// Topic names and filters must be at least one character long.
    Empty,
    /// The topic name contains a wildcard character.
    Wildcard,
    /// The multi-level wildcard is not the last level, or shares its level.
    MultiLevel,
    /// The single-level wildcard shares its level with other characters.
    SingleLevel,
    /// Longer than a string field can hold.
    TooLong,
    /// Contains a character forbidden in MQTT strings.
    InvalidChar,
}

impl Display for TopicError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TopicError::Empty => write!(f, "the topic is empty"),
            TopicError::Wildcard => write!(f, "the topic name contains a wildcard"),
            TopicError::MultiLevel => {
                write!(f, "the multi-level wildcard must be alone in the last level")
            }
            TopicError::SingleLevel => {
                write!(f, "the single-level wildcard must occupy an entire level")
            }
            TopicError::TooLong => write!(f, "the topic exceeds {} bytes", Str::MAX_BYTES),
            TopicError::InvalidChar => write!(f, "the topic contains an invalid character"),
        }
    }
}

impl std::error::Error for TopicError {}

/// The topic must fit a string field.
fn check_encoding(topic: &str) -> Result<(), TopicError> {
    match Str::try_from(topic) {
        Ok(_) => Ok(()),
        Err(StrError::MaxBytes { .. }) => Err(TopicError::TooLong),
        Err(_) => Err(TopicError::InvalidChar),
    }
}

/// Checks a topic name used to publish a message.
///
/// # Errors
///
/// If the name is empty, contains wildcard characters or can't be encoded.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    check_encoding(topic)?;

    if contains_wildcard(topic) {
        return Err(TopicError::Wildcard);
    }

    Ok(())
}

/// Checks a topic filter used to subscribe.
///
/// # Errors
///
/// If the filter is empty, can't be encoded or the wildcards are misplaced.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }

    check_encoding(filter)?;

    if !contains_wildcard(filter) {
        return Ok(());
    }

    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();

    while let Some(level) = levels.next() {
        if level == MULTI_LEVEL {
            if levels.peek().is_some() {
                return Err(TopicError::MultiLevel);
            }

            continue;
        }

        if memchr(b'#', level.as_bytes()).is_some() {
            return Err(TopicError::MultiLevel);
        }

        if level != SINGLE_LEVEL && memchr(b'+', level.as_bytes()).is_some() {
            return Err(TopicError::SingleLevel);
        }
    }

    Ok(())
}

/// Returns `true` if the topic contains a `+` or `#`.
pub(crate) fn contains_wildcard(topic: &str) -> bool {
    memchr2(b'+', b'#', topic.as_bytes()).is_some()
}

/// Checks if a topic name matches a topic filter.
///
/// The filter is expected to be valid.
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level don't match system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "sport/#" also matches the parent level "sport"
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
