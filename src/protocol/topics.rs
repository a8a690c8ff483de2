//! Topic name and topic filter validation and wildcard matching
//!
//! Implements the MQTT 3.1.1 rules: levels are separated by `/`, `+` matches
//! exactly one level, `#` matches the parent level and every level below it,
//! and topics beginning with `$` are never matched by a filter whose first
//! level is a wildcard.

use thiserror::Error;

/// Longest topic the wire format can carry
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Topic validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic is {0} bytes, longer than the 65535 byte limit")]
    TooLong(usize),
    #[error("Topic contains a null character")]
    ContainsNul,
    #[error("Invalid wildcard placement in filter '{0}'")]
    InvalidWildcard(String),
    #[error("Topic name '{0}' cannot contain wildcards")]
    WildcardInTopicName(String),
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::ContainsNul);
    }
    Ok(())
}

/// Validate a topic filter used for subscriptions
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        let wildcard_ok = match *level {
            "#" => index == last,
            "+" => true,
            other => !other.contains('#') && !other.contains('+'),
        };
        if !wildcard_ok {
            return Err(TopicError::InvalidWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if has_wildcards(topic) {
        return Err(TopicError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

pub fn has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// Does `filter` match the concrete `topic`?
///
/// Both arguments are assumed valid; an invalid filter simply fails to match.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `#` must be the last filter level, so anything left in the topic matches
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn level() -> impl Strategy<Value = String> {
        "[a-z0-9_]{0,6}"
    }

    fn topic() -> impl Strategy<Value = String> {
        prop::collection::vec(level(), 1..6)
            .prop_map(|levels| levels.join("/"))
            .prop_filter("non-empty", |t| !t.is_empty())
    }

    proptest! {
        #[test]
        fn topic_matches_itself(topic in topic()) {
            prop_assert!(matches(&topic, &topic));
        }

        #[test]
        fn hash_matches_every_plain_topic(topic in topic()) {
            prop_assert!(matches("#", &topic));
        }

        #[test]
        fn plus_substitutes_any_single_level(topic in topic(), index in 0usize..6) {
            let mut levels: Vec<&str> = topic.split('/').collect();
            let index = index % levels.len();
            levels[index] = "+";
            let filter = levels.join("/");
            prop_assert!(matches(&filter, &topic), "{} should match {}", filter, topic);
        }

        #[test]
        fn extra_filter_level_never_matches(topic in topic(), extra in "[a-z]{1,4}") {
            let filter = format!("{topic}/{extra}");
            prop_assert!(!matches(&filter, &topic));
        }

        #[test]
        fn multi_level_suffix_matches_children(topic in topic(), child in topic()) {
            let filter = format!("{topic}/#");
            let nested = format!("{topic}/{child}");
            prop_assert!(matches(&filter, &topic));
            prop_assert!(matches(&filter, &nested));
        }

        #[test]
        fn generated_topics_are_valid(topic in topic()) {
            prop_assert!(validate_topic_name(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
        }
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/c/d"));
        assert!(!matches("a/+/c", "a/c"));
        assert!(matches("a/+", "a/"));
        assert!(matches("+/+", "/finance"));
        assert!(!matches("+", "/finance"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c"));
        assert!(!matches("a/#", "ab"));
        assert!(!matches("a/#", "b/a"));
        assert!(matches("#", "iot/notifications"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("iot/notifications", "iot/notifications"));
        assert!(!matches("iot/notifications", "iot/notification"));
        assert!(!matches("iot/notifications", "iot/notifications/extra"));
        // leading slash is a distinct (empty) level
        assert!(!matches("iot/notifications", "/iot/notifications"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_leading_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
        assert!(matches("$SYS/+/uptime", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_topic_filter("iot/notifications").is_ok());
        assert!(validate_topic_filter("home/+/alerts").is_ok());
        assert!(validate_topic_filter("home/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("/").is_ok());

        assert_eq!(validate_topic_filter(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_topic_filter("home/#/alerts"),
            Err(TopicError::InvalidWildcard(_))
        ));
        assert!(matches!(
            validate_topic_filter("home/kid+"),
            Err(TopicError::InvalidWildcard(_))
        ));
        assert!(matches!(
            validate_topic_filter("home#"),
            Err(TopicError::InvalidWildcard(_))
        ));
        assert_eq!(
            validate_topic_filter("home/\0"),
            Err(TopicError::ContainsNul)
        );
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("iot/notifications").is_ok());
        assert!(matches!(
            validate_topic_name("iot/+"),
            Err(TopicError::WildcardInTopicName(_))
        ));
        assert!(matches!(
            validate_topic_name("iot/#"),
            Err(TopicError::WildcardInTopicName(_))
        ));
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));

        let long = "a".repeat(MAX_TOPIC_LENGTH + 1);
        assert_eq!(
            validate_topic_name(&long),
            Err(TopicError::TooLong(MAX_TOPIC_LENGTH + 1))
        );
    }
}
