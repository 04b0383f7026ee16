//! Topic name and filter validation
//!
//! The local subscription takes a topic filter (wildcards allowed), the remote
//! publish target takes a topic name (no wildcards). Both are checked once at
//! startup so a bad topic is a configuration error rather than a SUBACK
//! failure or a disconnect from the remote broker.

/// Maximum encoded length of an MQTT topic
const MAX_TOPIC_LEN: usize = 65535;

fn check_common(topic: &str, kind: &'static str) -> Result<(), String> {
    if topic.is_empty() {
        return Err(format!("{} cannot be empty", kind));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!("{} exceeds maximum length", kind));
    }
    if topic.contains('\0') {
        return Err(format!("{} cannot contain null character", kind));
    }
    Ok(())
}

/// Validate a topic name used for PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    check_common(topic, "topic name")?;
    if topic.contains(['+', '#']) {
        return Err(format!("topic name '{}' cannot contain wildcards", topic));
    }
    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE
///
/// `#` must be the whole last level, `+` must be a whole level. Shared
/// subscriptions (`$share/{group}/{filter}`) are accepted so several proxy
/// instances can split one stream.
pub fn validate_topic_filter(filter: &str) -> Result<(), String> {
    check_common(filter, "topic filter")?;

    let actual = match filter.strip_prefix("$share/") {
        Some(rest) => match rest.split_once('/') {
            Some((group, actual)) if !group.is_empty() && !actual.is_empty() => {
                if group.contains(['+', '#']) {
                    return Err("shared subscription group cannot contain wildcards".to_string());
                }
                actual
            }
            _ => return Err(format!("invalid shared subscription '{}'", filter)),
        },
        None => filter,
    };

    let levels: Vec<&str> = actual.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(format!(
                "'{}': multi-level wildcard must be the entire last level",
                filter
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!(
                "'{}': single-level wildcard must occupy an entire level",
                filter
            ));
        }
    }

    Ok(())
}

/// Check whether a received topic falls under a subscription filter
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let filter = match filter.strip_prefix("$share/") {
        Some(rest) => rest.split_once('/').map(|(_, f)| f).unwrap_or(rest),
        None => filter,
    };

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("sensor/data").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("sensor/+").is_err());
        assert!(validate_topic_name("sensor/#").is_err());
        assert!(validate_topic_name("bad\0topic").is_err());
    }

    #[test_case("sensor/data" ; "plain")]
    #[test_case("#" ; "everything")]
    #[test_case("sensor/#" ; "trailing multi")]
    #[test_case("+/temperature" ; "leading single")]
    #[test_case("site/+/sensor/+" ; "several singles")]
    #[test_case("$share/proxies/sensor/#" ; "shared")]
    fn test_valid_filters(filter: &str) {
        assert!(validate_topic_filter(filter).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("sensor#" ; "hash inside level")]
    #[test_case("sensor/#/more" ; "hash not last")]
    #[test_case("sensor+/data" ; "plus inside level")]
    #[test_case("$share/sensor" ; "shared without filter")]
    #[test_case("$share//sensor" ; "shared without group")]
    fn test_invalid_filters(filter: &str) {
        assert!(validate_topic_filter(filter).is_err());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("sensor/data", "sensor/data"));
        assert!(!topic_matches_filter("sensor/data/raw", "sensor/data"));
        assert!(!topic_matches_filter("sensor", "sensor/data"));

        assert!(topic_matches_filter("sensor/data", "sensor/+"));
        assert!(!topic_matches_filter("sensor/data/raw", "sensor/+"));

        assert!(topic_matches_filter("sensor", "sensor/#"));
        assert!(topic_matches_filter("sensor/a/b/c", "sensor/#"));
        assert!(topic_matches_filter("anything/at/all", "#"));

        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/#"));

        assert!(topic_matches_filter("sensor/data", "$share/proxies/sensor/+"));
    }
}
