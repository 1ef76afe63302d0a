use crate::models::UserAgentInfo;

pub const UNKNOWN_OS: &str = "Unknown OS";
pub const UNKNOWN_BROWSER: &str = "Unknown Browser";
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

// Rules are tried top to bottom and the first hit wins, so the order is part
// of the behaviour (e.g. Chrome must come before Safari).
struct Rule {
    label: &'static str,
    any_of: &'static [&'static str],
    none_of: &'static [&'static str],
}

#[rustfmt::skip]
const OS_RULES: &[Rule] = &[
    Rule { label: "Windows", any_of: &["windows"], none_of: &[] },
    Rule { label: "macOS", any_of: &["macintosh", "mac os"], none_of: &[] },
    Rule { label: "Linux", any_of: &["linux"], none_of: &[] },
    Rule { label: "Android", any_of: &["android"], none_of: &[] },
    Rule { label: "iOS", any_of: &["iphone", "ios"], none_of: &[] },
];

#[rustfmt::skip]
const BROWSER_RULES: &[Rule] = &[
    Rule { label: "Chrome", any_of: &["chrome"], none_of: &["edg"] },
    Rule { label: "Firefox", any_of: &["firefox"], none_of: &[] },
    Rule { label: "Safari", any_of: &["safari"], none_of: &["chrome"] },
    Rule { label: "Edge", any_of: &["edg"], none_of: &[] },
    Rule { label: "Opera", any_of: &["opera"], none_of: &[] },
    Rule { label: "Internet Explorer", any_of: &["msie", "trident"], none_of: &[] },
];

#[rustfmt::skip]
const DEVICE_RULES: &[Rule] = &[
    Rule { label: "Mobile", any_of: &["mobile", "android", "iphone"], none_of: &[] },
    Rule { label: "Tablet", any_of: &["tablet", "ipad"], none_of: &[] },
];

fn first_match(rules: &[Rule], lowered: &str) -> Option<&'static str> {
    rules
        .iter()
        .find(|rule| {
            rule.any_of.iter().any(|needle| lowered.contains(needle))
                && !rule.none_of.iter().any(|needle| lowered.contains(needle))
        })
        .map(|rule| rule.label)
}

/// Derives OS, browser and device labels from a raw user agent string.
pub fn classify(raw: Option<&str>) -> UserAgentInfo {
    let lowered = match raw {
        Some(raw) => raw.to_lowercase(),
        None => {
            return UserAgentInfo {
                os: UNKNOWN_OS,
                browser: UNKNOWN_BROWSER,
                device_type: UNKNOWN_DEVICE,
            }
        }
    };

    UserAgentInfo {
        os: first_match(OS_RULES, &lowered).unwrap_or(UNKNOWN_OS),
        browser: first_match(BROWSER_RULES, &lowered).unwrap_or(UNKNOWN_BROWSER),
        device_type: first_match(DEVICE_RULES, &lowered).unwrap_or("Desktop"),
    }
}
