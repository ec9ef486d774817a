//! Checks downloaded URLs against the disallow rules the robots phase
//! recorded.
//!
//! Rules are matched the way most crawlers read them: a plain rule is a path
//! prefix, a rule ending in `*` is a glob over the whole path.

use serde::Serialize;

use crate::types::{EntityId, Slug};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotsViolation {
    pub url: String,
    pub matched_rule: String,
}

/// Violations of one entity, as listed in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityViolations {
    pub id: EntityId,
    pub slug: Slug,
    pub violations: Vec<RobotsViolation>,
}

/// Every URL in `urls` whose path matches one of `rules`, paired with the
/// first rule it matched.
pub fn find_violations<'a, U, R>(urls: U, rules: R) -> Vec<RobotsViolation>
where
    U: IntoIterator<Item = &'a str>,
    R: IntoIterator<Item = &'a str>,
{
    let rules: Vec<&str> = rules.into_iter().filter(|r| !r.is_empty()).collect();
    if rules.is_empty() {
        return Vec::new();
    }
    urls.into_iter()
        .filter_map(|url| {
            let path = url_path(url);
            rules
                .iter()
                .find(|rule| rule_matches(rule, &path))
                .map(|rule| RobotsViolation {
                    url: url.to_string(),
                    matched_rule: rule.to_string(),
                })
        })
        .collect()
}

pub fn rule_matches(rule: &str, path: &str) -> bool {
    if rule.ends_with('*') {
        glob_matches(rule, path)
    } else {
        path.starts_with(rule)
    }
}

fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    }
}

/// Whole-string match where `*` is any run of characters and `?` is one.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p).copied() {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, consumed)) => {
                    p = star + 1;
                    t = consumed + 1;
                    backtrack = Some((star, consumed + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/private", "/private/notes.pdf", true)]
    #[case("/private", "/public/private", false)]
    #[case("/search*", "/search?q=x", true)]
    #[case("/*.pdf*", "/docs/catalog.pdf", true)]
    #[case("/*.pdf*", "/docs/catalog.html", false)]
    #[case("/tmp/*", "/tmp", false)]
    #[case("*", "/", true)]
    fn rule_matching(#[case] rule: &str, #[case] path: &str, #[case] expected: bool) {
        assert_eq!(rule_matches(rule, path), expected);
    }

    #[test]
    fn violations_use_the_url_path_and_first_matching_rule() {
        let urls = [
            "https://alpha.edu/private/catalog.pdf?x=1",
            "https://alpha.edu/catalog/2024.html",
            "https://alpha.edu/tmp/faculty.html",
        ];
        let found = find_violations(urls, ["/tmp/*", "/private", "/tmp/"]);
        assert_eq!(
            found,
            vec![
                RobotsViolation {
                    url: urls[0].into(),
                    matched_rule: "/private".into(),
                },
                RobotsViolation {
                    url: urls[2].into(),
                    matched_rule: "/tmp/*".into(),
                },
            ]
        );
    }

    #[test]
    fn empty_rules_never_match() {
        assert!(find_violations(["https://alpha.edu/x"], [""]).is_empty());
    }
}
