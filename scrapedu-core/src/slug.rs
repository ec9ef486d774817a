//! Entity name → directory slug conversion.

use std::path::{Component, Path};

use unicode_normalization::UnicodeNormalization;

/// Used when neither the name nor the id yields any slug characters.
const FALLBACK_SLUG: &str = "entity";

/// Convert a display name into a filesystem-safe slug.
///
/// Accents are folded to ASCII, apostrophes, ampersands, periods and
/// parentheses are dropped, every other non-alphanumeric run becomes a single
/// hyphen, and leading/trailing hyphens are trimmed.
///
/// ```
/// use scrapedu_core::slug::slugify;
///
/// assert_eq!(slugify("St. John's University"), "st-johns-university");
/// assert_eq!(slugify("University of California-Berkeley"), "university-of-california-berkeley");
/// ```
pub fn slugify(name: &str) -> String {
    let folded: String = name
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| !matches!(c, '\'' | '&' | '.' | '(' | ')'))
        .collect();

    let mut slug = String::with_capacity(folded.len());
    for c in folded.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    slug.trim_matches('-').to_string()
}

/// Slug for a new entity: `slugify(name)`, else `slugify(id)`, else a
/// fixed fallback. Never empty.
pub fn entity_slug(name: &str, id: &str) -> String {
    [name, id]
        .into_iter()
        .map(slugify)
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SLUG.to_string())
}

/// True when `slug` names exactly one directory below the output root.
pub fn is_safe_slug(slug: &str) -> bool {
    if slug.contains(['/', '\\']) {
        return false;
    }
    let mut parts = Path::new(slug).components();
    matches!(
        (parts.next(), parts.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// `base`, or `base-<id>` when `base` is taken, then `base-<id>-2`,
/// `base-<id>-3`, ... until `taken` rejects none of them.
pub fn disambiguate(base: &str, id: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let id = slugify(id);
    let stem = if id.is_empty() {
        base.to_string()
    } else {
        format!("{base}-{id}")
    };
    if !taken(&stem) {
        return stem;
    }
    (2..)
        .map(|n| format!("{stem}-{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Massachusetts Institute of Technology", "massachusetts-institute-of-technology")]
    #[case("MIT", "mit")]
    #[case("Texas A&M University", "texas-am-university")]
    #[case("St. John's University", "st-johns-university")]
    #[case("University of Wisconsin (Madison)", "university-of-wisconsin-madison")]
    #[case("Université de Montréal", "universite-de-montreal")]
    #[case("  --Weird   Spacing--  ", "weird-spacing")]
    #[case("Saint Mary\u{2019}s College", "saint-marys-college")]
    fn slugify_cases(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(slugify(name), expected);
    }

    #[test]
    fn slug_is_empty_for_symbol_only_names() {
        assert_eq!(slugify("&&&"), "");
    }

    #[rstest]
    #[case("Alpha University", "1", "alpha-university")]
    #[case("東京大学", "166027", "166027")]
    #[case("東京大学", "../", "entity")]
    fn entity_slug_is_never_empty(#[case] name: &str, #[case] id: &str, #[case] expected: &str) {
        assert_eq!(entity_slug(name, id), expected);
    }

    #[rstest]
    #[case("mit", true)]
    #[case("", false)]
    #[case(".", false)]
    #[case("..", false)]
    #[case("a/b", false)]
    #[case("a\\b", false)]
    #[case("/abs", false)]
    fn safe_slugs(#[case] slug: &str, #[case] safe: bool) {
        assert_eq!(is_safe_slug(slug), safe);
    }

    #[test]
    fn disambiguate_walks_past_taken_suffixes() {
        let taken = ["union-college", "union-college-2"];
        let is_taken = |s: &str| taken.contains(&s);
        assert_eq!(disambiguate("beloit", "2", is_taken), "beloit");
        assert_eq!(disambiguate("union-college", "7", is_taken), "union-college-7");
        assert_eq!(disambiguate("union-college", "2", is_taken), "union-college-2-2");
    }
}
