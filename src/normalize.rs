//! Text folding shared by the directory, the brand heuristic and the matcher.
//!
//! There is exactly one matching key for names: [`match_key`]. Supplier names
//! lose the naming prefix before they are keyed, brands are keyed as-is.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Lowercase and strip diacritics, keeping every other character.
pub fn fold(input: &str) -> String {
    input
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Folded form with everything but letters and digits removed.
pub fn normalize_name(input: &str) -> String {
    fold(input)
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .collect()
}

/// Folded text split on anything that is not alphanumeric.
pub fn words(input: &str) -> Vec<String> {
    fold(input)
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when every word of `needle` appears contiguously, as whole words, in
/// `haystack`. Both sides are folded first.
pub fn contains_whole_words(haystack: &str, needle: &str) -> bool {
    let needle = words(needle);
    if needle.is_empty() {
        return false;
    }
    let haystack = words(haystack);
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_slice())
}

/// Case- and accent-insensitive prefix test on the trimmed name.
pub fn has_prefix(name: &str, prefix: &str) -> bool {
    let prefix = fold(prefix.trim());
    if prefix.is_empty() {
        return true;
    }
    fold(name.trim_start()).starts_with(&prefix)
}

/// Remove the supplier-naming prefix (and any separator after it) from a raw
/// supplier name. Names without the prefix are returned trimmed.
pub fn strip_prefix<'a>(name: &'a str, prefix: &str) -> &'a str {
    let trimmed = name.trim();
    let prefix = prefix.trim();
    if prefix.is_empty() || !has_prefix(trimmed, prefix) {
        return trimmed;
    }
    let skip = trimmed
        .char_indices()
        .nth(prefix.chars().count())
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    trimmed[skip..].trim_start_matches(|ch: char| !ch.is_alphanumeric())
}

/// The canonical key used for every brand/supplier comparison.
pub fn match_key(name: &str, prefix: &str) -> String {
    normalize_name(strip_prefix(name, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_strips_diacritics_and_case() {
        assert_eq!(fold("Açaí LÓREAL"), "acai loreal");
    }

    #[test]
    fn normalize_name_drops_punctuation() {
        assert_eq!(normalize_name("La Roche-Posay"), "larocheposay");
        assert_eq!(normalize_name("L'Oréal Paris"), "lorealparis");
    }

    #[test]
    fn whole_word_containment_respects_boundaries() {
        assert!(contains_whole_words("Sérum Vichy Minéral 89", "vichy"));
        assert!(contains_whole_words("protetor la roche-posay fps 50", "La Roche-Posay"));
        assert!(!contains_whole_words("Vichyssoise de batata", "Vichy"));
        assert!(!contains_whole_words("anything", "   "));
    }

    #[test]
    fn prefix_is_case_and_accent_insensitive() {
        assert!(has_prefix("fornecedor vichy", "FORNECEDOR"));
        assert!(has_prefix("  FORNECEDOR - EUCERIN", "Fornecedor"));
        assert!(!has_prefix("VICHY FORNECEDOR", "FORNECEDOR"));
    }

    #[test]
    fn strip_prefix_keeps_brand_part() {
        assert_eq!(strip_prefix("FORNECEDOR VICHY", "FORNECEDOR"), "VICHY");
        assert_eq!(strip_prefix("FORNECEDOR - La Roche", "fornecedor"), "La Roche");
        assert_eq!(strip_prefix("Distribuidora X", "FORNECEDOR"), "Distribuidora X");
    }

    #[test]
    fn match_key_is_shared_by_both_sides() {
        assert_eq!(match_key("FORNECEDOR VICHY", "FORNECEDOR"), match_key("Vichy", "FORNECEDOR"));
    }
}
