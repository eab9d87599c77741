use std::sync::OnceLock;

use regex::Regex;

/// Compile `pattern` once into `cell`. An invalid pattern yields `None`, so
/// callers treat it as "no match" instead of panicking.
pub(crate) fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use regex::Regex;

    use super::compiled;

    static VALID: OnceLock<Option<Regex>> = OnceLock::new();
    static INVALID: OnceLock<Option<Regex>> = OnceLock::new();

    #[test]
    fn compiles_once_and_degrades_on_bad_pattern() {
        let first = compiled(&VALID, r"\d+").expect("valid pattern");
        let second = compiled(&VALID, r"ignored").expect("cached pattern");
        assert!(std::ptr::eq(first, second));
        assert!(first.is_match("42"));

        assert!(compiled(&INVALID, r"(unclosed").is_none());
    }
}
