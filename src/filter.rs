//! Synchronous content classification (spec §4.B).
//!
//! Pure, no I/O at call time. The blocked-term set is loaded once at
//! construction (and may be reloaded); a failed load puts the Filter in
//! a degraded state where every `classify` call returns `Blocked` until
//! a successful reload, per the mandatory fail-safe policy.

use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked,
}

const LEET_TABLE: &[(char, char)] = &[
    ('3', 'e'),
    ('1', 'i'),
    ('0', 'o'),
    ('4', 'a'),
    ('5', 's'),
    ('7', 't'),
];

pub struct Filter {
    terms: HashSet<String>,
    strict: bool,
    enabled: bool,
    degraded: bool,
}

impl Filter {
    /// Load the blocked-term list from `path`. On failure the Filter is
    /// constructed in the degraded state.
    pub fn load(path: &Path, strict: bool, enabled: bool) -> Self {
        match Self::read_terms(path) {
            Ok(terms) => Filter {
                terms,
                strict,
                enabled,
                degraded: false,
            },
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load blocked-terms list; filter is degraded (fail-safe blocked)");
                Filter {
                    terms: HashSet::new(),
                    strict,
                    enabled,
                    degraded: true,
                }
            }
        }
    }

    fn read_terms(path: &Path) -> std::io::Result<HashSet<String>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| normalize(l))
            .collect())
    }

    /// Attempt to reload the blocked-term list. Clears the degraded
    /// state only on success.
    pub fn reload(&mut self, path: &Path) {
        match Self::read_terms(path) {
            Ok(terms) => {
                self.terms = terms;
                self.degraded = false;
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "blocked-terms reload failed; filter remains degraded");
                self.degraded = true;
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Classify a text fragment. Pure and synchronous.
    pub fn classify(&self, text: &str) -> Verdict {
        if !self.enabled {
            return Verdict::Allowed;
        }
        if self.degraded {
            return Verdict::Blocked;
        }

        let normalized = normalize(text);

        if self.strict {
            for term in &self.terms {
                if !term.is_empty() && normalized.contains(term.as_str()) {
                    return Verdict::Blocked;
                }
            }
        }

        for token in normalized.split_whitespace() {
            if self.terms.contains(token) {
                return Verdict::Blocked;
            }
        }

        Verdict::Allowed
    }
}

/// Normalize: case-fold, leetspeak substitution, strip non-alphanumeric,
/// collapse whitespace.
pub fn normalize(text: &str) -> String {
    let folded = text.to_lowercase();
    let substituted: String = folded
        .chars()
        .map(|c| {
            LEET_TABLE
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect();

    let stripped: String = substituted
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn terms_file(words: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for w in words {
            writeln!(f, "{w}").unwrap();
        }
        f
    }

    #[test]
    fn blocks_exact_token() {
        let f = terms_file(&["badword"]);
        let filter = Filter::load(f.path(), false, true);
        assert_eq!(filter.classify("this has badword in it"), Verdict::Blocked);
        assert_eq!(filter.classify("this is fine"), Verdict::Allowed);
    }

    #[test]
    fn leetspeak_normalization_catches_evasion() {
        let f = terms_file(&["badword"]);
        let filter = Filter::load(f.path(), false, true);
        assert_eq!(filter.classify("b4dw0rd"), Verdict::Blocked);
        assert_eq!(filter.classify("B4DW0RD!!"), Verdict::Blocked);
    }

    #[test]
    fn non_strict_does_not_match_substrings() {
        let f = terms_file(&["ass"]);
        let filter = Filter::load(f.path(), false, true);
        assert_eq!(filter.classify("classic car"), Verdict::Allowed);
    }

    #[test]
    fn strict_mode_matches_substrings() {
        let f = terms_file(&["ass"]);
        let filter = Filter::load(f.path(), true, true);
        assert_eq!(filter.classify("classic car"), Verdict::Blocked);
    }

    #[test]
    fn disabled_filter_always_allows() {
        let f = terms_file(&["badword"]);
        let filter = Filter::load(f.path(), false, false);
        assert_eq!(filter.classify("badword badword"), Verdict::Allowed);
    }

    #[test]
    fn missing_file_is_fail_safe_blocked() {
        let filter = Filter::load(Path::new("/nonexistent/path/terms.txt"), false, true);
        assert!(filter.is_degraded());
        assert_eq!(filter.classify("literally anything"), Verdict::Blocked);
        assert_eq!(filter.classify(""), Verdict::Blocked);
    }

    #[test]
    fn reload_clears_degraded_state() {
        let mut filter = Filter::load(Path::new("/nonexistent/path/terms.txt"), false, true);
        assert!(filter.is_degraded());
        let f = terms_file(&["badword"]);
        filter.reload(f.path());
        assert!(!filter.is_degraded());
        assert_eq!(filter.classify("hello"), Verdict::Allowed);
    }

    #[test]
    fn classify_is_idempotent_under_normalization() {
        let f = terms_file(&["hello"]);
        let filter = Filter::load(f.path(), false, true);
        let x = "H3ll0!!!";
        assert_eq!(filter.classify(x), filter.classify(&normalize(x)));
    }
}
