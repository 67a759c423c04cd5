use intent_ledger_domain::{LedgerError, LedgerResult};
use regex::Regex;

/// Include/exclude glob filter over repository-relative paths.
///
/// `**` spans directories, `*` and `?` stay within one path segment. A pattern
/// without wildcards names a file or a directory and covers everything below it.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    /// Compile both pattern lists.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an empty or uncompilable pattern.
    pub fn new(include: &[String], exclude: &[String]) -> LedgerResult<Self> {
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
        })
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        let included =
            self.include.is_empty() || self.include.iter().any(|re| re.is_match(path));
        included && !self.exclude.iter().any(|re| re.is_match(path))
    }
}

fn compile_all(patterns: &[String]) -> LedgerResult<Vec<Regex>> {
    patterns.iter().map(|pattern| compile_glob(pattern)).collect()
}

fn compile_glob(pattern: &str) -> LedgerResult<Regex> {
    let pattern = pattern.trim().trim_start_matches("./").trim_end_matches('/');
    if pattern.is_empty() {
        return Err(LedgerError::validation("path filter patterns must be non-empty"));
    }

    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        match chars[index] {
            '*' if chars.get(index + 1) == Some(&'*') => {
                index += 1;
                if chars.get(index + 1) == Some(&'/') {
                    // `**/` also matches zero directories.
                    index += 1;
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        index += 1;
    }
    if !pattern.contains(['*', '?']) {
        out.push_str("(?:/.*)?");
    }
    out.push('$');

    Regex::new(&out)
        .map_err(|err| LedgerError::Validation(format!("invalid path filter '{pattern}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::PathFilter;

    fn filter(include: &[&str], exclude: &[&str]) -> PathFilter {
        let include: Vec<String> = include.iter().map(ToString::to_string).collect();
        let exclude: Vec<String> = exclude.iter().map(ToString::to_string).collect();
        let built = PathFilter::new(&include, &exclude);
        assert!(built.is_ok());
        built.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn empty_filter_accepts_everything() {
        assert!(filter(&[], &[]).matches("src/anything.test.ts"));
    }

    #[test]
    fn globs_respect_segments() {
        let f = filter(&["src/*.test.ts"], &[]);
        assert!(f.matches("src/cart.test.ts"));
        assert!(!f.matches("src/nested/cart.test.ts"));

        let deep = filter(&["src/**/*.test.ts"], &[]);
        assert!(deep.matches("src/cart.test.ts"));
        assert!(deep.matches("src/a/b/cart.test.ts"));
        assert!(!deep.matches("lib/cart.test.ts"));
    }

    #[test]
    fn exclude_wins_and_directories_cover_children() {
        let f = filter(&["src"], &["src/legacy"]);
        assert!(f.matches("src/cart.test.ts"));
        assert!(!f.matches("src/legacy/old.test.ts"));
        assert!(!f.matches("tests/e2e.test.ts"));
        assert!(f.matches("./src/cart.test.ts"));
    }

    #[test]
    fn single_star_does_not_reach_nested_directories() {
        let f = filter(&["src/*"], &[]);
        assert!(f.matches("src/a.ts"));
        assert!(!f.matches("src/nested/deep.ts"));

        let dir = filter(&["src/"], &["src/*.snap"]);
        assert!(dir.matches("src/a/b.ts"));
        assert!(dir.matches("src/a/b.snap"));
        assert!(!dir.matches("src/b.snap"));

        let deep = filter(&["auth/**"], &[]);
        assert!(deep.matches("auth/login.test.ts"));
        assert!(deep.matches("auth/flows/sso.test.ts"));
        assert!(!deep.matches("authz/login.test.ts"));
    }

    #[test]
    fn empty_patterns_are_rejected() {
        assert!(PathFilter::new(&[" ".to_string()], &[]).is_err());
    }
}
