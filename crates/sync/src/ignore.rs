//! `.quireignore`: paths a repository keeps out of the book collection.

use glob::{MatchOptions, Pattern};

/// Name of the ignore file at the repository root.
pub const IGNORE_FILE: &str = ".quireignore";

const OPTIONS: MatchOptions =
    MatchOptions { case_sensitive: true, require_literal_separator: true, require_literal_leading_dot: false };

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    negated: bool,
    /// Matches directories only (pattern ended in `/`).
    directory: bool,
    /// Matches against the full path rather than any path component.
    anchored: bool,
}

impl Rule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (negated, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (directory, line) = match line.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let anchored = line.contains('/');
        let line = line.trim_start_matches('/');
        match Pattern::new(line) {
            Ok(pattern) => Some(Self { pattern, negated, directory, anchored }),
            Err(err) => {
                tracing::warn!(pattern = line, error = %err, "skipping invalid ignore pattern");
                None
            },
        }
    }

    fn matches(&self, path: &str) -> bool {
        let components: Vec<&str> = path.split('/').collect();
        let last = components.len() - 1;
        match self.anchored {
            // Every directory prefix, then the file itself.
            true => (0..components.len())
                .filter(|&i| !self.directory || i < last)
                .any(|i| self.pattern.matches_with(&components[..=i].join("/"), OPTIONS)),
            false => components
                .iter()
                .enumerate()
                .filter(|&(i, _)| !self.directory || i < last)
                .any(|(_, component)| self.pattern.matches_with(component, OPTIONS)),
        }
    }
}

/// Glob rules, one per line, in the spirit of `.gitignore`.
///
/// Blank lines and lines starting with `#` are skipped. A leading `!` re-includes
/// what an earlier rule excluded, and the last matching rule wins. A trailing
/// `/` only matches directories. Patterns containing a `/` match from the
/// repository root, others match any single path component.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    pub fn parse(content: &str) -> Self {
        Self { rules: content.lines().filter_map(Rule::parse).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the `/`-separated repository path is ignored.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.rules.iter().rev().find(|rule| rule.matches(path)).is_some_and(|rule| !rule.negated)
    }
}
