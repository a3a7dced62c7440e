//! Static denylist of dangerous command text.
//!
//! This check runs before any permission lookup and cannot be bypassed by
//! an override or an approval.

use regex::Regex;

/// Ordered (pattern, reason) pairs. The first match wins.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"&\s*$", "Backgrounding not supported"),
    (r"\|\s*(bash|sh|zsh|fish)", "Piping to shells is blocked"),
    (r">\s*/dev/(null|zero|random|urandom)", "Dangerous redirection to devices"),
    (r"rm\s+-rf\s+/", "Recursive delete from root is blocked"),
    (r":\(\)\s*\{.*:\|:", "Fork bomb pattern"),
    (r"dd\s+.*of=/dev/[sh]d", "Direct disk write attempt"),
    (r"curl.*\|\s*(bash|sh)", "Download+execute blocked"),
    (r"wget.*\|\s*(bash|sh)", "Download+execute blocked"),
];

pub struct DangerPatternFilter {
    patterns: Vec<(Regex, &'static str)>,
}

impl DangerPatternFilter {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = DANGEROUS_PATTERNS
            .iter()
            .map(|(pattern, reason)| Ok((Regex::new(pattern)?, *reason)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { patterns })
    }

    /// Returns the reason of the first pattern found in `command`.
    pub fn matches(&self, command: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(command))
            .map(|(_, reason)| *reason)
    }
}
