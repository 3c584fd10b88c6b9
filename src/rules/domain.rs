//! Domain list matching
//!
//! A [`DomainSet`] answers one question: does a host name match any of the
//! configured criteria? Four criteria are supported:
//!
//! - **exact**: whole-name equality, hash lookup
//! - **suffix**: the name or any parent domain equals the suffix
//!   (`example.com` matches `example.com` and `ads.example.com`, not
//!   `badexample.com`)
//! - **keyword**: substring, one Aho-Corasick pass over the name
//! - **regex**: any of a `RegexSet`
//!
//! Everything is compiled once at configuration load. Matching is
//! case-insensitive and ignores a trailing dot.
//!
//! ```
//! use intercept_proxy::rules::DomainSet;
//!
//! let set = DomainSet::builder()
//!     .add_suffix("doubleclick.net")
//!     .add_keyword("tracker")
//!     .build()
//!     .unwrap();
//!
//! assert!(set.matches("stats.g.doubleclick.net"));
//! assert!(set.matches("my-tracker.example"));
//! assert!(!set.matches("example.com"));
//! ```

use std::collections::HashSet;

use aho_corasick::AhoCorasick;
use regex::RegexSet;

use crate::error::ConfigError;

/// Compiled set of domain criteria
#[derive(Debug, Clone)]
pub struct DomainSet {
    exact: HashSet<String>,
    suffixes: HashSet<String>,
    keywords: Option<AhoCorasick>,
    regexes: Option<RegexSet>,
    len: usize,
}

impl DomainSet {
    /// Start building a set
    #[must_use]
    pub fn builder() -> DomainSetBuilder {
        DomainSetBuilder::default()
    }

    /// Whether `domain` matches any criterion
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        if domain.is_empty() {
            return false;
        }

        if self.exact.contains(&domain) {
            return true;
        }

        if !self.suffixes.is_empty() {
            let mut candidate = domain.as_str();
            loop {
                if self.suffixes.contains(candidate) {
                    return true;
                }
                match candidate.split_once('.') {
                    Some((_, parent)) => candidate = parent,
                    None => break,
                }
            }
        }

        if self.keywords.as_ref().is_some_and(|ac| ac.is_match(&domain)) {
            return true;
        }

        self.regexes.as_ref().is_some_and(|set| set.is_match(&domain))
    }

    /// Total number of criteria
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the set has no criteria
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Builder for [`DomainSet`]
#[derive(Debug, Default, Clone)]
pub struct DomainSetBuilder {
    exact: Vec<String>,
    suffix: Vec<String>,
    keyword: Vec<String>,
    regex: Vec<String>,
}

impl DomainSetBuilder {
    /// Match this exact name
    #[must_use]
    pub fn add_exact(mut self, domain: impl AsRef<str>) -> Self {
        self.exact.push(normalize(domain.as_ref()));
        self
    }

    /// Match this domain and all of its subdomains
    #[must_use]
    pub fn add_suffix(mut self, suffix: impl AsRef<str>) -> Self {
        let suffix = normalize(suffix.as_ref());
        self.suffix.push(suffix.trim_start_matches('.').to_string());
        self
    }

    /// Match names containing this substring
    #[must_use]
    pub fn add_keyword(mut self, keyword: impl AsRef<str>) -> Self {
        self.keyword.push(keyword.as_ref().to_ascii_lowercase());
        self
    }

    /// Match names against this regular expression
    #[must_use]
    pub fn add_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex.push(pattern.into());
        self
    }

    /// Compile the set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a regex does not compile.
    pub fn build(self) -> Result<DomainSet, ConfigError> {
        let len = self.exact.len() + self.suffix.len() + self.keyword.len() + self.regex.len();

        let keywords = if self.keyword.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&self.keyword)
                    .map_err(|e| ConfigError::validation(format!("keyword automaton: {e}")))?,
            )
        };

        let regexes = if self.regex.is_empty() {
            None
        } else {
            Some(
                RegexSet::new(&self.regex)
                    .map_err(|e| ConfigError::validation(format!("invalid domain regex: {e}")))?,
            )
        };

        Ok(DomainSet {
            exact: self.exact.into_iter().collect(),
            suffixes: self.suffix.into_iter().collect(),
            keywords,
            regexes,
            len,
        })
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}
