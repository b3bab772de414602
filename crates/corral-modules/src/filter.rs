//! Candidate filtering: blocklist patterns and localisation pruning.

use std::collections::BTreeSet;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Tracing target for filter decisions.
const FILTER_TARGET: &str = "corral_modules::filter";

/// Marker segment identifying a localisation module.
const LOCALISATION_MARKER: &str = "l10n";

/// Errors raised while building a filter configuration.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A blocklist entry is not a valid regular expression.
    #[error("invalid blocklist pattern '{pattern}': {source}")]
    Pattern {
        /// Offending pattern.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// Compiled filter applied to every discovered module candidate.
#[derive(Debug)]
pub struct FilterConfig {
    blocklist: Vec<Regex>,
    countries: BTreeSet<String>,
}

impl FilterConfig {
    /// Compiles blocklist patterns and derives the allowed country codes
    /// from the configured language list.
    ///
    /// A language of the form `ll_CC` contributes the lowercase `cc`
    /// country code; bare languages such as `en` contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Pattern`] for the first pattern that fails to
    /// compile.
    pub fn new(blocklist: &[String], languages: &[String]) -> Result<Self, FilterError> {
        let blocklist = blocklist
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| FilterError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let countries = languages
            .iter()
            .filter_map(|language| language.split('_').nth(1))
            .map(str::to_lowercase)
            .collect();
        Ok(Self {
            blocklist,
            countries,
        })
    }

    /// Whether a candidate survives both filters.
    #[must_use]
    pub fn permits(&self, name: &str) -> bool {
        if self
            .blocklist
            .iter()
            .any(|pattern| pattern.is_match(name))
        {
            debug!(target: FILTER_TARGET, module = name, "dropped by blocklist");
            return false;
        }
        if !self.matches_localisation(name) {
            debug!(target: FILTER_TARGET, module = name, "dropped by localisation filter");
            return false;
        }
        true
    }

    /// Localisation rule: a name carrying the `l10n` marker with at least
    /// one two-letter lowercase segment is kept only when one such segment
    /// is an allowed country code. Everything else passes untouched.
    fn matches_localisation(&self, name: &str) -> bool {
        let segments: Vec<&str> = name.split('_').collect();
        if !segments.contains(&LOCALISATION_MARKER) {
            return true;
        }
        let mut saw_country_segment = false;
        for segment in &segments {
            if segment.len() == 2 && segment.chars().all(|c| c.is_ascii_lowercase()) {
                saw_country_segment = true;
                if self.countries.contains(*segment) {
                    return true;
                }
            }
        }
        !saw_country_segment
    }
}
