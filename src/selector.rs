//! Keyword filtering of grouped sequences.
//!
//! Selection is a two stage pipeline over each group's label: the exclude
//! stage runs first, then the keyword stage keeps what matches. Matching is
//! case-insensitive substring containment. Groups without a textual label
//! are never selected.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use crate::grouper::{SequenceGroups, SequenceKey};

/// Noise sequences excluded unless the caller says otherwise.
pub const DEFAULT_EXCLUDE: &[&str] = &["localizer", "moco"];

pub type SelectedSequences = BTreeMap<SequenceKey, Vec<PathBuf>>;

fn contains_any(label: &str, terms: &[String]) -> bool {
    let label = label.to_uppercase();
    terms.iter().any(|term| label.contains(&term.to_uppercase()))
}

/// An empty term list behaves as if no list was given.
fn normalized(terms: Option<Vec<String>>) -> Option<Vec<String>> {
    terms.filter(|terms| !terms.is_empty())
}

#[derive(Clone, Debug, Default)]
pub struct SequenceSelector {
    keywords: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

impl SequenceSelector {
    pub fn new(keywords: Option<Vec<String>>, exclude: Option<Vec<String>>) -> Self {
        Self {
            keywords: normalized(keywords),
            exclude: normalized(exclude),
        }
    }

    /// Drops every labelled group whose label contains an exclude term.
    pub fn exclude_stage(&self, groups: SequenceGroups) -> SequenceGroups {
        let Some(exclude) = &self.exclude else {
            return groups;
        };
        groups
            .into_iter()
            .filter(|(key, _)| match key.label() {
                Some(label) => {
                    let dropped = contains_any(label, exclude);
                    if dropped {
                        debug!(%key, "excluded");
                    }
                    !dropped
                }
                None => true,
            })
            .collect()
    }

    /// Keeps groups whose label contains a keyword.
    pub fn keyword_stage(&self, groups: SequenceGroups) -> SequenceGroups {
        let Some(keywords) = &self.keywords else {
            return groups;
        };
        groups
            .into_iter()
            .filter(|(key, _)| key.label().is_some_and(|label| contains_any(label, keywords)))
            .collect()
    }

    /// Runs both stages and strips the headers, leaving ordered file paths.
    pub fn select(&self, groups: SequenceGroups) -> SelectedSequences {
        self.keyword_stage(self.exclude_stage(groups))
            .into_iter()
            .filter(|(key, _)| key.label().is_some())
            .map(|(key, records)| {
                let paths = records.into_iter().map(|record| record.path).collect();
                (key, paths)
            })
            .collect()
    }
}
