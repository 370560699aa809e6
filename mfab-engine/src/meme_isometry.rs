//! Meme isometry: similarity between two sets of meme tags
//!
//! Memes are compared after normalization (trimmed, upper-case). A meme written
//! `!X` is an anti-meme: it conflicts with `X` in the other set.

use mfab_common::models::normalize_meme;
use std::collections::BTreeSet;

const ANTI_PREFIX: char = '!';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemeIsometry {
    sources: BTreeSet<String>,
}

impl MemeIsometry {
    pub fn of<I, S>(memes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sources: memes
                .into_iter()
                .map(|m| normalize_meme(m.as_ref()))
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Number of distinct target memes also present in the source set
    pub fn score<S: AsRef<str>>(&self, targets: &[S]) -> usize {
        targets
            .iter()
            .map(|t| normalize_meme(t.as_ref()))
            .collect::<BTreeSet<_>>()
            .iter()
            .filter(|t| self.sources.contains(*t))
            .count()
    }

    /// False if either set carries an anti-meme of a meme in the other
    pub fn is_allowed<S: AsRef<str>>(&self, targets: &[S]) -> bool {
        let targets: BTreeSet<String> = targets.iter().map(|t| normalize_meme(t.as_ref())).collect();
        !conflicts(&self.sources, &targets) && !conflicts(&targets, &self.sources)
    }
}

/// Whether `anti` holds `!X` for some `X` in `memes`
fn conflicts(anti: &BTreeSet<String>, memes: &BTreeSet<String>) -> bool {
    anti.iter()
        .filter_map(|m| m.strip_prefix(ANTI_PREFIX))
        .any(|m| memes.contains(m))
}
