//! Weighted candidate selection for craft choices
//!
//! Each candidate's score is its meme isometry times [`SCORE_MATCH`], plus
//! bonuses and penalties. At pick time a small random jitter (below one match)
//! is added so equal scores are broken at random while any real difference in
//! meme overlap still wins.

use rand::Rng;

pub const SCORE_MATCH: f64 = 1_000.0;
pub const SCORE_AVOID: f64 = -2_000.0;
pub const SCORE_DIRECT: f64 = 10_000.0;
/// Jitter range; must stay below [`SCORE_MATCH`]
pub const SCORE_ENTROPY: f64 = 0.5;

struct Candidate<T> {
    item: T,
    label: String,
    score: f64,
}

pub struct ScorePicker<T> {
    candidates: Vec<Candidate<T>>,
    entropy: f64,
}

impl<T: Clone> ScorePicker<T> {
    pub fn new() -> Self {
        Self {
            candidates: Vec::new(),
            entropy: SCORE_ENTROPY,
        }
    }

    pub fn add(&mut self, item: T, label: impl Into<String>, score: f64) {
        self.candidates.push(Candidate {
            item,
            label: label.into(),
            score,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Highest jittered score wins; `None` when empty
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<T> {
        let mut best: Option<(&Candidate<T>, f64)> = None;
        for candidate in &self.candidates {
            let jittered = candidate.score + rng.gen_range(0.0..self.entropy);
            if best.map_or(true, |(_, s)| jittered > s) {
                best = Some((candidate, jittered));
            }
        }
        best.map(|(c, _)| c.item.clone())
    }

    /// Candidates and base scores, best first, e.g. `Deep=1000, Bright=0`
    pub fn report(&self) -> String {
        let mut rows: Vec<&Candidate<T>> = self.candidates.iter().collect();
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        rows.iter()
            .map(|c| format!("{}={}", c.label, c.score))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl<T: Clone> Default for ScorePicker<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_higher_score_always_wins() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut picker = ScorePicker::new();
        picker.add("a", "A", SCORE_MATCH);
        picker.add("b", "B", 0.0);
        for _ in 0..100 {
            assert_eq!(picker.pick(&mut rng), Some("a"));
        }
    }

    #[test]
    fn test_ties_are_broken_at_random() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut picker = ScorePicker::new();
        picker.add(0usize, "A", 0.0);
        picker.add(1usize, "B", 0.0);
        let mut counts = [0usize; 2];
        for _ in 0..200 {
            counts[picker.pick(&mut rng).unwrap()] += 1;
        }
        assert!(counts[0] > 0 && counts[1] > 0);
    }

    #[test]
    fn test_empty_and_report() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut picker: ScorePicker<u8> = ScorePicker::new();
        assert_eq!(picker.pick(&mut rng), None);
        picker.add(1, "Low", SCORE_AVOID);
        picker.add(2, "High", SCORE_DIRECT);
        assert_eq!(picker.report(), "High=10000, Low=-2000");
        assert_eq!(picker.len(), 2);
    }
}
