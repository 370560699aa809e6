//! Seconds elapsed at a beat position under a linear tempo ramp
//!
//! Tempo moves linearly from the previous segment's tempo at beat 0 to this
//! segment's tempo at its final beat, so consecutive segments join without an
//! audible step in tempo.

/// Integration step in beats
pub const STEP_BEATS: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeComputer {
    total_beats: f64,
    from_tempo: f64,
    to_tempo: f64,
}

impl TimeComputer {
    /// `from_tempo` is the previous segment's tempo (equal to `to_tempo` for an initial segment)
    pub fn new(total_beats: f64, from_tempo: f64, to_tempo: f64) -> Self {
        Self {
            total_beats,
            from_tempo,
            to_tempo,
        }
    }

    /// Beats per minute at a position
    pub fn tempo_at(&self, position: f64) -> f64 {
        if self.total_beats <= 0.0 {
            return self.to_tempo;
        }
        let ratio = (position / self.total_beats).clamp(0.0, 1.0);
        self.from_tempo + (self.to_tempo - self.from_tempo) * ratio
    }

    /// Integrate seconds-per-beat from 0 to `position`
    ///
    /// Midpoint rule on fixed steps; the last step is shortened to land exactly
    /// on `position`. Non-positive positions yield zero.
    pub fn seconds_at_position(&self, position: f64) -> f64 {
        let mut seconds = 0.0;
        let mut beat = 0.0;
        while beat < position {
            let step = STEP_BEATS.min(position - beat);
            let tempo = self.tempo_at(beat + step / 2.0);
            if tempo > 0.0 {
                seconds += step * 60.0 / tempo;
            }
            beat += step;
        }
        seconds
    }
}
