use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::foundation::error::{ZoetropeError, ZoetropeResult};

/// Loop count beyond the first pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Loops {
    Finite(u32),
    Infinite,
}

impl Default for Loops {
    fn default() -> Self {
        Self::Finite(0)
    }
}

impl From<i64> for Loops {
    fn from(n: i64) -> Self {
        if n < 0 {
            Self::Infinite
        } else {
            Self::Finite(n.min(u32::MAX as i64) as u32)
        }
    }
}

impl From<Loops> for i64 {
    fn from(l: Loops) -> Self {
        match l {
            Loops::Finite(n) => i64::from(n),
            Loops::Infinite => -1,
        }
    }
}

/// Playback options shared by tweens and timelines.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TweenConfig {
    pub loops: Loops,
    /// Play each pass backward.
    pub reversed: bool,
    /// Alternate direction on every other loop pass.
    pub bounce: bool,
    pub time_scale: f64,
    /// Advance one unit per heartbeat instead of by elapsed time.
    pub use_ticks: bool,
    pub ignore_global_pause: bool,
    pub paused: bool,
    /// Pause the target's other active tweens at registration.
    pub override_target: bool,
    /// Initial seek applied at registration.
    pub position: Option<f64>,
}

impl Default for TweenConfig {
    fn default() -> Self {
        Self {
            loops: Loops::default(),
            reversed: false,
            bounce: false,
            time_scale: 1.0,
            use_ticks: false,
            ignore_global_pause: false,
            paused: false,
            override_target: false,
            position: None,
        }
    }
}

/// Decision produced by [`Playhead::prepare_seek`] before side effects run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SeekOutcome {
    /// The playhead would not move. `ended` still reports whether it sits
    /// past the final loop.
    NoChange { ended: bool },
    Apply {
        /// Position within the current pass, direction already applied.
        position: f64,
        /// Normalized total position to commit.
        raw: f64,
        ended: bool,
    },
}

/// Range of same-pass positions whose actions fire, in travel order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActionRange {
    pub start: f64,
    pub end: f64,
    pub include_start: bool,
}

/// Time state of one tween or timeline.
///
/// `raw_position` counts total travel across loops and starts at -1, the
/// never-updated sentinel; `position` is the in-pass playhead with loop
/// direction already applied.
#[derive(Clone, Debug)]
pub struct Playhead {
    pub duration: f64,
    pub loops: Loops,
    pub reversed: bool,
    pub bounce: bool,
    pub time_scale: f64,
    pub use_ticks: bool,
    pub ignore_global_pause: bool,
    pub paused: bool,
    pub position: f64,
    pub raw_position: f64,
    labels: BTreeMap<String, f64>,
}

impl Playhead {
    pub fn new(config: &TweenConfig) -> Self {
        Self {
            duration: 0.0,
            loops: config.loops,
            reversed: config.reversed,
            bounce: config.bounce,
            time_scale: config.time_scale,
            use_ticks: config.use_ticks,
            ignore_global_pause: config.ignore_global_pause,
            paused: config.paused,
            position: 0.0,
            raw_position: -1.0,
            labels: BTreeMap::new(),
        }
    }

    /// Whether the playhead has consumed its final loop pass.
    pub fn ended(&self) -> bool {
        match self.loops {
            Loops::Infinite => false,
            Loops::Finite(lc) => {
                self.raw_position >= f64::from(lc) * self.duration + self.duration
            }
        }
    }

    /// Normalize a seek target without committing it.
    pub fn prepare_seek(&self, raw_position: f64) -> SeekOutcome {
        let d = self.duration;
        let prev_raw = self.raw_position;
        let mut raw = raw_position.max(0.0);

        if d == 0.0 {
            if prev_raw != -1.0 {
                return SeekOutcome::NoChange { ended: true };
            }
            return SeekOutcome::Apply {
                position: 0.0,
                raw,
                ended: true,
            };
        }

        let mut lp = (raw / d).trunc();
        let mut t = raw - lp * d;

        let ended = match self.loops {
            Loops::Finite(lc) => raw >= f64::from(lc) * d + d,
            Loops::Infinite => false,
        };
        if ended {
            if let Loops::Finite(lc) = self.loops {
                lp = f64::from(lc);
            }
            t = d;
            raw = lp * d + d;
        }
        if raw == prev_raw {
            return SeekOutcome::NoChange { ended };
        }

        let rev = self.reversed != (self.bounce && lp % 2.0 != 0.0);
        let position = if rev { d - t } else { t };
        SeekOutcome::Apply {
            position,
            raw,
            ended,
        }
    }

    /// In-pass position a given raw position maps to, with loop direction
    /// applied. Pure variant of the seek math for read-only queries.
    pub fn calculate_position(&self, raw_position: f64) -> f64 {
        let d = self.duration;
        if d == 0.0 {
            return 0.0;
        }

        let mut lp = 0.0;
        let mut t = 0.0;
        let past_end = match self.loops {
            Loops::Finite(lc) => raw_position >= f64::from(lc) * d + d,
            Loops::Infinite => false,
        };
        if past_end {
            if let Loops::Finite(lc) = self.loops {
                lp = f64::from(lc);
            }
            t = d;
        } else if raw_position >= 0.0 {
            lp = (raw_position / d).trunc();
            t = raw_position - lp * d;
        }

        let rev = self.reversed != (self.bounce && lp % 2.0 != 0.0);
        if rev { d - t } else { t }
    }

    /// Decompose a raw-position travel into per-pass action ranges, in
    /// execution order. A jump collapses to the landing position only.
    pub fn plan_action_ranges(
        &self,
        start_raw: f64,
        end_raw: f64,
        jump: bool,
        include_start: bool,
    ) -> Vec<ActionRange> {
        let d = self.duration;
        let mut reversed = self.reversed;
        let mut bounce = self.bounce;

        let (mut loop0, mut t0, mut loop1, mut t1);
        if d == 0.0 {
            loop0 = 0.0;
            loop1 = 0.0;
            t0 = 0.0;
            t1 = 0.0;
            reversed = false;
            bounce = false;
        } else {
            // A fresh playhead's sentinel start counts as "just before 0"
            // so position-0 actions fire on the first advance.
            if start_raw < 0.0 {
                loop0 = 0.0;
                t0 = -1.0;
            } else {
                loop0 = (start_raw / d).trunc();
                t0 = start_raw - loop0 * d;
            }
            loop1 = (end_raw / d).trunc();
            t1 = end_raw - loop1 * d;
        }

        if let Loops::Finite(lc) = self.loops {
            let lc = f64::from(lc);
            if loop1 > lc {
                t1 = d;
                loop1 = lc;
            }
            if loop0 > lc {
                t0 = d;
                loop0 = lc;
            }
        }

        if jump {
            return vec![ActionRange {
                start: t1,
                end: t1,
                include_start,
            }];
        }
        if loop0 == loop1 && t0 == t1 && !include_start {
            return Vec::new();
        }

        let dir = start_raw <= end_raw;
        let mut ranges = Vec::new();
        let mut lp = loop0;
        let mut include = include_start;
        loop {
            let rev = reversed != (bounce && lp % 2.0 != 0.0);
            let mut start = if lp == loop0 {
                t0
            } else if dir {
                0.0
            } else {
                d
            };
            let mut end = if lp == loop1 {
                t1
            } else if dir {
                d
            } else {
                0.0
            };
            if rev {
                start = d - start;
                end = d - end;
            }

            // A bounce pivots in place; do not re-run the pivot position.
            if !(bounce && lp != loop0 && start == end) {
                ranges.push(ActionRange {
                    start,
                    end,
                    include_start: include || (lp != loop0 && !bounce),
                });
            }
            include = false;

            if dir {
                lp += 1.0;
                if lp > loop1 {
                    break;
                }
            } else {
                lp -= 1.0;
                if lp < loop1 {
                    break;
                }
            }
        }
        ranges
    }

    pub fn add_label(&mut self, name: impl Into<String>, position: f64) {
        self.labels.insert(name.into(), position);
    }

    pub fn label_position(&self, name: &str) -> Option<f64> {
        self.labels.get(name).copied()
    }

    /// Label at or before the current position, if any.
    pub fn current_label(&self) -> Option<&str> {
        self.labels
            .iter()
            .filter(|(_, pos)| **pos <= self.position)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, _)| name.as_str())
    }

    pub fn labels(&self) -> &BTreeMap<String, f64> {
        &self.labels
    }

    /// Resolve a position-or-label seek argument.
    pub fn resolve_position(&self, target: &PositionOrLabel) -> ZoetropeResult<f64> {
        match target {
            PositionOrLabel::Position(p) => Ok(*p),
            PositionOrLabel::Label(name) => self.label_position(name).ok_or_else(|| {
                ZoetropeError::animation(format!("unknown label '{name}'"))
            }),
        }
    }
}

/// Seek argument: an explicit position or a named label.
#[derive(Clone, Debug, PartialEq)]
pub enum PositionOrLabel {
    Position(f64),
    Label(String),
}

impl From<f64> for PositionOrLabel {
    fn from(p: f64) -> Self {
        Self::Position(p)
    }
}

impl From<&str> for PositionOrLabel {
    fn from(name: &str) -> Self {
        Self::Label(name.to_owned())
    }
}
