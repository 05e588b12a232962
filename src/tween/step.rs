use crate::tween::ease::Ease;
use crate::tween::props::{TargetId, TweenProps};
use crate::tween::registry::{ActionCtx, TweenId};

/// One segment of a tween's property track.
///
/// `props` is the snapshot at the segment's END; interpolation reads the
/// previous segment's snapshot for start values. Index 0 is the head, a
/// zero-duration segment holding the captured start values.
#[derive(Clone, Debug)]
pub struct TweenStep {
    /// Position on the tween's own timeline where the segment starts.
    pub t: f64,
    pub d: f64,
    pub props: TweenProps,
    pub ease: Ease,
    /// Passive segments write nothing, leaving the target to other owners.
    pub passive: bool,
}

pub type ActionFn = Box<dyn FnMut(&mut ActionCtx<'_>)>;

pub enum ActionKind {
    /// Invoke arbitrary work with engine access.
    Call(ActionFn),
    /// Write properties onto a target (the tween's own unless overridden).
    Set {
        props: TweenProps,
        target: Option<TargetId>,
    },
    /// Unpause a tween (the owning tween when `None`).
    Play(Option<TweenId>),
    /// Pause a tween (the owning tween when `None`).
    Pause(Option<TweenId>),
}

impl std::fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call(_) => f.write_str("Call"),
            Self::Set { props, target } => f
                .debug_struct("Set")
                .field("props", props)
                .field("target", target)
                .finish(),
            Self::Play(id) => f.debug_tuple("Play").field(id).finish(),
            Self::Pause(id) => f.debug_tuple("Pause").field(id).finish(),
        }
    }
}

#[derive(Debug)]
pub struct TweenAction {
    /// Position on the tween's own timeline.
    pub t: f64,
    pub kind: ActionKind,
}

/// Index of the step active at `pos`, reusing the index from the previous
/// lookup as a starting point. `None` when only the head exists.
pub fn find_step(steps: &[TweenStep], pos: f64, hint: usize) -> Option<usize> {
    if steps.len() < 2 {
        return None;
    }
    let mut i = hint.clamp(1, steps.len() - 1);
    if steps[i].t > pos {
        i = 1;
    }
    while i + 1 < steps.len() && steps[i + 1].t <= pos {
        i += 1;
    }
    Some(i)
}

/// Indices of the actions hit when the playhead travels `start_pos` to
/// `end_pos`, in execution order. The travel destination always fires; the
/// origin fires only with `include_start`. Equal timestamps run in
/// insertion order going forward and reversed going backward.
pub fn actions_in_range(
    actions: &[TweenAction],
    start_pos: f64,
    end_pos: f64,
    include_start: bool,
) -> Vec<usize> {
    let rev = start_pos > end_pos;
    let (lo, hi) = if rev {
        (end_pos, start_pos)
    } else {
        (start_pos, end_pos)
    };
    let hit = |pos: f64| {
        pos == end_pos || (pos > lo && pos < hi) || (include_start && pos == start_pos)
    };
    if rev {
        (0..actions.len())
            .rev()
            .filter(|&i| hit(actions[i].t))
            .collect()
    } else {
        (0..actions.len()).filter(|&i| hit(actions[i].t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(t: f64, d: f64) -> TweenStep {
        TweenStep {
            t,
            d,
            props: TweenProps::new(),
            ease: Ease::Linear,
            passive: false,
        }
    }

    fn action(t: f64) -> TweenAction {
        TweenAction {
            t,
            kind: ActionKind::Play(None),
        }
    }

    #[test]
    fn find_step_picks_later_segment_at_boundaries() {
        let steps = vec![step(0.0, 0.0), step(0.0, 100.0), step(100.0, 50.0)];
        assert_eq!(find_step(&steps, 0.0, 1), Some(1));
        assert_eq!(find_step(&steps, 99.9, 1), Some(1));
        assert_eq!(find_step(&steps, 100.0, 1), Some(2));
        assert_eq!(find_step(&steps, 150.0, 1), Some(2));
    }

    #[test]
    fn find_step_recovers_from_a_stale_hint() {
        let steps = vec![step(0.0, 0.0), step(0.0, 100.0), step(100.0, 50.0)];
        assert_eq!(find_step(&steps, 10.0, 2), Some(1));
        assert_eq!(find_step(&steps, 10.0, 999), Some(1));
        assert_eq!(find_step(&[step(0.0, 0.0)], 10.0, 0), None);
    }

    #[test]
    fn range_includes_destination_but_not_origin() {
        let actions = vec![action(10.0), action(20.0), action(30.0)];
        assert_eq!(actions_in_range(&actions, 5.0, 25.0, false), vec![0, 1]);
        assert_eq!(actions_in_range(&actions, 10.0, 25.0, false), vec![1]);
        assert_eq!(actions_in_range(&actions, 10.0, 25.0, true), vec![0, 1]);
        assert_eq!(actions_in_range(&actions, 5.0, 30.0, false), vec![0, 1, 2]);
    }

    #[test]
    fn backward_travel_reverses_execution_order() {
        let actions = vec![action(10.0), action(20.0), action(30.0)];
        assert_eq!(actions_in_range(&actions, 25.0, 5.0, false), vec![1, 0]);
        assert_eq!(actions_in_range(&actions, 30.0, 10.0, false), vec![0]);
        assert_eq!(actions_in_range(&actions, 30.0, 10.0, true), vec![2, 0]);
    }

    #[test]
    fn zero_length_travel_fires_only_the_landing_position() {
        let actions = vec![action(10.0), action(20.0)];
        assert_eq!(actions_in_range(&actions, 20.0, 20.0, false), vec![1]);
        assert_eq!(actions_in_range(&actions, 15.0, 15.0, false), Vec::<usize>::new());
    }
}
