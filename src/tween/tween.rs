use std::collections::{BTreeMap, BTreeSet};

use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::tween::core::TweenConfig;
use crate::tween::ease::Ease;
use crate::tween::plugin::{PluginCtx, PluginInit, PluginSet};
use crate::tween::props::{PropValue, TargetId, TweenHost, TweenProps};
use crate::tween::registry::{ActionCtx, TweenId};
use crate::tween::step::{ActionKind, TweenAction, TweenStep};

/// Lifecycle notification delivered to a tween's event handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TweenEvent {
    /// The playhead moved.
    Change,
    /// The final loop pass finished.
    Complete,
}

pub type EventFn = Box<dyn FnMut(&mut ActionCtx<'_>, TweenEvent)>;

struct StepEntry {
    d: f64,
    /// `None` marks a wait.
    props: Option<TweenProps>,
    ease: Ease,
    passive: bool,
}

/// Builder recording a property script against one target.
///
/// Steps and actions are positioned as they are appended; registration with
/// [`Tweens`](crate::tween::registry::Tweens) resolves start values and
/// freezes the script.
pub struct Tween {
    target: Option<TargetId>,
    config: TweenConfig,
    entries: Vec<StepEntry>,
    actions: Vec<(f64, ActionKind)>,
    labels: Vec<(String, f64)>,
    end: f64,
    handler: Option<EventFn>,
}

impl Tween {
    pub fn new(target: impl Into<Option<TargetId>>) -> Self {
        Self {
            target: target.into(),
            config: TweenConfig::default(),
            entries: Vec::new(),
            actions: Vec::new(),
            labels: Vec::new(),
            end: 0.0,
            handler: None,
        }
    }

    pub fn with_config(mut self, config: TweenConfig) -> Self {
        self.config = config;
        self
    }

    /// Hold current values for `duration`.
    pub fn wait(self, duration: f64) -> Self {
        self.push_wait(duration, false)
    }

    /// Hold for `duration` without writing the target, leaving it free for
    /// another owner.
    pub fn wait_passive(self, duration: f64) -> Self {
        self.push_wait(duration, true)
    }

    fn push_wait(mut self, duration: f64, passive: bool) -> Self {
        if duration > 0.0 {
            self.entries.push(StepEntry {
                d: duration,
                props: None,
                ease: Ease::Linear,
                passive,
            });
            self.end += duration;
        }
        self
    }

    /// Animate to `props` over `duration`.
    pub fn to(mut self, props: TweenProps, duration: f64, ease: Ease) -> Self {
        self.entries.push(StepEntry {
            d: duration,
            props: Some(props),
            ease,
            passive: false,
        });
        self.end += duration;
        self
    }

    /// Name the current end position.
    pub fn label(self, name: impl Into<String>) -> Self {
        let at = self.end;
        self.label_at(name, at)
    }

    pub fn label_at(mut self, name: impl Into<String>, position: f64) -> Self {
        self.labels.push((name.into(), position));
        self
    }

    /// Run a callback when the playhead passes the current end position.
    pub fn call(mut self, f: impl FnMut(&mut ActionCtx<'_>) + 'static) -> Self {
        self.actions.push((self.end, ActionKind::Call(Box::new(f))));
        self
    }

    /// Write `props` onto the tween's own target when the playhead passes.
    pub fn set(self, props: TweenProps) -> Self {
        self.set_on(props, None)
    }

    pub fn set_on(mut self, props: TweenProps, target: impl Into<Option<TargetId>>) -> Self {
        self.actions.push((
            self.end,
            ActionKind::Set {
                props,
                target: target.into(),
            },
        ));
        self
    }

    /// Unpause a tween when the playhead passes (self when `None`).
    pub fn play(mut self, tween: impl Into<Option<TweenId>>) -> Self {
        self.actions.push((self.end, ActionKind::Play(tween.into())));
        self
    }

    /// Pause a tween when the playhead passes (self when `None`).
    pub fn pause(mut self, tween: impl Into<Option<TweenId>>) -> Self {
        self.actions.push((self.end, ActionKind::Pause(tween.into())));
        self
    }

    pub fn on_event(mut self, f: impl FnMut(&mut ActionCtx<'_>, TweenEvent) + 'static) -> Self {
        self.handler = Some(Box::new(f));
        self
    }

    pub fn duration(&self) -> f64 {
        self.end
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    pub fn config(&self) -> &TweenConfig {
        &self.config
    }

    /// Resolve start values and freeze the script.
    ///
    /// Start values are captured per property at its first appearance:
    /// plugins get the first word (highest priority first), then the live
    /// target, then the property's own first end value. Earlier segments
    /// inherit captured values so every snapshot is complete.
    pub(crate) fn bake(
        self,
        host: &mut dyn TweenHost,
        plugins: &PluginSet,
        plugin_data: &mut BTreeMap<String, serde_json::Value>,
    ) -> ZoetropeResult<BakedTween> {
        for entry in &self.entries {
            if !entry.d.is_finite() || entry.d < 0.0 {
                return Err(ZoetropeError::animation(
                    "segment durations must be finite and >= 0",
                ));
            }
        }

        let mut inits = TweenProps::new();
        let mut ignored = BTreeSet::new();
        for entry in &self.entries {
            let Some(props) = &entry.props else { continue };
            for (name, end_value) in props {
                if inits.contains_key(name) || ignored.contains(name) {
                    continue;
                }
                let mut injected: Option<PropValue> = None;
                let mut drop_prop = false;
                for plugin in plugins.iter_capture() {
                    let mut ctx = PluginCtx {
                        target: self.target.and_then(|id| host.target_mut(id)),
                        data: &mut *plugin_data,
                    };
                    match plugin.init(&mut ctx, name, injected.as_ref()) {
                        PluginInit::Default => {}
                        PluginInit::Value(v) => injected = Some(v),
                        PluginInit::Ignore => {
                            drop_prop = true;
                            break;
                        }
                    }
                }
                if drop_prop {
                    ignored.insert(name.clone());
                    continue;
                }
                let start = injected
                    .or_else(|| {
                        self.target
                            .and_then(|id| host.target_mut(id))
                            .and_then(|t| t.get_prop(name))
                    })
                    .unwrap_or_else(|| end_value.clone());
                inits.insert(name.clone(), start);
            }
        }

        let mut steps = Vec::with_capacity(self.entries.len() + 1);
        steps.push(TweenStep {
            t: 0.0,
            d: 0.0,
            props: inits.clone(),
            ease: Ease::Linear,
            passive: true,
        });

        let mut cur = inits;
        let mut end = 0.0;
        for entry in self.entries {
            match entry.props {
                Some(props) => {
                    let mut next = cur.clone();
                    let mut clean = TweenProps::new();
                    for (k, v) in props {
                        if ignored.contains(&k) {
                            continue;
                        }
                        clean.insert(k.clone(), v.clone());
                        next.insert(k, v);
                    }
                    steps.push(TweenStep {
                        t: end,
                        d: entry.d,
                        props: next.clone(),
                        ease: entry.ease,
                        passive: entry.passive,
                    });
                    let step_index = steps.len() - 1;
                    for plugin in plugins.iter_capture() {
                        let mut ctx = PluginCtx {
                            target: self.target.and_then(|id| host.target_mut(id)),
                            data: &mut *plugin_data,
                        };
                        plugin.step(&mut ctx, step_index, &clean);
                    }
                    cur = next;
                }
                None => {
                    steps.push(TweenStep {
                        t: end,
                        d: entry.d,
                        props: cur.clone(),
                        ease: Ease::Linear,
                        passive: entry.passive,
                    });
                }
            }
            end += entry.d;
        }

        let actions = self
            .actions
            .into_iter()
            .map(|(t, kind)| TweenAction { t, kind })
            .collect();

        Ok(BakedTween {
            target: self.target,
            config: self.config,
            duration: end,
            steps,
            actions,
            labels: self.labels,
            handler: self.handler,
        })
    }
}

/// Frozen tween script, ready to install in the registry.
pub(crate) struct BakedTween {
    pub(crate) target: Option<TargetId>,
    pub(crate) config: TweenConfig,
    pub(crate) duration: f64,
    pub(crate) steps: Vec<TweenStep>,
    pub(crate) actions: Vec<TweenAction>,
    pub(crate) labels: Vec<(String, f64)>,
    pub(crate) handler: Option<EventFn>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tween::plugin::TweenPlugin;
    use crate::tween::props::{BagHost, PropBag, props};

    fn bag_with(entries: &[(&str, f64)]) -> PropBag {
        let mut bag = PropBag::default();
        for (k, v) in entries {
            bag.values.insert((*k).to_owned(), PropValue::Number(*v));
        }
        bag
    }

    fn bake(tween: Tween, host: &mut BagHost) -> BakedTween {
        let plugins = PluginSet::new();
        let mut data = BTreeMap::new();
        tween.bake(host, &plugins, &mut data).unwrap()
    }

    #[test]
    fn head_captures_live_start_values() {
        let mut host = BagHost::new();
        let id = host.add(bag_with(&[("x", 5.0)]));

        let baked = bake(
            Tween::new(id).to(props([("x", 100.0)]), 100.0, Ease::Linear),
            &mut host,
        );
        assert_eq!(baked.duration, 100.0);
        assert_eq!(baked.steps.len(), 2);
        assert_eq!(baked.steps[0].props["x"], PropValue::Number(5.0));
        assert_eq!(baked.steps[1].props["x"], PropValue::Number(100.0));
    }

    #[test]
    fn late_props_backfill_earlier_snapshots() {
        let mut host = BagHost::new();
        let id = host.add(bag_with(&[("x", 0.0), ("y", 2.0)]));

        let baked = bake(
            Tween::new(id)
                .to(props([("x", 100.0)]), 100.0, Ease::Linear)
                .to(props([("y", 7.0)]), 50.0, Ease::Linear),
            &mut host,
        );
        // The first segment holds y at its captured value while x moves.
        assert_eq!(baked.steps[1].props["y"], PropValue::Number(2.0));
        assert_eq!(baked.steps[2].props["x"], PropValue::Number(100.0));
        assert_eq!(baked.steps[2].props["y"], PropValue::Number(7.0));
    }

    #[test]
    fn waits_hold_the_accumulated_snapshot() {
        let mut host = BagHost::new();
        let id = host.add(bag_with(&[("x", 0.0)]));

        let baked = bake(
            Tween::new(id)
                .to(props([("x", 100.0)]), 100.0, Ease::Linear)
                .wait_passive(50.0)
                .to(props([("x", 0.0)]), 50.0, Ease::Linear),
            &mut host,
        );
        assert_eq!(baked.steps[2].t, 100.0);
        assert_eq!(baked.steps[2].props, baked.steps[1].props);
        assert!(baked.steps[2].passive);
        assert_eq!(baked.duration, 200.0);
    }

    #[test]
    fn zero_length_waits_are_dropped() {
        let mut host = BagHost::new();
        let id = host.add(PropBag::default());
        let baked = bake(Tween::new(id).wait(0.0).wait(10.0), &mut host);
        assert_eq!(baked.steps.len(), 2);
        assert_eq!(baked.duration, 10.0);
    }

    #[test]
    fn actions_sit_at_the_position_they_were_recorded() {
        let mut host = BagHost::new();
        let id = host.add(bag_with(&[("x", 0.0)]));

        let baked = bake(
            Tween::new(id)
                .call(|_| {})
                .to(props([("x", 1.0)]), 100.0, Ease::Linear)
                .set(props([("x", 9.0)]))
                .wait(50.0)
                .pause(None),
            &mut host,
        );
        let ts: Vec<f64> = baked.actions.iter().map(|a| a.t).collect();
        assert_eq!(ts, vec![0.0, 100.0, 150.0]);
        assert_eq!(baked.duration, 150.0);
    }

    struct InjectOrIgnore;

    impl TweenPlugin for InjectOrIgnore {
        fn name(&self) -> &'static str {
            "inject_or_ignore"
        }

        fn init(
            &self,
            _ctx: &mut PluginCtx<'_>,
            prop: &str,
            _current: Option<&PropValue>,
        ) -> PluginInit {
            match prop {
                "x" => PluginInit::Value(PropValue::Number(-1.0)),
                "skip" => PluginInit::Ignore,
                _ => PluginInit::Default,
            }
        }
    }

    #[test]
    fn plugins_can_inject_or_drop_captured_props() {
        let mut host = BagHost::new();
        let id = host.add(bag_with(&[("x", 5.0), ("skip", 1.0)]));

        let mut plugins = PluginSet::new();
        plugins.install(Box::new(InjectOrIgnore));
        let mut data = BTreeMap::new();

        let baked = Tween::new(id)
            .to(props([("x", 100.0), ("skip", 9.0), ("free", 3.0)]), 10.0, Ease::Linear)
            .bake(&mut host, &plugins, &mut data)
            .unwrap();

        assert_eq!(baked.steps[0].props["x"], PropValue::Number(-1.0));
        assert!(!baked.steps[0].props.contains_key("skip"));
        assert!(!baked.steps[1].props.contains_key("skip"));
        // Unknown on the target: the first end value doubles as the start.
        assert_eq!(baked.steps[0].props["free"], PropValue::Number(3.0));
    }

    #[test]
    fn invalid_durations_fail_to_bake() {
        let mut host = BagHost::new();
        let id = host.add(PropBag::default());
        let plugins = PluginSet::new();
        let mut data = BTreeMap::new();
        let err = Tween::new(id)
            .to(props([("x", 1.0)]), f64::NAN, Ease::Linear)
            .bake(&mut host, &plugins, &mut data);
        assert!(err.is_err());
    }
}
