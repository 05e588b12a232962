//! Registry that owns every live tween and drives playback.
//!
//! Tweens and timelines are registered once and addressed by [`TweenId`]
//! afterwards. Unpaused entries sit on an intrusive list that [`Tweens::tick`]
//! walks each frame; pausing delists an entry without forgetting it, so it can
//! be resumed, scrubbed, or removed later.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::tween::core::{Loops, Playhead, PositionOrLabel, SeekOutcome};
use crate::tween::plugin::{PluginCtx, PluginSet, PluginValue, TweenPlugin};
use crate::tween::props::{PropValue, TargetId, TweenHost, TweenProps};
use crate::tween::step::{ActionFn, ActionKind, TweenAction, TweenStep, actions_in_range, find_step};
use crate::tween::timeline::Timeline;
use crate::tween::tween::{BakedTween, EventFn, Tween, TweenEvent};

/// Handle to a registered tween or timeline.
///
/// Handles are generation checked: after the entry is removed, stale copies
/// resolve to nothing rather than whatever reuses the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TweenId {
    idx: u32,
    r#gen: u32,
}

/// Engine access handed to action callbacks and event handlers.
///
/// Callbacks may re-enter the engine freely: seek, pause, register, or even
/// remove the very tween they fired from.
pub struct ActionCtx<'a> {
    pub tweens: &'a mut Tweens,
    pub host: &'a mut dyn TweenHost,
    /// The entry the callback fired from.
    pub tween: TweenId,
}

struct TweenItem {
    head: Playhead,
    target: Option<TargetId>,
    steps: Vec<TweenStep>,
    actions: Vec<TweenAction>,
    /// Step index from the previous lookup, reused as the next search hint.
    step_hint: usize,
    plugin_data: BTreeMap<String, serde_json::Value>,
    handler: Option<EventFn>,
    /// Children driven by this entry when it is a timeline.
    children: Vec<TweenId>,
    is_timeline: bool,
    parent: Option<TweenId>,
    prev: Option<TweenId>,
    next: Option<TweenId>,
}

struct Slot {
    r#gen: u32,
    item: Option<TweenItem>,
}

/// Registry and clock for tweens and timelines.
#[derive(Default)]
pub struct Tweens {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<TweenId>,
    tail: Option<TweenId>,
    plugins: PluginSet,
    counts: HashMap<TargetId, u32>,
}

impl Tweens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a property plugin. Plugins only see tweens registered after
    /// installation; already baked steps keep their captured values.
    pub fn install_plugin(&mut self, plugin: Box<dyn TweenPlugin>) {
        self.plugins.install(plugin);
    }

    /// Register a tween: capture start values, freeze its script, and start
    /// it playing unless its config says otherwise.
    pub fn add(&mut self, tween: Tween, host: &mut dyn TweenHost) -> ZoetropeResult<TweenId> {
        let config = *tween.config();
        if config.override_target && let Some(target) = tween.target() {
            self.remove_tweens(target);
        }
        let mut plugin_data = BTreeMap::new();
        let baked = tween.bake(host, &self.plugins, &mut plugin_data)?;
        let id = self.insert_item(baked, plugin_data, false, Vec::new());
        if !config.paused {
            self.set_paused(id, false);
        }
        if let Some(position) = config.position {
            self.seek_internal(id, host, position, false, false);
        }
        Ok(id)
    }

    /// Register a timeline and all of its children.
    ///
    /// Children are force-paused regardless of their own configs; the
    /// timeline drives them by seeking each to its own in-pass position.
    pub fn add_timeline(
        &mut self,
        timeline: Timeline,
        host: &mut dyn TweenHost,
    ) -> ZoetropeResult<TweenId> {
        let (config, children, labels, handler) = timeline.into_parts();
        let mut child_ids = Vec::with_capacity(children.len());
        let mut duration: f64 = 0.0;
        for child in children {
            let child_config = *child.config();
            if child_config.override_target && let Some(target) = child.target() {
                self.remove_tweens(target);
            }
            let mut plugin_data = BTreeMap::new();
            let baked = child.bake(host, &self.plugins, &mut plugin_data)?;
            duration = duration.max(effective_duration(baked.duration, child_config.loops));
            child_ids.push(self.insert_item(baked, plugin_data, false, Vec::new()));
        }
        let baked = BakedTween {
            target: None,
            config,
            duration,
            steps: Vec::new(),
            actions: Vec::new(),
            labels,
            handler,
        };
        let id = self.insert_item(baked, BTreeMap::new(), true, child_ids.clone());
        for child in child_ids {
            if let Some(item) = self.item_mut(child) {
                item.parent = Some(id);
            }
        }
        if !config.paused {
            self.set_paused(id, false);
        }
        if let Some(position) = config.position {
            self.seek_internal(id, host, position, false, false);
        }
        Ok(id)
    }

    /// Attach an already registered tween to a timeline.
    ///
    /// The child is paused (the timeline owns its clock from now on), the
    /// timeline's duration grows to cover it, and if the timeline has ever
    /// been positioned the child is seeked there immediately.
    pub fn add_to_timeline(
        &mut self,
        timeline: TweenId,
        tween: TweenId,
        host: &mut dyn TweenHost,
    ) -> ZoetropeResult<()> {
        if timeline == tween {
            return Err(ZoetropeError::animation("a timeline cannot contain itself"));
        }
        if !self.item(timeline).is_some_and(|item| item.is_timeline) {
            return Err(ZoetropeError::animation("handle is not a timeline"));
        }
        if self.item(tween).is_none() {
            return Err(ZoetropeError::animation("stale tween handle"));
        }
        let mut cursor = self.item(timeline).and_then(|item| item.parent);
        while let Some(ancestor) = cursor {
            if ancestor == tween {
                return Err(ZoetropeError::animation(
                    "a timeline cannot contain its own ancestor",
                ));
            }
            cursor = self.item(ancestor).and_then(|item| item.parent);
        }

        if let Some(parent) = self.item(tween).and_then(|item| item.parent) {
            self.detach_child(parent, tween);
        }
        self.set_paused(tween, true);

        let effective = match self.item(tween) {
            Some(item) => effective_duration(item.head.duration, item.head.loops),
            None => 0.0,
        };
        let raw = match self.item_mut(timeline) {
            Some(item) => {
                item.children.push(tween);
                item.head.duration = item.head.duration.max(effective);
                item.head.raw_position
            }
            None => return Ok(()),
        };
        if let Some(item) = self.item_mut(tween) {
            item.parent = Some(timeline);
        }
        if raw >= 0.0 {
            self.seek_internal(tween, host, raw, false, false);
        }
        Ok(())
    }

    /// Detach a tween from a timeline, leaving it registered and paused.
    pub fn remove_from_timeline(&mut self, timeline: TweenId, tween: TweenId) -> bool {
        if !self
            .item(tween)
            .is_some_and(|item| item.parent == Some(timeline))
        {
            return false;
        }
        if let Some(item) = self.item_mut(tween) {
            item.parent = None;
        }
        self.detach_child(timeline, tween);
        true
    }

    /// Advance every listed entry by `delta` (or one tick for tick-based
    /// entries). `global_paused` skips entries that don't opt out of it.
    pub fn tick(&mut self, host: &mut dyn TweenHost, delta: f64, global_paused: bool) {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            // capture before advancing; the entry may complete or be removed
            let Some(item) = self.item(id) else { break };
            let next = item.next;
            let skip = (global_paused && !item.head.ignore_global_pause) || item.head.paused;
            let amount = if item.head.use_ticks { 1.0 } else { delta };
            let raw = item.head.raw_position + amount * item.head.time_scale;
            if !skip {
                self.seek_internal(id, host, raw, false, false);
            }
            cursor = next;
        }
    }

    /// Advance one entry by `delta`, scaled by its time scale.
    pub fn advance(&mut self, id: TweenId, host: &mut dyn TweenHost, delta: f64) {
        let Some(item) = self.item(id) else { return };
        let raw = item.head.raw_position + delta * item.head.time_scale;
        self.seek_internal(id, host, raw, false, false);
    }

    /// Seek to an absolute raw position, running any actions crossed on the
    /// way.
    pub fn set_position(&mut self, id: TweenId, host: &mut dyn TweenHost, raw_position: f64) {
        self.seek_internal(id, host, raw_position, false, false);
    }

    /// Unpause and jump to a position or label. Only actions at the landing
    /// position run.
    pub fn goto_and_play(
        &mut self,
        id: TweenId,
        host: &mut dyn TweenHost,
        to: impl Into<PositionOrLabel>,
    ) -> ZoetropeResult<()> {
        let position = self.resolve(id, &to.into())?;
        self.set_paused(id, false);
        self.seek_internal(id, host, position, false, true);
        Ok(())
    }

    /// Pause and jump to a position or label. Only actions at the landing
    /// position run.
    pub fn goto_and_stop(
        &mut self,
        id: TweenId,
        host: &mut dyn TweenHost,
        to: impl Into<PositionOrLabel>,
    ) -> ZoetropeResult<()> {
        let position = self.resolve(id, &to.into())?;
        self.set_paused(id, true);
        self.seek_internal(id, host, position, false, true);
        Ok(())
    }

    /// Pause or resume an entry, delisting or relisting it for ticks.
    pub fn set_paused(&mut self, id: TweenId, paused: bool) {
        let target = match self.item(id) {
            Some(item) if item.head.paused != paused => item.target,
            _ => return,
        };
        if let Some(item) = self.item_mut(id) {
            item.head.paused = paused;
        }
        if paused {
            self.unlink(id);
            if let Some(target) = target
                && let Some(count) = self.counts.get_mut(&target)
            {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.counts.remove(&target);
                }
            }
        } else {
            self.link(id);
            if let Some(target) = target {
                *self.counts.entry(target).or_insert(0) += 1;
            }
        }
    }

    /// Pause every listed tween animating `target`. Entries that are already
    /// paused are left alone.
    pub fn remove_tweens(&mut self, target: TargetId) {
        if !self.has_active_tweens(target) {
            return;
        }
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let next = self.item(id).and_then(|item| item.next);
            if self.item(id).is_some_and(|item| item.target == Some(target)) {
                self.set_paused(id, true);
            }
            cursor = next;
        }
        self.counts.remove(&target);
    }

    /// Pause and delist every entry at once.
    pub fn remove_all_tweens(&mut self) {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let next = self.item(id).and_then(|item| item.next);
            if let Some(item) = self.item_mut(id) {
                item.head.paused = true;
                item.prev = None;
                item.next = None;
            }
            cursor = next;
        }
        self.head = None;
        self.tail = None;
        self.counts.clear();
    }

    /// Forget an entry entirely, freeing its slot for reuse. Children of a
    /// removed timeline stay registered, paused and orphaned.
    pub fn remove(&mut self, id: TweenId) {
        if self.item(id).is_none() {
            return;
        }
        self.set_paused(id, true);
        let (parent, children) = match self.item(id) {
            Some(item) => (item.parent, item.children.clone()),
            None => return,
        };
        if let Some(parent) = parent {
            self.detach_child(parent, id);
        }
        for child in children {
            if let Some(item) = self.item_mut(child) {
                item.parent = None;
            }
        }
        let slot = &mut self.slots[id.idx as usize];
        slot.item = None;
        slot.r#gen = slot.r#gen.wrapping_add(1);
        self.free.push(id.idx);
    }

    /// Whether any listed tween is animating `target`.
    pub fn has_active_tweens(&self, target: TargetId) -> bool {
        self.counts.get(&target).is_some_and(|count| *count > 0)
    }

    /// Whether nothing is listed for ticking at all.
    pub fn is_idle(&self) -> bool {
        self.head.is_none()
    }

    /// Number of entries currently listed for ticking.
    pub fn active_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            count += 1;
            cursor = self.item(id).and_then(|item| item.next);
        }
        count
    }

    pub fn contains(&self, id: TweenId) -> bool {
        self.item(id).is_some()
    }

    /// Read-only view of an entry's time state.
    pub fn playhead(&self, id: TweenId) -> Option<&Playhead> {
        self.item(id).map(|item| &item.head)
    }

    pub fn target(&self, id: TweenId) -> Option<TargetId> {
        self.item(id).and_then(|item| item.target)
    }

    pub fn add_label(&mut self, id: TweenId, name: impl Into<String>, position: f64) {
        if let Some(item) = self.item_mut(id) {
            item.head.add_label(name, position);
        }
    }

    fn resolve(&self, id: TweenId, to: &PositionOrLabel) -> ZoetropeResult<f64> {
        match self.item(id) {
            Some(item) => item.head.resolve_position(to),
            None => Err(ZoetropeError::animation("stale tween handle")),
        }
    }

    fn insert_item(
        &mut self,
        baked: BakedTween,
        plugin_data: BTreeMap<String, serde_json::Value>,
        is_timeline: bool,
        children: Vec<TweenId>,
    ) -> TweenId {
        let mut head = Playhead::new(&baked.config);
        head.duration = baked.duration;
        // entries join the tick list through set_paused
        head.paused = true;
        for (name, position) in baked.labels {
            head.add_label(name, position);
        }
        let item = TweenItem {
            head,
            target: baked.target,
            steps: baked.steps,
            actions: baked.actions,
            step_hint: 0,
            plugin_data,
            handler: baked.handler,
            children,
            is_timeline,
            parent: None,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.item = Some(item);
                TweenId { idx, r#gen: slot.r#gen }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot { r#gen: 0, item: Some(item) });
                TweenId { idx, r#gen: 0 }
            }
        }
    }

    fn item(&self, id: TweenId) -> Option<&TweenItem> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.r#gen != id.r#gen {
            return None;
        }
        slot.item.as_ref()
    }

    fn item_mut(&mut self, id: TweenId) -> Option<&mut TweenItem> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.r#gen != id.r#gen {
            return None;
        }
        slot.item.as_mut()
    }

    fn link(&mut self, id: TweenId) {
        match self.tail {
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
            Some(tail) => {
                if let Some(item) = self.item_mut(tail) {
                    item.next = Some(id);
                }
                if let Some(item) = self.item_mut(id) {
                    item.prev = Some(tail);
                }
                self.tail = Some(id);
            }
        }
    }

    fn unlink(&mut self, id: TweenId) {
        let (prev, next) = match self.item(id) {
            Some(item) => (item.prev, item.next),
            None => return,
        };
        match next {
            Some(next) => {
                if let Some(item) = self.item_mut(next) {
                    item.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        match prev {
            Some(prev) => {
                if let Some(item) = self.item_mut(prev) {
                    item.next = next;
                }
            }
            None => self.head = next,
        }
        if let Some(item) = self.item_mut(id) {
            item.prev = None;
            item.next = None;
        }
    }

    fn detach_child(&mut self, timeline: TweenId, child: TweenId) {
        let children = match self.item_mut(timeline) {
            Some(item) => {
                item.children.retain(|c| *c != child);
                item.children.clone()
            }
            None => return,
        };
        let mut duration: f64 = 0.0;
        for child in children {
            if let Some(item) = self.item(child) {
                duration = duration.max(effective_duration(item.head.duration, item.head.loops));
            }
        }
        if let Some(item) = self.item_mut(timeline) {
            item.head.duration = duration;
        }
    }

    fn seek_internal(
        &mut self,
        id: TweenId,
        host: &mut dyn TweenHost,
        raw_position: f64,
        ignore_actions: bool,
        jump: bool,
    ) {
        let Some(item) = self.item_mut(id) else { return };
        let prev_raw = item.head.raw_position;
        let (position, raw, ended) = match item.head.prepare_seek(raw_position) {
            SeekOutcome::NoChange { .. } => return,
            SeekOutcome::Apply {
                position,
                raw,
                ended,
            } => (position, raw, ended),
        };
        // committed up front so actions observe the landed position
        item.head.position = position;
        item.head.raw_position = raw;

        self.update_position(id, host, jump, ended);
        if ended {
            self.set_paused(id, true);
        }
        if !ignore_actions {
            let include_start = !jump && prev_raw == -1.0;
            self.run_actions(id, host, prev_raw, raw, jump, include_start);
        }
        self.fire_event(id, host, TweenEvent::Change);
        if ended {
            self.fire_event(id, host, TweenEvent::Complete);
        }
    }

    fn update_position(&mut self, id: TweenId, host: &mut dyn TweenHost, jump: bool, ended: bool) {
        let (is_timeline, position) = match self.item(id) {
            Some(item) => (item.is_timeline, item.head.position),
            None => return,
        };
        if is_timeline {
            let children = match self.item(id) {
                Some(item) => item.children.clone(),
                None => return,
            };
            // children only move here; their actions run with the timeline's
            for child in children {
                self.seek_internal(child, host, position, true, jump);
            }
            return;
        }
        let (step_idx, ratio) = {
            let Some(item) = self.item_mut(id) else { return };
            if item.target.is_none() {
                return;
            }
            let Some(step_idx) = find_step(&item.steps, position, item.step_hint) else {
                return;
            };
            item.step_hint = step_idx;
            let step = &item.steps[step_idx];
            let d = item.head.duration;
            let ratio = if ended {
                if d == 0.0 { 1.0 } else { position / d }
            } else if step.d == 0.0 {
                1.0
            } else {
                (position - step.t) / step.d
            };
            (step_idx, ratio)
        };
        self.update_target_props(id, host, step_idx, ratio, ended);
    }

    fn update_target_props(
        &mut self,
        id: TweenId,
        host: &mut dyn TweenHost,
        step_idx: usize,
        ratio: f64,
        end: bool,
    ) {
        let Tweens { slots, plugins, .. } = self;
        let Some(slot) = slots.get_mut(id.idx as usize) else {
            return;
        };
        if slot.r#gen != id.r#gen {
            return;
        }
        let Some(item) = slot.item.as_mut() else { return };
        let step = &item.steps[step_idx];
        if step.passive {
            return;
        }
        let eased = step.ease.apply(ratio);
        let Some(target_id) = item.target else { return };
        let Some(target) = host.target_mut(target_id) else {
            return;
        };
        let prev = &item.steps[step_idx - 1];
        let plugin_data = &mut item.plugin_data;

        for (name, v0) in &prev.props {
            let v1 = step.props.get(name).unwrap_or(v0);
            let mut value = match (v0, v1) {
                (PropValue::Number(n0), PropValue::Number(n1)) if v0 != v1 => {
                    PropValue::Number(n0 + (n1 - n0) * eased)
                }
                _ if eased >= 1.0 => v1.clone(),
                _ => v0.clone(),
            };
            let mut write = true;
            for plugin in plugins.iter_change() {
                let mut ctx = PluginCtx {
                    target: Some(&mut *target),
                    data: &mut *plugin_data,
                };
                match plugin.change(&mut ctx, name, &value, eased, end) {
                    PluginValue::Keep => {}
                    PluginValue::Replace(next) => value = next,
                    PluginValue::Ignore => {
                        write = false;
                        break;
                    }
                }
            }
            if write {
                target.set_prop(name, &value);
            }
        }
    }

    /// Run the actions crossed travelling `start_raw` to `end_raw`. Returns
    /// true when an action moved the playhead and the rest were abandoned.
    fn run_actions(
        &mut self,
        id: TweenId,
        host: &mut dyn TweenHost,
        start_raw: f64,
        end_raw: f64,
        jump: bool,
        include_start: bool,
    ) -> bool {
        let ranges = match self.item(id) {
            Some(item) => {
                if !item.is_timeline && item.actions.is_empty() {
                    return false;
                }
                item.head
                    .plan_action_ranges(start_raw, end_raw, jump, include_start)
            }
            None => return false,
        };
        for range in ranges {
            if self.run_actions_range(id, host, range.start, range.end, jump, range.include_start) {
                return true;
            }
        }
        false
    }

    fn run_actions_range(
        &mut self,
        id: TweenId,
        host: &mut dyn TweenHost,
        start: f64,
        end: f64,
        jump: bool,
        include_start: bool,
    ) -> bool {
        let Some(item) = self.item(id) else { return true };
        let position = item.head.position;
        if item.is_timeline {
            let children = item.children.clone();
            for child in children {
                self.run_actions(child, host, start, end, jump, include_start);
                match self.item(id) {
                    Some(item) if item.head.position == position => {}
                    _ => return true,
                }
            }
            return false;
        }
        let indices = actions_in_range(&item.actions, start, end, include_start);
        for index in indices {
            self.run_one_action(id, host, index);
            match self.item(id) {
                Some(item) if item.head.position == position => {}
                _ => return true,
            }
        }
        false
    }

    fn run_one_action(&mut self, id: TweenId, host: &mut dyn TweenHost, index: usize) {
        let fired = {
            let Some(item) = self.item_mut(id) else { return };
            let own_target = item.target;
            let Some(action) = item.actions.get_mut(index) else {
                return;
            };
            match &mut action.kind {
                ActionKind::Call(f) => Fired::Call(mem::replace(f, Box::new(|_| {}))),
                ActionKind::Set { props, target } => Fired::Set {
                    props: props.clone(),
                    target: target.or(own_target),
                },
                ActionKind::Play(tween) => Fired::Paused {
                    tween: tween.unwrap_or(id),
                    paused: false,
                },
                ActionKind::Pause(tween) => Fired::Paused {
                    tween: tween.unwrap_or(id),
                    paused: true,
                },
            }
        };
        match fired {
            Fired::Call(mut f) => {
                {
                    let mut ctx = ActionCtx {
                        tweens: self,
                        host,
                        tween: id,
                    };
                    f(&mut ctx);
                }
                // the callback goes back unless the entry died under it
                if let Some(item) = self.item_mut(id)
                    && let Some(action) = item.actions.get_mut(index)
                    && let ActionKind::Call(slot) = &mut action.kind
                {
                    *slot = f;
                }
            }
            Fired::Set { props, target } => {
                if let Some(target) = target
                    && let Some(object) = host.target_mut(target)
                {
                    for (name, value) in &props {
                        object.set_prop(name, value);
                    }
                }
            }
            Fired::Paused { tween, paused } => self.set_paused(tween, paused),
        }
    }

    fn fire_event(&mut self, id: TweenId, host: &mut dyn TweenHost, event: TweenEvent) {
        let Some(item) = self.item_mut(id) else { return };
        let Some(mut handler) = item.handler.take() else {
            return;
        };
        {
            let mut ctx = ActionCtx {
                tweens: self,
                host,
                tween: id,
            };
            handler(&mut ctx, event);
        }
        if let Some(item) = self.item_mut(id)
            && item.handler.is_none()
        {
            item.handler = Some(handler);
        }
    }
}

impl std::fmt::Debug for Tweens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tweens")
            .field("slots", &self.slots.len())
            .field("active", &self.active_count())
            .finish()
    }
}

enum Fired {
    Call(ActionFn),
    Set {
        props: TweenProps,
        target: Option<TargetId>,
    },
    Paused { tween: TweenId, paused: bool },
}

fn effective_duration(duration: f64, loops: Loops) -> f64 {
    match loops {
        Loops::Finite(n) if n > 0 => duration * (f64::from(n) + 1.0),
        _ => duration,
    }
}
