use crate::tween::core::TweenConfig;
use crate::tween::registry::ActionCtx;
use crate::tween::tween::{EventFn, Tween, TweenEvent};

/// Builder synchronizing a group of tweens under one playhead.
///
/// Children are force-paused at registration and advance only through the
/// timeline: its in-pass position feeds each child as a raw seek, so child
/// loop and bounce settings still apply within the shared clock.
pub struct Timeline {
    config: TweenConfig,
    children: Vec<Tween>,
    labels: Vec<(String, f64)>,
    handler: Option<EventFn>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            config: TweenConfig::default(),
            children: Vec::new(),
            labels: Vec::new(),
            handler: None,
        }
    }

    pub fn with_config(mut self, config: TweenConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add(mut self, tween: Tween) -> Self {
        self.children.push(tween);
        self
    }

    pub fn label_at(mut self, name: impl Into<String>, position: f64) -> Self {
        self.labels.push((name.into(), position));
        self
    }

    pub fn on_event(mut self, f: impl FnMut(&mut ActionCtx<'_>, TweenEvent) + 'static) -> Self {
        self.handler = Some(Box::new(f));
        self
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn config(&self) -> &TweenConfig {
        &self.config
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn into_parts(
        self,
    ) -> (
        TweenConfig,
        Vec<Tween>,
        Vec<(String, f64)>,
        Option<EventFn>,
    ) {
        (self.config, self.children, self.labels, self.handler)
    }
}
