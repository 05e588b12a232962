use std::collections::BTreeMap;

use crate::tween::props::{PropValue, TweenProps, TweenTarget};

/// Outcome of a plugin's start-value capture for one property.
#[derive(Clone, Debug, PartialEq)]
pub enum PluginInit {
    /// No opinion; the engine reads the target (or lets a later plugin answer).
    Default,
    /// Use this as the property's start value.
    Value(PropValue),
    /// Drop the property from the tween entirely.
    Ignore,
}

/// Outcome of a plugin's pass over one property write.
#[derive(Clone, Debug, PartialEq)]
pub enum PluginValue {
    Keep,
    Replace(PropValue),
    /// Skip writing this property for this update.
    Ignore,
}

/// Borrowed state a plugin may inspect or mutate during a callback.
pub struct PluginCtx<'a> {
    /// Animated target, when the host can resolve it.
    pub target: Option<&'a mut dyn TweenTarget>,
    /// Per-tween scratch, keyed by plugin name.
    pub data: &'a mut BTreeMap<String, serde_json::Value>,
}

/// Hook points for extending property handling engine-wide.
///
/// `init` runs when a tween first records a property, highest priority
/// first; `change` runs on every write, lowest priority first, and may
/// rewrite or swallow the value.
pub trait TweenPlugin {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        0
    }

    fn init(
        &self,
        _ctx: &mut PluginCtx<'_>,
        _prop: &str,
        _current: Option<&PropValue>,
    ) -> PluginInit {
        PluginInit::Default
    }

    /// Notification that a step covering `props` was appended.
    fn step(&self, _ctx: &mut PluginCtx<'_>, _step_index: usize, _props: &TweenProps) {}

    fn change(
        &self,
        _ctx: &mut PluginCtx<'_>,
        _prop: &str,
        _value: &PropValue,
        _ratio: f64,
        _end: bool,
    ) -> PluginValue {
        PluginValue::Keep
    }
}

/// Installed plugins, kept sorted by ascending priority. Ties keep
/// installation order.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn TweenPlugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, plugin: Box<dyn TweenPlugin>) {
        let priority = plugin.priority();
        let at = self
            .plugins
            .iter()
            .position(|p| priority < p.priority())
            .unwrap_or(self.plugins.len());
        self.plugins.insert(at, plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Capture order: highest priority first.
    pub fn iter_capture(&self) -> impl Iterator<Item = &dyn TweenPlugin> {
        self.plugins.iter().rev().map(Box::as_ref)
    }

    /// Write order: lowest priority first.
    pub fn iter_change(&self) -> impl Iterator<Item = &dyn TweenPlugin> {
        self.plugins.iter().map(Box::as_ref)
    }
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i32);

    impl TweenPlugin for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn install_sorts_ascending_and_keeps_tie_order() {
        let mut set = PluginSet::new();
        set.install(Box::new(Named("mid_a", 0)));
        set.install(Box::new(Named("high", 10)));
        set.install(Box::new(Named("low", -5)));
        set.install(Box::new(Named("mid_b", 0)));

        let change: Vec<_> = set.iter_change().map(|p| p.name()).collect();
        assert_eq!(change, ["low", "mid_a", "mid_b", "high"]);

        let capture: Vec<_> = set.iter_capture().map(|p| p.name()).collect();
        assert_eq!(capture, ["high", "mid_b", "mid_a", "low"]);
    }

    #[test]
    fn default_hooks_are_inert() {
        let plugin = Named("inert", 0);
        let mut data = BTreeMap::new();
        let mut ctx = PluginCtx {
            target: None,
            data: &mut data,
        };
        assert_eq!(
            plugin.init(&mut ctx, "x", None),
            PluginInit::Default
        );
        assert_eq!(
            plugin.change(&mut ctx, "x", &PropValue::Number(1.0), 0.5, false),
            PluginValue::Keep
        );
    }
}
