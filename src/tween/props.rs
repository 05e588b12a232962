use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Animatable property value. Numbers interpolate; anything else snaps to
/// the step's end value once the eased ratio reaches 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Number(f64),
    Discrete(serde_json::Value),
}

impl PropValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Discrete(v) => v.as_f64(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Discrete(v) => v.as_bool(),
            Self::Number(_) => None,
        }
    }
}

impl From<f64> for PropValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        Self::Discrete(serde_json::Value::Bool(b))
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        Self::Discrete(serde_json::Value::String(s.to_owned()))
    }
}

/// Named property set, ordered so application and capture are deterministic.
pub type TweenProps = BTreeMap<String, PropValue>;

pub fn props<I, K, V>(entries: I) -> TweenProps
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<PropValue>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Property access the animation engine needs from an animated object.
pub trait TweenTarget {
    fn get_prop(&self, name: &str) -> Option<PropValue>;
    fn set_prop(&mut self, name: &str, value: &PropValue);
}

/// Stable handle the engine uses to reach a target through a [`TweenHost`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u64);

/// Resolves target handles to live objects for the duration of one engine
/// call. Unresolvable ids make a tween skip its property writes for that
/// update, nothing more.
pub trait TweenHost {
    fn target_mut(&mut self, id: TargetId) -> Option<&mut dyn TweenTarget>;
}

/// Free-form property bag, the simplest possible target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropBag {
    pub values: TweenProps,
}

impl PropBag {
    pub fn number(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(PropValue::as_number)
    }
}

impl TweenTarget for PropBag {
    fn get_prop(&self, name: &str) -> Option<PropValue> {
        self.values.get(name).cloned()
    }

    fn set_prop(&mut self, name: &str, value: &PropValue) {
        self.values.insert(name.to_owned(), value.clone());
    }
}

/// Host keeping [`PropBag`] targets in a flat map. Handy for embedding the
/// engine without a scene graph, and the workhorse of the engine tests.
#[derive(Clone, Debug, Default)]
pub struct BagHost {
    pub targets: BTreeMap<TargetId, PropBag>,
}

impl BagHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bag: PropBag) -> TargetId {
        let id = TargetId(self.targets.len() as u64);
        self.targets.insert(id, bag);
        id
    }

    pub fn bag(&self, id: TargetId) -> Option<&PropBag> {
        self.targets.get(&id)
    }
}

impl TweenHost for BagHost {
    fn target_mut(&mut self, id: TargetId) -> Option<&mut dyn TweenTarget> {
        self.targets
            .get_mut(&id)
            .map(|bag| bag as &mut dyn TweenTarget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prop_values_deserialize_untagged() {
        let v: PropValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, PropValue::Number(3.5));

        let v: PropValue = serde_json::from_str("true").unwrap();
        assert_eq!(v.as_bool(), Some(true));

        let v: PropValue = serde_json::from_str("\"label\"").unwrap();
        assert_eq!(v.as_number(), None);
    }

    #[test]
    fn props_helper_accepts_mixed_values() {
        let p = props([
            ("x", PropValue::from(10.0)),
            ("visible", PropValue::from(false)),
        ]);
        assert_eq!(p.get("x").and_then(PropValue::as_number), Some(10.0));
        assert_eq!(p.get("visible").and_then(PropValue::as_bool), Some(false));
    }

    #[test]
    fn bag_host_resolves_targets() {
        let mut host = BagHost::new();
        let id = host.add(PropBag::default());
        host.target_mut(id)
            .unwrap()
            .set_prop("x", &PropValue::Number(7.0));
        assert_eq!(host.bag(id).unwrap().number("x"), Some(7.0));
        assert!(host.target_mut(TargetId(99)).is_none());
    }
}
