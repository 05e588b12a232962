//! Property tweening: eases, step scripts, plugins, timelines, and the
//! registry that clocks them all.
//!
//! A [`tween::Tween`](crate::tween::tween::Tween) is a builder that scripts
//! segments against named properties; registering it with
//! [`registry::Tweens`] captures start values from the live target and
//! freezes the script. From then on the registry owns playback: ticking,
//! seeking, actions, and events.

pub mod core;
pub mod ease;
pub mod plugin;
pub mod props;
pub mod registry;
pub mod step;
pub mod timeline;
pub mod tween;
