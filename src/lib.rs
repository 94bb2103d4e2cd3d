//! Core library for beamline automation.
//!
//! This library contains the device/engine state framework and its two main
//! instantiations: the robotic sample changer ([`automounter::AutoMounter`]) and
//! the multi-point acquisition engine ([`scan::BasicScan`]). Front ends (the
//! `beamline` CLI, GUIs, scripts) observe everything through object states and
//! events.
//!
//! - [`observable`]: named states and ordered listeners
//! - [`device`]: hardware devices with health, options and lifecycle
//! - [`engine`]: pausable long-running tasks
//! - [`beamline`]: the registry tying a station together

pub mod automounter;
pub mod beamline;
pub mod config;
pub mod core;
pub mod device;
pub mod engine;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod health;
pub mod observable;
pub mod scan;
pub mod traits;

pub use beamline::Beamline;
pub use error::{AppResult, BeamlineError};
