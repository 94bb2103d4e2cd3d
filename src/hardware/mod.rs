//! Hardware backends
//!
//! [`capabilities`] defines the opaque backend traits the core drives; [`mock`]
//! provides simulated implementations used by the CLI and the tests.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Counter, Manipulator, Positioner};
pub use mock::{MockCounter, MockManipulator, MockMotor, RobotStep};
