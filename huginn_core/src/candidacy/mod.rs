//! Candidacy engine: decides whether a system is a good AFK bounty-hunting spot.
//!
//! The rule is a pure function of catalogue fields plus a small configuration. The
//! only spatial input (nearest exploitable neighbour) is resolved by the caller
//! through the catalogue store and passed in.

pub mod engine;
pub mod models;

pub use engine::{evaluate, needs_anchor};
