pub mod cli;
pub mod wiring;
