//! Concrete source adapters, each behind its own cargo feature.

#[cfg(feature = "elitebgs")]
pub mod elitebgs;
#[cfg(any(feature = "inara", feature = "siriuscorp", feature = "elitebgs"))]
pub mod http;
#[cfg(feature = "inara")]
pub mod inara;
#[cfg(feature = "siriuscorp")]
pub mod siriuscorp;
#[cfg(feature = "spansh")]
pub mod spansh;
