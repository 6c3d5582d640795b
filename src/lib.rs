#![forbid(unsafe_code)]

//! Building blocks for the converter backend: runtime configuration, the
//! artifact store, wrappers around the external conversion tools and the
//! retention sweeper that keeps the output folders small.

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod error;
pub mod font;
pub mod security;
pub mod sweeper;
pub mod tools;
pub mod video;
