#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod als;
pub mod anchor;
pub mod cell;
pub mod config;
pub mod dimension;
pub mod progress;
pub mod pseudomiss;
pub mod seed;
pub mod stats;
pub mod types;
pub mod variance;

// Persistence and constructs live beside the engine
#[path = "../bank/mod.rs"]
pub mod bank;
