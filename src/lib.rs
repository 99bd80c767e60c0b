#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod accumulator;
pub mod budget;
pub mod cancel;
pub mod codec;
pub mod db;
pub mod demux;
pub mod handlers;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod multiplexer;
pub mod persistence;
pub mod specs;
pub mod store;
pub mod str_utils;
pub mod transport;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
