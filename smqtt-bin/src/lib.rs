#![deny(unsafe_code)]

//! Shared plumbing of the `smqtt-pub` and `smqtt-sub` programs

pub mod app;
pub mod sample;

pub use app::Role;
pub use sample::{Sample, Status};
