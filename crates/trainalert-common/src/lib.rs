//! Domain types shared by the evaluation, storage and delivery crates.

pub mod id;
pub mod types;
