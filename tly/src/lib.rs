#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
