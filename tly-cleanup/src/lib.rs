#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod cleaner;

pub use cleaner::{CleanupReport, Cleaner};
