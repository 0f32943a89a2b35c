//! Key to drive-command mapping

pub mod keyboard;
