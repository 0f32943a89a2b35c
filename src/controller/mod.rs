//! Keyboard controller
//!
//! 1. [`key_reader`] - Blocking key sources (raw terminal or piped stdin)
//! 2. [`dispatch`] - Resolves keys and publishes drive commands
//!
//! # Architecture
//!
//! ```text
//! KeySource ──► DispatchLoop ──► CommandSink (MQTT session)
//! ```

pub mod dispatch;
pub mod key_reader;
