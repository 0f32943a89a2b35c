//! # MQTT Session Module
//!
//! Broker session used by the teleoperation console: one connection, command publishing,
//! echo subscriptions and automatic recovery after a dropped link.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Session settings and reconnect policy
//! ├── events.rs           - Session callbacks and the console reporter
//! ├── message_manager.rs  - Inbound messages and delivery receipts
//! ├── mqtt_handler.rs     - Connection lifecycle and protocol handling
//! └── subscriptions.rs    - Topic registry restored after reconnects
//! ```
//!
//! ## Threading
//!
//! The rumqttc event loop is polled by a single driver task. Every callback in
//! [`events`] runs on that task, one at a time, in the order the broker events
//! arrive. Callbacks must return quickly; a panicking callback is logged and skipped.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──CONNACK──► Connected
//!      ▲                          ▲                      │
//!      │                          └────link lost─────────┤
//!      └──────────────disconnect()/close()───────────────┘
//! ```

pub mod config;
pub mod events;
pub mod message_manager;
pub mod mqtt_handler;
pub mod subscriptions;
