//! Error kinds shared by the session manager, the dispatch loop and the key readers.

use crate::mqtt::mqtt_handler::ConnectionState;
use thiserror::Error;

/// Failure to establish the broker connection
///
/// Fatal at startup: the bridge cannot do anything useful without an initial session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The broker address is not `scheme://host[:port]` with a supported scheme
    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Client ids must be non-empty and must not start with whitespace
    #[error("invalid client id '{0}'")]
    InvalidClientId(String),

    /// Socket level failure (refused, unreachable, DNS, reset)
    #[error("broker {address} is unreachable")]
    Unreachable {
        address: String,
        #[source]
        source: rumqttc::ConnectionError,
    },

    /// The broker answered the CONNECT with a refusal code
    #[error("broker {address} refused the connection: {code}")]
    Refused { address: String, code: String },

    /// Credentials rejected; kept apart from other refusals
    #[error("broker {address} rejected the client credentials")]
    NotAuthorized { address: String },

    #[error("no CONNACK from {address} within {secs}s")]
    Timeout { address: String, secs: u64 },
}

/// Subscription attempted while the session cannot carry it
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("cannot subscribe to '{topic}': session is {state}")]
    NotConnected {
        topic: String,
        state: ConnectionState,
    },

    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("subscribe request for '{topic}' was rejected by the client")]
    Rejected {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
}

/// Publish attempted while the session cannot carry it; the message is dropped, never queued
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot publish to '{topic}': session is {state}")]
    NotConnected {
        topic: String,
        state: ConnectionState,
    },

    #[error("cannot publish to '{topic}': session has been disconnected")]
    Closed { topic: String },

    #[error("publish to '{topic}' was rejected by the client")]
    Rejected {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
}

/// Failure of the operator input stream; always ends the dispatch loop
#[derive(Debug, Error)]
pub enum InputError {
    #[error("terminal input failed: {0}")]
    Terminal(#[from] std::io::Error),

    #[error("input stream closed")]
    Closed,

    #[error("input interrupted by the operator")]
    Interrupted,

    #[error("key reader stopped unexpectedly: {0}")]
    ReaderLost(String),
}
