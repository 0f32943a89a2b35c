//! Command dispatch loop
//!
//! Reads one key at a time, resolves it through the [`KeyboardMapping`] and hands drive
//! commands to a [`CommandSink`]. Every key is handled completely before the next read.
//! The loop owns its sink and consumes itself in [`DispatchLoop::run`], so the sink is torn
//! down exactly once whichever way the loop ends.
//!
//! ```text
//! KeySource ──(blocking pool)──► resolve ──► CommandSink::publish
//!     │                             │
//!  error/EOF                       quit ──► disconnect + close
//! ```

use super::key_reader::{Key, KeySource};
use crate::console::StatusSink;
use crate::error::{InputError, PublishError};
use crate::mapping::keyboard::{Command, KeyAction, KeyboardMapping};
use crate::mqtt::message_manager::DeliveryToken;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where drive commands go; implemented by the broker session
pub trait CommandSink: Send + Sync {
    /// Non-blocking; the command is either queued or dropped with an error
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<DeliveryToken, PublishError>;

    /// Idempotent
    fn disconnect(&self);

    /// Idempotent; resolves once the transport is released
    fn close(&self) -> impl Future<Output = ()> + Send;
}

impl<T: CommandSink> CommandSink for Arc<T> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<DeliveryToken, PublishError> {
        (**self).publish(topic, payload)
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        (**self).close()
    }
}

/// Why the loop stopped
#[derive(Debug)]
pub enum ExitReason {
    Quit,
    InputEnded(InputError),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Quit => write!(f, "quit key"),
            ExitReason::InputEnded(e) => write!(f, "{e}"),
        }
    }
}

/// Outcome of one run
#[derive(Debug)]
pub struct DispatchReport {
    pub exit: ExitReason,
    pub published: usize,
    pub failed: usize,
}

pub struct DispatchLoop<K, S> {
    keys: Option<K>,
    sink: S,
    mapping: KeyboardMapping,
    topic: String,
    console: Arc<dyn StatusSink>,
    published: usize,
    failed: usize,
}

impl<K, S> DispatchLoop<K, S>
where
    K: KeySource + 'static,
    S: CommandSink,
{
    pub fn new(
        keys: K,
        sink: S,
        mapping: KeyboardMapping,
        topic: impl Into<String>,
        console: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            keys: Some(keys),
            sink,
            mapping,
            topic: topic.into(),
            console,
            published: 0,
            failed: 0,
        }
    }

    /// Runs until the quit key or the end of input, then disconnects and closes the sink
    pub async fn run(mut self) -> DispatchReport {
        info!("Dispatch loop started on topic '{}'", self.topic);
        let exit = self.pump().await;

        match &exit {
            ExitReason::Quit => self.console.status("Quitting."),
            ExitReason::InputEnded(e) => {
                warn!("Input ended: {}", e);
                self.console.status(&format!("Input ended ({e}), shutting down."));
            }
        }

        self.sink.disconnect();
        self.sink.close().await;

        info!(
            "Dispatch loop finished ({}): {} published, {} failed",
            exit, self.published, self.failed
        );
        DispatchReport {
            exit,
            published: self.published,
            failed: self.failed,
        }
    }

    async fn pump(&mut self) -> ExitReason {
        loop {
            let key = match self.next_key().await {
                Ok(key) => key,
                Err(e) => return ExitReason::InputEnded(e),
            };

            match self.mapping.resolve(&key) {
                KeyAction::Quit => return ExitReason::Quit,
                KeyAction::Publish(command) => self.send(command),
                KeyAction::Ignore => debug!("Unmapped key {:?}", key),
            }
        }
    }

    /// Blocking read on the blocking pool; the reader is handed back after each key
    async fn next_key(&mut self) -> Result<Key, InputError> {
        let mut keys = self.keys.take().ok_or(InputError::Closed)?;
        let (keys, key) = tokio::task::spawn_blocking(move || {
            let key = keys.read_key();
            (keys, key)
        })
        .await
        .map_err(|e| InputError::ReaderLost(e.to_string()))?;

        self.keys = Some(keys);
        key
    }

    fn send(&mut self, command: Command) {
        match self.sink.publish(&self.topic, command.payload()) {
            Ok(token) => {
                self.published += 1;
                debug!("Queued {} as {}", command, token);
                self.console.status(&format!("Sent: {command}"));
            }
            Err(e) => {
                self.failed += 1;
                warn!("Dropped {}: {}", command, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CapturedConsole;
    use crate::mqtt::mqtt_handler::ConnectionState;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script, then reports a closed stream
    struct ScriptedKeys {
        script: VecDeque<Result<Key, InputError>>,
    }

    impl ScriptedKeys {
        fn chars(keys: &str) -> Self {
            Self {
                script: keys.chars().map(|c| Ok(Key::Char(c))).collect(),
            }
        }

        fn then_fail(mut self, error: InputError) -> Self {
            self.script.push_back(Err(error));
            self
        }
    }

    impl KeySource for ScriptedKeys {
        fn read_key(&mut self) -> Result<Key, InputError> {
            self.script.pop_front().unwrap_or(Err(InputError::Closed))
        }
    }

    #[derive(Default)]
    struct Calls {
        published: Vec<(String, Vec<u8>)>,
        disconnects: usize,
        closes: usize,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Calls>>,
        offline: bool,
    }

    impl RecordingSink {
        fn offline() -> Self {
            Self {
                offline: true,
                ..Self::default()
            }
        }

        fn payloads(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .published
                .iter()
                .map(|(_, payload)| String::from_utf8(payload.clone()).unwrap())
                .collect()
        }

        fn teardown_counts(&self) -> (usize, usize) {
            let calls = self.calls.lock().unwrap();
            (calls.disconnects, calls.closes)
        }
    }

    impl CommandSink for RecordingSink {
        fn publish(&self, topic: &str, payload: &[u8]) -> Result<DeliveryToken, PublishError> {
            if self.offline {
                return Err(PublishError::NotConnected {
                    topic: topic.to_string(),
                    state: ConnectionState::Disconnected,
                });
            }
            let mut calls = self.calls.lock().unwrap();
            calls.published.push((topic.to_string(), payload.to_vec()));
            Ok(DeliveryToken(calls.published.len() as u64))
        }

        fn disconnect(&self) {
            self.calls.lock().unwrap().disconnects += 1;
        }

        async fn close(&self) {
            self.calls.lock().unwrap().closes += 1;
        }
    }

    async fn run(keys: ScriptedKeys, sink: RecordingSink) -> (DispatchReport, Arc<CapturedConsole>) {
        let console = Arc::new(CapturedConsole::default());
        let report = DispatchLoop::new(
            keys,
            sink,
            KeyboardMapping::default_config(),
            "VR_control",
            console.clone(),
        )
        .run()
        .await;
        (report, console)
    }

    #[tokio::test]
    async fn forward_then_quit() {
        let sink = RecordingSink::default();
        let (report, console) = run(ScriptedKeys::chars("wq"), sink.clone()).await;

        let calls = sink.calls.lock().unwrap();
        assert_eq!(
            calls.published,
            [("VR_control".to_string(), b"Forward".to_vec())]
        );
        assert_eq!((calls.disconnects, calls.closes), (1, 1));
        drop(calls);

        assert!(matches!(report.exit, ExitReason::Quit));
        assert_eq!(report.published, 1);
        assert!(console.contains("Forward"));
    }

    #[tokio::test]
    async fn every_mapped_key_publishes_its_token_once() {
        let sink = RecordingSink::default();
        let (report, _) = run(ScriptedKeys::chars("wsad q"), sink.clone()).await;

        assert_eq!(
            sink.payloads(),
            ["Forward", "Backward", "Left", "Right", "Stop"]
        );
        assert_eq!(report.published, 5);
    }

    #[tokio::test]
    async fn uppercase_keys_behave_like_lowercase() {
        let sink = RecordingSink::default();
        let (report, _) = run(ScriptedKeys::chars("WwQ"), sink.clone()).await;

        assert_eq!(sink.payloads(), ["Forward", "Forward"]);
        assert!(matches!(report.exit, ExitReason::Quit));
    }

    #[tokio::test]
    async fn unmapped_keys_publish_nothing() {
        let sink = RecordingSink::default();
        let (report, console) = run(ScriptedKeys::chars("xyz123\n\r"), sink.clone()).await;

        assert!(sink.payloads().is_empty());
        assert!(matches!(
            report.exit,
            ExitReason::InputEnded(InputError::Closed)
        ));
        assert!(!console.contains("Sent"));
    }

    #[tokio::test]
    async fn quit_key_publishes_nothing() {
        let sink = RecordingSink::default();
        let (report, _) = run(ScriptedKeys::chars("qw"), sink.clone()).await;

        assert!(sink.payloads().is_empty());
        assert!(matches!(report.exit, ExitReason::Quit));
        assert_eq!(sink.teardown_counts(), (1, 1));
    }

    #[tokio::test]
    async fn repeated_keys_republish() {
        let sink = RecordingSink::default();
        run(ScriptedKeys::chars("   q"), sink.clone()).await;
        assert_eq!(sink.payloads(), ["Stop", "Stop", "Stop"]);
    }

    #[tokio::test]
    async fn input_failure_still_tears_down_once() {
        let sink = RecordingSink::default();
        let keys = ScriptedKeys::chars("a").then_fail(InputError::Terminal(
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tty gone"),
        ));
        let (report, console) = run(keys, sink.clone()).await;

        assert_eq!(sink.payloads(), ["Left"]);
        assert_eq!(sink.teardown_counts(), (1, 1));
        assert!(matches!(
            report.exit,
            ExitReason::InputEnded(InputError::Terminal(_))
        ));
        assert!(console.contains("shutting down"));
    }

    #[tokio::test]
    async fn closed_input_tears_down_once() {
        let sink = RecordingSink::default();
        let (_, _) = run(ScriptedKeys::chars(""), sink.clone()).await;
        assert_eq!(sink.teardown_counts(), (1, 1));
    }

    #[tokio::test]
    async fn failed_publishes_do_not_stop_the_loop() {
        let sink = RecordingSink::offline();
        let (report, console) = run(ScriptedKeys::chars("wsdq"), sink.clone()).await;

        assert_eq!(report.failed, 3);
        assert_eq!(report.published, 0);
        assert!(matches!(report.exit, ExitReason::Quit));
        assert!(!console.contains("Sent"));
        assert_eq!(sink.teardown_counts(), (1, 1));
    }
}
