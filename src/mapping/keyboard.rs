//! Keyboard mapping: single key presses to drive commands

use crate::controller::key_reader::Key;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

macro_rules! bind {
    ($map:expr, $key:expr, $action:expr) => {
        $map.insert($key, $action);
    };
}

/// Drive command vocabulary sent as the message payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Command {
    #[cfg(test)]
    pub const ALL: [Command; 5] = [
        Command::Forward,
        Command::Backward,
        Command::Left,
        Command::Right,
        Command::Stop,
    ];

    /// Literal token as it goes on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Forward => "Forward",
            Command::Backward => "Backward",
            Command::Left => "Left",
            Command::Right => "Right",
            Command::Stop => "Stop",
        }
    }

    pub fn payload(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the dispatch loop does with one key press
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAction {
    Publish(Command),
    Quit,
    Ignore,
}

/// Fixed lookup table from lower-case keys to actions
///
/// The table is stateless: the same key always yields the same action, there is no
/// debouncing and nothing is remembered between presses.
#[derive(Debug, Clone)]
pub struct KeyboardMapping {
    bindings: HashMap<char, KeyAction>,
}

impl Default for KeyboardMapping {
    fn default() -> Self {
        Self::default_config()
    }
}

impl KeyboardMapping {
    /// WASD to drive, space to stop, q to quit
    pub fn default_config() -> Self {
        let mut bindings = HashMap::new();
        bind!(bindings, 'w', KeyAction::Publish(Command::Forward));
        bind!(bindings, 's', KeyAction::Publish(Command::Backward));
        bind!(bindings, 'a', KeyAction::Publish(Command::Left));
        bind!(bindings, 'd', KeyAction::Publish(Command::Right));
        bind!(bindings, ' ', KeyAction::Publish(Command::Stop));
        bind!(bindings, 'q', KeyAction::Quit);

        Self { bindings }
    }

    /// Resolves a key, ignoring case. Unbound keys resolve to [`KeyAction::Ignore`].
    pub fn resolve(&self, key: &Key) -> KeyAction {
        let Key::Char(c) = key else {
            debug!("Ignoring non-character key {:?}", key);
            return KeyAction::Ignore;
        };

        let normalized = c.to_lowercase().next().unwrap_or(*c);
        self.bindings
            .get(&normalized)
            .copied()
            .unwrap_or(KeyAction::Ignore)
    }

    /// Human readable key legend for the startup banner
    pub fn legend(&self) -> String {
        let mut entries: Vec<(char, KeyAction)> =
            self.bindings.iter().map(|(k, a)| (*k, *a)).collect();
        entries.sort_by_key(|(k, _)| *k);

        entries
            .into_iter()
            .map(|(key, action)| {
                let key = if key == ' ' {
                    "space".to_string()
                } else {
                    key.to_string()
                };
                match action {
                    KeyAction::Publish(command) => format!("{key}={command}"),
                    KeyAction::Quit => format!("{key}=quit"),
                    KeyAction::Ignore => format!("{key}=-"),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_has_exactly_one_key() {
        let mapping = KeyboardMapping::default_config();
        for command in Command::ALL {
            let keys: Vec<char> = "wsad "
                .chars()
                .filter(|c| mapping.resolve(&Key::Char(*c)) == KeyAction::Publish(command))
                .collect();
            assert_eq!(keys.len(), 1, "{command} should be bound once");
        }
    }

    #[test]
    fn default_table() {
        let mapping = KeyboardMapping::default_config();
        let expect = [
            ('w', KeyAction::Publish(Command::Forward)),
            ('s', KeyAction::Publish(Command::Backward)),
            ('a', KeyAction::Publish(Command::Left)),
            ('d', KeyAction::Publish(Command::Right)),
            (' ', KeyAction::Publish(Command::Stop)),
            ('q', KeyAction::Quit),
        ];
        for (key, action) in expect {
            assert_eq!(mapping.resolve(&Key::Char(key)), action, "key {key:?}");
        }
    }

    #[test]
    fn lookup_ignores_case() {
        let mapping = KeyboardMapping::default_config();
        for key in ['w', 's', 'a', 'd', 'q'] {
            let upper = key.to_ascii_uppercase();
            assert_eq!(
                mapping.resolve(&Key::Char(key)),
                mapping.resolve(&Key::Char(upper))
            );
        }
    }

    #[test]
    fn unbound_keys_are_ignored() {
        let mapping = KeyboardMapping::default_config();
        for key in ['x', 'e', '1', '\n', '\r', 'ß'] {
            assert_eq!(mapping.resolve(&Key::Char(key)), KeyAction::Ignore);
        }
        assert_eq!(
            mapping.resolve(&Key::Other("Esc".into())),
            KeyAction::Ignore
        );
    }

    #[test]
    fn wire_tokens_are_literal() {
        let tokens: Vec<&str> = Command::ALL.iter().map(Command::as_str).collect();
        assert_eq!(tokens, ["Forward", "Backward", "Left", "Right", "Stop"]);
        assert_eq!(Command::Stop.payload(), b"Stop");
    }

    #[test]
    fn legend_lists_all_bindings() {
        let legend = KeyboardMapping::default_config().legend();
        assert_eq!(
            legend,
            "space=Stop, a=Left, d=Right, q=quit, s=Backward, w=Forward"
        );
    }
}
