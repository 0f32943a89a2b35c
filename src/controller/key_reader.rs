//! Key readers: blocking sources of single key presses
//!
//! [`TerminalKeys`] puts the terminal into raw mode for the duration of one read only, so
//! everything printed between reads behaves like ordinary line output. [`StdinKeys`] reads
//! piped input byte by byte and is picked automatically when stdin is not a terminal.

use crate::error::InputError;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io::{self, Read};
use tracing::{debug, warn};

/// One key press as seen by the dispatch loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    Char(char),
    /// Non-character keys (arrows, function keys, escape), kept only for logging
    Other(String),
}

/// Blocking source of key presses
///
/// `read_key` blocks until a key is available. Any error ends the dispatch loop.
pub trait KeySource: Send {
    fn read_key(&mut self) -> Result<Key, InputError>;
}

impl<K: KeySource + ?Sized> KeySource for Box<K> {
    fn read_key(&mut self) -> Result<Key, InputError> {
        (**self).read_key()
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Raw-mode terminal reader
#[derive(Debug, Default)]
pub struct TerminalKeys;

impl TerminalKeys {
    pub fn new() -> Self {
        Self
    }

    fn translate(key: KeyEvent) -> Result<Key, InputError> {
        // Raw mode swallows SIGINT, so Ctrl-C and Ctrl-D arrive as keys
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            if let KeyCode::Char('c' | 'C' | 'd' | 'D') = key.code {
                return Err(InputError::Interrupted);
            }
        }

        Ok(match key.code {
            KeyCode::Char(c) => Key::Char(c),
            other => Key::Other(format!("{:?}", other)),
        })
    }
}

impl KeySource for TerminalKeys {
    fn read_key(&mut self) -> Result<Key, InputError> {
        let _raw = RawModeGuard::enable()?;

        loop {
            match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => {
                    return Self::translate(key);
                }
                other => debug!("Skipping terminal event {:?}", other),
            }
        }
    }
}

/// Byte-wise reader over any `Read`, usually piped stdin
pub struct StdinKeys<R = io::Stdin> {
    input: R,
}

impl StdinKeys {
    pub fn new() -> Self {
        Self::from_reader(io::stdin())
    }
}

impl Default for StdinKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read> StdinKeys<R> {
    pub fn from_reader(input: R) -> Self {
        Self { input }
    }
}

impl<R: Read + Send> KeySource for StdinKeys<R> {
    fn read_key(&mut self) -> Result<Key, InputError> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Err(InputError::Closed),
                Ok(_) if byte[0].is_ascii() => return Ok(Key::Char(byte[0] as char)),
                Ok(_) => return Ok(Key::Other(format!("0x{:02x}", byte[0]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(InputError::Terminal(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    #[test]
    fn stdin_keys_yield_bytes_then_closed() {
        let mut keys = StdinKeys::from_reader(&b"wQ "[..]);
        assert_eq!(keys.read_key().unwrap(), Key::Char('w'));
        assert_eq!(keys.read_key().unwrap(), Key::Char('Q'));
        assert_eq!(keys.read_key().unwrap(), Key::Char(' '));
        assert!(matches!(keys.read_key(), Err(InputError::Closed)));
    }

    #[test]
    fn stdin_keys_flag_non_ascii() {
        let mut keys = StdinKeys::from_reader(&[0xc3u8][..]);
        assert_eq!(keys.read_key().unwrap(), Key::Other("0xc3".into()));
    }

    #[test]
    fn ctrl_c_interrupts() {
        let result = TerminalKeys::translate(press(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert!(matches!(result, Err(InputError::Interrupted)));
    }

    #[test]
    fn plain_and_special_keys() {
        let key = TerminalKeys::translate(press(KeyCode::Char('W'), KeyModifiers::SHIFT)).unwrap();
        assert_eq!(key, Key::Char('W'));

        let key = TerminalKeys::translate(press(KeyCode::Esc, KeyModifiers::NONE)).unwrap();
        assert_eq!(key, Key::Other("Esc".into()));
    }
}
