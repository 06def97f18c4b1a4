// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Terminal key listener
//!
//! Reads key presses from the controlling terminal on a background thread and
//! hands matching combinations to the [`HotkeyDispatcher`].

use anyhow::{Context, Result};
use crossterm::event::{
    Event, KeyCode as TermKey, KeyEvent, KeyEventKind, KeyModifiers, poll, read,
};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::hotkey::{HotkeyDispatcher, KeyCombo, Modifiers};
use crate::types::KeyCode;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Map a terminal key event to a combination, if the key is one we model.
pub fn combo_from_event(event: &KeyEvent) -> Option<KeyCombo> {
    let mut modifiers = Modifiers {
        ctrl: event.modifiers.contains(KeyModifiers::CONTROL),
        alt: event.modifiers.contains(KeyModifiers::ALT),
        shift: event.modifiers.contains(KeyModifiers::SHIFT),
        super_key: event.modifiers.contains(KeyModifiers::SUPER),
    };

    let key = match event.code {
        TermKey::Char(' ') => KeyCode::Space,
        TermKey::Char(c) => KeyCode::Char(c),
        TermKey::Enter => KeyCode::Enter,
        TermKey::Tab => KeyCode::Tab,
        TermKey::BackTab => {
            modifiers.shift = true;
            KeyCode::Tab
        }
        TermKey::Backspace => KeyCode::Backspace,
        TermKey::Esc => KeyCode::Esc,
        TermKey::Up => KeyCode::Up,
        TermKey::Down => KeyCode::Down,
        TermKey::Left => KeyCode::Left,
        TermKey::Right => KeyCode::Right,
        TermKey::Home => KeyCode::Home,
        TermKey::End => KeyCode::End,
        TermKey::PageUp => KeyCode::PageUp,
        TermKey::PageDown => KeyCode::PageDown,
        TermKey::Insert => KeyCode::Insert,
        TermKey::Delete => KeyCode::Delete,
        TermKey::F(n) => KeyCode::F(n),
        _ => return None,
    };

    KeyCombo::new(modifiers, key).ok()
}

pub struct TerminalListener {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    owns_raw_mode: bool,
}

impl TerminalListener {
    /// Start listening. Raw mode is enabled for the listener's lifetime
    /// unless something else already turned it on.
    pub fn spawn(dispatcher: HotkeyDispatcher) -> Result<Self> {
        let owns_raw_mode = std::io::stdin().is_terminal() && !is_raw_mode_enabled().unwrap_or(false);
        if owns_raw_mode {
            enable_raw_mode().context("Failed to enable raw mode")?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("hotkey-listener".into())
            .spawn(move || listen(dispatcher, flag))
            .context("Failed to start hotkey listener")?;

        Ok(Self {
            stop,
            handle: Some(handle),
            owns_raw_mode,
        })
    }

    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if self.owns_raw_mode {
            let _ = disable_raw_mode();
            self.owns_raw_mode = false;
        }
    }
}

impl Drop for TerminalListener {
    fn drop(&mut self) {
        self.halt();
    }
}

fn listen(dispatcher: HotkeyDispatcher, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match poll(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("hotkey listener stopped: {}", e);
                return;
            }
        }

        match read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                if let Some(combo) = combo_from_event(&key) {
                    if dispatcher.dispatch_combo(&combo) {
                        debug!("dispatched {}", combo);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("hotkey listener stopped: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctrl_letter() {
        let event = KeyEvent::new(TermKey::Char('q'), KeyModifiers::CONTROL);
        let combo = combo_from_event(&event).unwrap();
        assert_eq!(combo.to_string(), "Ctrl+Q");
    }

    #[test]
    fn test_shifted_char_matches_registration() {
        let event = KeyEvent::new(TermKey::Char('P'), KeyModifiers::SHIFT | KeyModifiers::CONTROL);
        let combo = combo_from_event(&event).unwrap();
        let expected: KeyCombo = "C-S-p".parse().unwrap();
        assert_eq!(combo.native_id(), expected.native_id());
    }

    #[test]
    fn test_function_and_backtab() {
        let f9 = KeyEvent::new(TermKey::F(9), KeyModifiers::NONE);
        assert_eq!(combo_from_event(&f9).unwrap().to_string(), "F9");

        let backtab = KeyEvent::new(TermKey::BackTab, KeyModifiers::NONE);
        assert_eq!(combo_from_event(&backtab).unwrap().to_string(), "Shift+Tab");

        let caps = KeyEvent::new(TermKey::CapsLock, KeyModifiers::NONE);
        assert!(combo_from_event(&caps).is_none());
    }

    #[test]
    fn test_dispatch_through_dispatcher() {
        let hotkeys = HotkeyDispatcher::new();
        let mut rx = hotkeys.subscribe();
        hotkeys.register("Ctrl+Q", crate::hotkey::HotkeyCommand::Stop);

        let event = KeyEvent::new(TermKey::Char('q'), KeyModifiers::CONTROL);
        assert!(hotkeys.dispatch_combo(&combo_from_event(&event).unwrap()));
        assert_eq!(rx.try_recv().unwrap().combo, "Ctrl+Q");
    }
}
