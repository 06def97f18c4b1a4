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

//! Pseudo-terminal input actuator
//!
//! Spawns a program in a PTY and replays key and mouse actions into it as
//! terminal byte sequences. Terminals have no key-release events, so key up
//! only matters for modifiers, which are held and folded into the next key.

use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use std::io::{IsTerminal, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use crate::actuator::InputActuator;
use crate::hotkey::Modifiers;
use crate::types::{KeyCode, MouseButton, MousePhase};

// RAII guard for terminal raw mode - only enables if stdout is a TTY
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn new() -> Result<Self> {
        let enabled = if std::io::stdout().is_terminal() {
            enable_raw_mode().context("Failed to enable raw mode")?;
            true
        } else {
            false
        };
        Ok(RawModeGuard { enabled })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = disable_raw_mode();
        }
    }
}

fn named_key(code: KeyCode) -> Option<&'static str> {
    let seq = match code {
        KeyCode::Esc => "\x1b",
        KeyCode::Space => " ",
        KeyCode::Enter => "\r",
        KeyCode::Tab => "\t",
        KeyCode::Backspace => "\x7f",
        KeyCode::F(1) => "\x1bOP",
        KeyCode::F(2) => "\x1bOQ",
        KeyCode::F(3) => "\x1bOR",
        KeyCode::F(4) => "\x1bOS",
        KeyCode::F(5) => "\x1b[15~",
        KeyCode::F(6) => "\x1b[17~",
        KeyCode::F(7) => "\x1b[18~",
        KeyCode::F(8) => "\x1b[19~",
        KeyCode::F(9) => "\x1b[20~",
        KeyCode::F(10) => "\x1b[21~",
        KeyCode::F(11) => "\x1b[23~",
        KeyCode::F(12) => "\x1b[24~",
        KeyCode::Up => "\x1b[A",
        KeyCode::Down => "\x1b[B",
        KeyCode::Right => "\x1b[C",
        KeyCode::Left => "\x1b[D",
        KeyCode::Home => "\x1b[H",
        KeyCode::End => "\x1b[F",
        KeyCode::PageUp => "\x1b[5~",
        KeyCode::PageDown => "\x1b[6~",
        KeyCode::Insert => "\x1b[2~",
        KeyCode::Delete => "\x1b[3~",
        _ => return None,
    };
    Some(seq)
}

fn ctrl_char(c: char) -> Option<char> {
    match c.to_ascii_lowercase() {
        // Ctrl-letter maps to ASCII 1-26
        l if l.is_ascii_lowercase() => char::from_u32((l as u32) - ('a' as u32) + 1),
        ' ' | '@' => Some('\x00'),
        '[' => Some('\x1b'),
        '\\' => Some('\x1c'),
        ']' => Some('\x1d'),
        _ => None,
    }
}

/// Bytes a terminal would receive for `code` pressed with `mods`, or `None`
/// when the key has no terminal encoding (F13 and up, bare modifiers).
pub fn key_bytes(code: KeyCode, mods: Modifiers) -> Option<String> {
    if code.is_modifier() {
        return None;
    }

    let base = match code {
        KeyCode::Char(c) if mods.shift => c.to_uppercase().collect::<String>(),
        KeyCode::Char(c) => c.to_string(),
        other => named_key(other)?.to_string(),
    };

    let ctrl_seq = if mods.ctrl {
        match code {
            KeyCode::Char(c) => ctrl_char(c).map(String::from),
            KeyCode::Space => Some("\x00".to_string()),
            // special keys don't have standard Ctrl combinations
            _ => None,
        }
    } else {
        None
    };

    match (mods.ctrl, mods.alt) {
        (true, true) => Some(format!("\x1b{}", ctrl_seq.unwrap_or(base))),
        (true, false) => Some(ctrl_seq.unwrap_or(base)),
        (false, true) => Some(format!("\x1b{}", base)),
        (false, false) => Some(base),
    }
}

/// SGR (1006) mouse report; `x` and `y` are zero-based cell coordinates.
pub fn mouse_report(
    button: MouseButton,
    held: Option<MouseButton>,
    x: i32,
    y: i32,
    phase: MousePhase,
    mods: Modifiers,
) -> String {
    let code = |b: MouseButton| match b {
        MouseButton::Left => 0,
        MouseButton::Middle => 1,
        MouseButton::Right => 2,
    };

    let mut cb = match phase {
        MousePhase::Down | MousePhase::Up => code(button),
        // motion flag, plus 3 when no button is held
        MousePhase::Move => 32 + held.map(code).unwrap_or(3),
    };
    if mods.shift {
        cb += 4;
    }
    if mods.alt {
        cb += 8;
    }
    if mods.ctrl {
        cb += 16;
    }

    let suffix = if phase == MousePhase::Up { 'm' } else { 'M' };
    format!("\x1b[<{};{};{}{}", cb, x.max(0) + 1, y.max(0) + 1, suffix)
}

#[derive(Debug, Default)]
struct InputState {
    modifiers: Modifiers,
    button: Option<MouseButton>,
}

pub struct PtyActuator {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    state: Mutex<InputState>,
    reader_thread: Option<thread::JoinHandle<()>>,
    _raw_mode_guard: RawModeGuard,
}

impl PtyActuator {
    /// Spawn `shell` in a `cols` x `rows` pseudo-terminal, echoing its output
    /// to stdout.
    pub fn spawn(shell: &str, cols: u16, rows: u16) -> Result<Self> {
        // Enable raw mode before PTY creation for proper escape sequence handling
        let raw_mode_guard = RawModeGuard::new()?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to create PTY")?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");
        let _child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {} in PTY", shell))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to get PTY writer")?;

        let reader_thread = thread::spawn(move || {
            let mut stdout = std::io::stdout();
            let mut buffer = [0u8; 8192];
            while let Ok(n) = reader.read(&mut buffer) {
                if n == 0 || stdout.write_all(&buffer[..n]).is_err() || stdout.flush().is_err() {
                    break;
                }
            }
        });

        debug!("spawned {} in a {}x{} pty", shell, cols, rows);
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            state: Mutex::new(InputState::default()),
            reader_thread: Some(reader_thread),
            _raw_mode_guard: raw_mode_guard,
        })
    }

    fn input_state(&self) -> MutexGuard<'_, InputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, data: &str) -> Result<()> {
        trace!("pty <- {:?}", data);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = writer.as_mut().context("PTY writer has been closed")?;
        writer
            .write_all(data.as_bytes())
            .context("Failed to write to PTY")?;
        writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    fn set_modifier(&self, code: KeyCode, held: bool) {
        let mut state = self.input_state();
        match code {
            KeyCode::Ctrl => state.modifiers.ctrl = held,
            KeyCode::Alt => state.modifiers.alt = held,
            KeyCode::Shift => state.modifiers.shift = held,
            KeyCode::Super => state.modifiers.super_key = held,
            _ => {}
        }
    }
}

impl InputActuator for PtyActuator {
    fn key_down(&self, code: KeyCode) -> Result<()> {
        if code.is_modifier() {
            self.set_modifier(code, true);
            return Ok(());
        }
        let mods = self.input_state().modifiers;
        let bytes = key_bytes(code, mods)
            .with_context(|| format!("{} has no terminal encoding", code))?;
        self.send(&bytes)
            .with_context(|| format!("key down {}", code))
    }

    fn key_up(&self, code: KeyCode) -> Result<()> {
        if code.is_modifier() {
            self.set_modifier(code, false);
        }
        Ok(())
    }

    fn mouse_move(&self, x: i32, y: i32) -> Result<()> {
        let (mods, held) = {
            let state = self.input_state();
            (state.modifiers, state.button)
        };
        let report = mouse_report(MouseButton::Left, held, x, y, MousePhase::Move, mods);
        self.send(&report)
            .with_context(|| format!("mouse move {},{}", x, y))
    }

    fn mouse_button(&self, button: MouseButton, x: i32, y: i32, phase: MousePhase) -> Result<()> {
        let (mods, held) = {
            let mut state = self.input_state();
            let held = state.button;
            match phase {
                MousePhase::Down => state.button = Some(button),
                MousePhase::Up => state.button = None,
                MousePhase::Move => {}
            }
            (state.modifiers, held)
        };
        let report = mouse_report(button, held, x, y, phase, mods);
        self.send(&report)
            .with_context(|| format!("mouse {:?} {:?} at {},{}", phase, button, x, y))
    }
}

impl Drop for PtyActuator {
    fn drop(&mut self) {
        // Close writer to signal EOF
        drop(
            self.writer
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        // Wait for reader thread to ensure all output is flushed before raw mode is disabled
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }

        // Allow time for parent terminal to respond to any terminal queries
        thread::sleep(Duration::from_millis(100));

        // Drain stdin to prevent terminal query responses from appearing as garbage after exit
        if std::io::stdin().is_terminal() {
            use crossterm::event::{poll, read};
            while poll(Duration::from_millis(0)).unwrap_or(false) {
                let _ = read();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mods(ctrl: bool, alt: bool, shift: bool) -> Modifiers {
        Modifiers {
            ctrl,
            alt,
            shift,
            super_key: false,
        }
    }

    #[test]
    fn test_plain_keys() {
        let none = Modifiers::default();
        assert_eq!(key_bytes(KeyCode::Char('a'), none).as_deref(), Some("a"));
        assert_eq!(key_bytes(KeyCode::Enter, none).as_deref(), Some("\r"));
        assert_eq!(key_bytes(KeyCode::F(5), none).as_deref(), Some("\x1b[15~"));
        assert_eq!(key_bytes(KeyCode::F(20), none), None);
        assert_eq!(key_bytes(KeyCode::Shift, none), None);
    }

    #[test]
    fn test_ctrl_keys() {
        let ctrl = mods(true, false, false);
        assert_eq!(key_bytes(KeyCode::Char('c'), ctrl).as_deref(), Some("\x03"));
        assert_eq!(key_bytes(KeyCode::Space, ctrl).as_deref(), Some("\x00"));
        assert_eq!(key_bytes(KeyCode::Char('['), ctrl).as_deref(), Some("\x1b"));
        assert_eq!(
            key_bytes(KeyCode::Char('x'), mods(true, true, false)).as_deref(),
            Some("\x1b\x18")
        );
    }

    #[test]
    fn test_alt_and_shift() {
        assert_eq!(
            key_bytes(KeyCode::Enter, mods(false, true, false)).as_deref(),
            Some("\x1b\r")
        );
        assert_eq!(
            key_bytes(KeyCode::Char('q'), mods(false, false, true)).as_deref(),
            Some("Q")
        );
    }

    #[test]
    fn test_sgr_mouse_reports() {
        let none = Modifiers::default();
        assert_eq!(
            mouse_report(MouseButton::Left, None, 9, 4, MousePhase::Down, none),
            "\x1b[<0;10;5M"
        );
        assert_eq!(
            mouse_report(MouseButton::Right, None, 0, 0, MousePhase::Up, none),
            "\x1b[<2;1;1m"
        );
        assert_eq!(
            mouse_report(MouseButton::Left, None, 3, 3, MousePhase::Move, none),
            "\x1b[<35;4;4M"
        );
        assert_eq!(
            mouse_report(
                MouseButton::Left,
                Some(MouseButton::Left),
                3,
                3,
                MousePhase::Move,
                mods(true, false, false)
            ),
            "\x1b[<48;4;4M"
        );
    }
}
