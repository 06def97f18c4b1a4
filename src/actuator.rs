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

//! Input actuator boundary
//!
//! An actuator performs one keyboard or mouse action and keeps no playback
//! state. Failures are returned and the controller decides what to do.

use anyhow::Result;
use tracing::info;

use crate::types::{ActionKind, KeyCode, KeyPhase, MouseButton, MousePhase};

pub trait InputActuator: Send + Sync {
    fn key_down(&self, code: KeyCode) -> Result<()>;
    fn key_up(&self, code: KeyCode) -> Result<()>;
    fn mouse_move(&self, x: i32, y: i32) -> Result<()>;
    fn mouse_button(&self, button: MouseButton, x: i32, y: i32, phase: MousePhase) -> Result<()>;
}

/// Route one action to the matching actuator call.
pub fn dispatch(actuator: &dyn InputActuator, kind: &ActionKind) -> Result<()> {
    match kind {
        ActionKind::Key {
            code,
            phase: KeyPhase::Down,
        } => actuator.key_down(*code),
        ActionKind::Key {
            code,
            phase: KeyPhase::Up,
        } => actuator.key_up(*code),
        ActionKind::Mouse {
            x,
            y,
            phase: MousePhase::Move,
            ..
        } => actuator.mouse_move(*x, *y),
        ActionKind::Mouse {
            button,
            x,
            y,
            phase,
        } => actuator.mouse_button(*button, *x, *y, *phase),
        ActionKind::Delay => Ok(()),
    }
}

/// Dry-run actuator: every action becomes a log line.
pub struct TracingActuator;

impl InputActuator for TracingActuator {
    fn key_down(&self, code: KeyCode) -> Result<()> {
        info!(target: "macrocast::input", "key down {}", code);
        Ok(())
    }

    fn key_up(&self, code: KeyCode) -> Result<()> {
        info!(target: "macrocast::input", "key up {}", code);
        Ok(())
    }

    fn mouse_move(&self, x: i32, y: i32) -> Result<()> {
        info!(target: "macrocast::input", "mouse move {},{}", x, y);
        Ok(())
    }

    fn mouse_button(&self, button: MouseButton, x: i32, y: i32, phase: MousePhase) -> Result<()> {
        info!(target: "macrocast::input", "mouse {:?} {:?} at {},{}", phase, button, x, y);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl InputActuator for Recorder {
        fn key_down(&self, code: KeyCode) -> Result<()> {
            self.0.lock().unwrap().push(format!("down {}", code));
            Ok(())
        }
        fn key_up(&self, code: KeyCode) -> Result<()> {
            self.0.lock().unwrap().push(format!("up {}", code));
            Ok(())
        }
        fn mouse_move(&self, x: i32, y: i32) -> Result<()> {
            self.0.lock().unwrap().push(format!("move {},{}", x, y));
            Ok(())
        }
        fn mouse_button(&self, button: MouseButton, x: i32, y: i32, phase: MousePhase) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push(format!("{:?} {:?} {},{}", phase, button, x, y));
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_routes_each_variant() {
        let recorder = Recorder::default();
        let kinds = [
            ActionKind::Key {
                code: KeyCode::Char('a'),
                phase: KeyPhase::Down,
            },
            ActionKind::Key {
                code: KeyCode::Char('a'),
                phase: KeyPhase::Up,
            },
            ActionKind::Mouse {
                button: MouseButton::Left,
                x: 5,
                y: 6,
                phase: MousePhase::Move,
            },
            ActionKind::Mouse {
                button: MouseButton::Right,
                x: 5,
                y: 6,
                phase: MousePhase::Down,
            },
            ActionKind::Delay,
        ];
        for kind in &kinds {
            dispatch(&recorder, kind).unwrap();
        }
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["down A", "up A", "move 5,6", "Down Right 5,6"]
        );
    }
}
