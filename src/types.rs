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

//! Core types for recorded input timelines

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{BusinessRuleViolation, Error, ValidationError};
use crate::recognition::Template;

/// A key on the keyboard, either a printable character or a named key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    Char(char),
    Esc,
    Enter,
    Tab,
    Backspace,
    Space,
    F(u8),
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    Delete,
    Ctrl,
    Alt,
    Shift,
    Super,
}

impl KeyCode {
    /// Resolve a key name as written in scripts and key combinations.
    pub fn from_name(name: &str) -> Option<Self> {
        let key = match name {
            "esc" | "escape" => KeyCode::Esc,
            "space" => KeyCode::Space,
            "ret" | "return" | "enter" => KeyCode::Enter,
            "tab" => KeyCode::Tab,
            "backspace" | "bs" => KeyCode::Backspace,
            "up" => KeyCode::Up,
            "down" => KeyCode::Down,
            "right" => KeyCode::Right,
            "left" => KeyCode::Left,
            "home" => KeyCode::Home,
            "end" => KeyCode::End,
            "pageup" | "pgup" => KeyCode::PageUp,
            "pagedown" | "pgdn" => KeyCode::PageDown,
            "insert" | "ins" => KeyCode::Insert,
            "delete" | "del" => KeyCode::Delete,
            "ctrl" | "control" => KeyCode::Ctrl,
            "alt" | "meta" => KeyCode::Alt,
            "shift" => KeyCode::Shift,
            "super" | "cmd" | "win" => KeyCode::Super,
            _ => {
                if let Some(n) = name
                    .strip_prefix(['F', 'f'])
                    .and_then(|n| n.parse::<u8>().ok())
                {
                    if (1..=24).contains(&n) {
                        return Some(KeyCode::F(n));
                    }
                }
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => KeyCode::Char(c),
                    _ => {
                        let lower = name.to_ascii_lowercase();
                        if lower != name {
                            return KeyCode::from_name(&lower);
                        }
                        return None;
                    }
                }
            }
        };
        Some(key)
    }

    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            KeyCode::Ctrl | KeyCode::Alt | KeyCode::Shift | KeyCode::Super
        )
    }

    /// Stable 16-bit identifier used when packing native hotkey ids.
    pub fn native_code(&self) -> u16 {
        match self {
            KeyCode::Char(c) => {
                let c = c.to_ascii_lowercase() as u32;
                (c & 0x7fff) as u16
            }
            KeyCode::F(n) => 0x8000 | *n as u16,
            other => {
                0x8100
                    | match other {
                        KeyCode::Esc => 1,
                        KeyCode::Enter => 2,
                        KeyCode::Tab => 3,
                        KeyCode::Backspace => 4,
                        KeyCode::Space => 5,
                        KeyCode::Up => 6,
                        KeyCode::Down => 7,
                        KeyCode::Left => 8,
                        KeyCode::Right => 9,
                        KeyCode::Home => 10,
                        KeyCode::End => 11,
                        KeyCode::PageUp => 12,
                        KeyCode::PageDown => 13,
                        KeyCode::Insert => 14,
                        KeyCode::Delete => 15,
                        KeyCode::Ctrl => 16,
                        KeyCode::Alt => 17,
                        KeyCode::Shift => 18,
                        KeyCode::Super => 19,
                        KeyCode::Char(_) | KeyCode::F(_) => 0,
                    }
            }
        }
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCode::Char(c) => write!(f, "{}", c.to_ascii_uppercase()),
            KeyCode::F(n) => write!(f, "F{}", n),
            KeyCode::Esc => write!(f, "Esc"),
            KeyCode::Enter => write!(f, "Enter"),
            KeyCode::Tab => write!(f, "Tab"),
            KeyCode::Backspace => write!(f, "Backspace"),
            KeyCode::Space => write!(f, "Space"),
            KeyCode::Up => write!(f, "Up"),
            KeyCode::Down => write!(f, "Down"),
            KeyCode::Left => write!(f, "Left"),
            KeyCode::Right => write!(f, "Right"),
            KeyCode::Home => write!(f, "Home"),
            KeyCode::End => write!(f, "End"),
            KeyCode::PageUp => write!(f, "PageUp"),
            KeyCode::PageDown => write!(f, "PageDown"),
            KeyCode::Insert => write!(f, "Insert"),
            KeyCode::Delete => write!(f, "Delete"),
            KeyCode::Ctrl => write!(f, "Ctrl"),
            KeyCode::Alt => write!(f, "Alt"),
            KeyCode::Shift => write!(f, "Shift"),
            KeyCode::Super => write!(f, "Super"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl FromStr for MouseButton {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" | "l" => Ok(MouseButton::Left),
            "right" | "r" => Ok(MouseButton::Right),
            "middle" | "m" => Ok(MouseButton::Middle),
            other => Err(ValidationError::Unknown {
                kind: "mouse button",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MousePhase {
    Down,
    Up,
    Move,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Key {
        code: KeyCode,
        phase: KeyPhase,
    },
    Mouse {
        button: MouseButton,
        x: i32,
        y: i32,
        phase: MousePhase,
    },
    Delay,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Key { .. } => "key",
            ActionKind::Mouse { .. } => "mouse",
            ActionKind::Delay => "delay",
        }
    }
}

/// Variant selector for filtered sequence views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionFilter {
    Key,
    Mouse,
    Delay,
}

/// One recorded input step with the delay that precedes it.
#[derive(Debug, Clone, PartialEq)]
pub struct GameAction {
    id: Uuid,
    kind: ActionKind,
    delay_ms: u64,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

fn checked_delay(delay_ms: i64) -> Result<u64, ValidationError> {
    u64::try_from(delay_ms).map_err(|_| ValidationError::Negative {
        field: "delay",
        value: delay_ms,
    })
}

impl GameAction {
    fn new(kind: ActionKind, delay_ms: i64) -> Result<Self, ValidationError> {
        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            delay_ms: checked_delay(delay_ms)?,
            description: None,
            created_at: Utc::now(),
        })
    }

    pub fn key(code: KeyCode, phase: KeyPhase, delay_ms: i64) -> Result<Self, ValidationError> {
        Self::new(ActionKind::Key { code, phase }, delay_ms)
    }

    pub fn mouse(
        button: MouseButton,
        x: i32,
        y: i32,
        phase: MousePhase,
        delay_ms: i64,
    ) -> Result<Self, ValidationError> {
        Self::new(
            ActionKind::Mouse {
                button,
                x,
                y,
                phase,
            },
            delay_ms,
        )
    }

    pub fn delay(delay_ms: i64) -> Result<Self, ValidationError> {
        Self::new(ActionKind::Delay, delay_ms)
    }

    pub fn with_description(mut self, description: &str) -> Result<Self, ValidationError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(ValidationError::Empty {
                field: "description",
            });
        }
        self.description = Some(description.to_string());
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn delay_duration(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn matches(&self, filter: ActionFilter) -> bool {
        matches!(
            (&self.kind, filter),
            (ActionKind::Key { .. }, ActionFilter::Key)
                | (ActionKind::Mouse { .. }, ActionFilter::Mouse)
                | (ActionKind::Delay, ActionFilter::Delay)
        )
    }

    /// Move a mouse action to a new screen position.
    pub fn set_position(&mut self, new_x: i32, new_y: i32) -> Result<(), BusinessRuleViolation> {
        match &mut self.kind {
            ActionKind::Mouse { x, y, .. } => {
                *x = new_x;
                *y = new_y;
                Ok(())
            }
            other => Err(BusinessRuleViolation::NotMouseAction {
                kind: other.label(),
            }),
        }
    }
}

impl fmt::Display for GameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ActionKind::Key { code, phase } => write!(f, "key {:?} {}", phase, code)?,
            ActionKind::Mouse {
                x,
                y,
                phase: MousePhase::Move,
                ..
            } => write!(f, "mouse move {},{}", x, y)?,
            ActionKind::Mouse {
                button,
                x,
                y,
                phase,
            } => write!(f, "mouse {:?} {:?} {},{}", phase, button, x, y)?,
            ActionKind::Delay => write!(f, "wait")?,
        }
        write!(f, " +{}ms", self.delay_ms)
    }
}

/// What to do when a recognition gate cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Drop the gated action and continue with the next one.
    Skip,
    /// Step back to the previous action, replay it and try the gate again.
    RepeatLast,
    /// End the sequence.
    Abort,
}

impl FromStr for FallbackPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(FallbackPolicy::Skip),
            "repeat" | "repeat-last" => Ok(FallbackPolicy::RepeatLast),
            "abort" => Ok(FallbackPolicy::Abort),
            other => Err(ValidationError::Unknown {
                kind: "fallback policy",
                name: other.to_string(),
            }),
        }
    }
}

/// Which rules an action consults before it is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionPoint {
    AllRules,
    Rule(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    pub require_progress: bool,
}

/// Out-of-band annotations attached to a single action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionHooks {
    pub gate: Option<Template>,
    pub decision: Option<DecisionPoint>,
    pub trigger: Option<Trigger>,
}

impl ActionHooks {
    pub fn is_empty(&self) -> bool {
        self.gate.is_none() && self.decision.is_none() && self.trigger.is_none()
    }
}

/// Ordered list of actions; insertion order is playback order.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSequence {
    name: String,
    actions: Vec<GameAction>,
    hooks: HashMap<Uuid, ActionHooks>,
    fallback: Option<FallbackPolicy>,
}

impl ActionSequence {
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty {
                field: "sequence name",
            });
        }
        Ok(Self {
            name: name.to_string(),
            actions: Vec::new(),
            hooks: HashMap::new(),
            fallback: None,
        })
    }

    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fallback(&self) -> Option<FallbackPolicy> {
        self.fallback
    }

    pub fn set_fallback(&mut self, policy: FallbackPolicy) {
        self.fallback = Some(policy);
    }

    pub fn push(&mut self, action: GameAction) {
        self.actions.push(action);
    }

    pub fn push_with_hooks(&mut self, action: GameAction, hooks: ActionHooks) {
        if !hooks.is_empty() {
            self.hooks.insert(action.id(), hooks);
        }
        self.actions.push(action);
    }

    pub fn insert(&mut self, index: usize, action: GameAction) -> Result<(), Error> {
        if index > self.actions.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.actions.len(),
            });
        }
        self.actions.insert(index, action);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<GameAction, Error> {
        if index >= self.actions.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.actions.len(),
            });
        }
        let action = self.actions.remove(index);
        self.hooks.remove(&action.id());
        Ok(action)
    }

    pub fn get(&self, index: usize) -> Result<&GameAction, Error> {
        self.actions.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.actions.len(),
        })
    }

    /// Actions in `start..end`; any bound past the end is an error.
    pub fn range(&self, start: usize, end: usize) -> Result<&[GameAction], Error> {
        if start > end || end > self.actions.len() {
            return Err(Error::IndexOutOfRange {
                index: end.max(start),
                len: self.actions.len(),
            });
        }
        Ok(&self.actions[start..end])
    }

    pub fn filtered(&self, filter: ActionFilter) -> impl Iterator<Item = &GameAction> {
        self.actions.iter().filter(move |a| a.matches(filter))
    }

    pub fn actions(&self) -> &[GameAction] {
        &self.actions
    }

    pub fn hooks(&self, id: &Uuid) -> Option<&ActionHooks> {
        self.hooks.get(id)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.actions.iter().map(GameAction::delay_ms).sum()
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_delay_ms())
    }

    pub fn has_gates(&self) -> bool {
        self.hooks.values().any(|h| h.gate.is_some())
    }

    /// Gated actions must say what happens when their gate fails.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.has_gates() && self.fallback.is_none() {
            return Err(ValidationError::MissingFallback(self.name.clone()));
        }
        Ok(())
    }
}
