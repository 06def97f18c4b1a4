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

//! Hotkey registry and dispatch
//!
//! Combinations are normalized to `Ctrl+Alt+Shift+Super+Key` and identified
//! natively by a 32-bit id: modifier bits in the high half, the key code in
//! the low half. Dispatch never calls back into playback; it publishes a
//! [`HotkeyEvent`] that subscribers drain on their own task.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::types::KeyCode;

const CTRL: u32 = 1 << 16;
const ALT: u32 = 1 << 17;
const SHIFT: u32 = 1 << 18;
const SUPER: u32 = 1 << 19;

/// Combinations the OS keeps for itself.
pub const DEFAULT_RESERVED: &[&str] = &["Ctrl+Alt+Delete", "Alt+Tab", "Alt+F4", "Super+L"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub super_key: bool,
}

impl Modifiers {
    fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.ctrl {
            bits |= CTRL;
        }
        if self.alt {
            bits |= ALT;
        }
        if self.shift {
            bits |= SHIFT;
        }
        if self.super_key {
            bits |= SUPER;
        }
        bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyCombo {
    modifiers: Modifiers,
    key: KeyCode,
}

impl KeyCombo {
    pub fn new(modifiers: Modifiers, key: KeyCode) -> Result<Self, ValidationError> {
        if key.is_modifier() {
            return Err(ValidationError::KeyCombo(format!(
                "{} cannot be the final key of a combination",
                key
            )));
        }
        // Shift+a and A are the same keystroke
        let key = match key {
            KeyCode::Char(c) => KeyCode::Char(c.to_ascii_lowercase()),
            other => other,
        };
        Ok(Self { modifiers, key })
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    pub fn key(&self) -> KeyCode {
        self.key
    }

    pub fn native_id(&self) -> u32 {
        self.modifiers.bits() | self.key.native_code() as u32
    }
}

impl FromStr for KeyCombo {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parser::parse_key_combo(s)
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.modifiers;
        for (on, name) in [
            (m.ctrl, "Ctrl"),
            (m.alt, "Alt"),
            (m.shift, "Shift"),
            (m.super_key, "Super"),
        ] {
            if on {
                write!(f, "{}+", name)?;
            }
        }
        write!(f, "{}", self.key)
    }
}

/// Canonical spelling of a combination, e.g. `c-s-p` becomes `Ctrl+Shift+P`.
pub fn normalize_combo(spec: &str) -> Result<String, ValidationError> {
    spec.parse::<KeyCombo>().map(|c| c.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeyCommand {
    Play,
    Pause,
    Resume,
    TogglePause,
    Stop,
}

impl FromStr for HotkeyCommand {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(HotkeyCommand::Play),
            "pause" => Ok(HotkeyCommand::Pause),
            "resume" => Ok(HotkeyCommand::Resume),
            "toggle" | "toggle-pause" => Ok(HotkeyCommand::TogglePause),
            "stop" => Ok(HotkeyCommand::Stop),
            other => Err(ValidationError::Unknown {
                kind: "hotkey command",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HotkeyToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotkeyEvent {
    pub token: HotkeyToken,
    pub combo: String,
    pub command: HotkeyCommand,
}

#[derive(Debug, Clone)]
struct Binding {
    token: HotkeyToken,
    combo: KeyCombo,
    command: HotkeyCommand,
}

#[derive(Debug, Default)]
struct Registry {
    bindings: HashMap<u32, Binding>,
    next_token: u64,
}

struct Inner {
    registry: Mutex<Registry>,
    reserved: Mutex<HashSet<u32>>,
    events: broadcast::Sender<HotkeyEvent>,
}

/// Cloneable handle; clones share one registry.
#[derive(Clone)]
pub struct HotkeyDispatcher {
    inner: Arc<Inner>,
}

impl Default for HotkeyDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HotkeyDispatcher {
    pub fn new() -> Self {
        let dispatcher = Self::without_reserved();
        for spec in DEFAULT_RESERVED {
            if let Err(e) = dispatcher.reserve(spec) {
                warn!("could not reserve {}: {}", spec, e);
            }
        }
        dispatcher
    }

    pub fn without_reserved() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    bindings: HashMap::new(),
                    next_token: 1,
                }),
                reserved: Mutex::new(HashSet::new()),
                events,
            }),
        }
    }

    pub fn reserve(&self, spec: &str) -> Result<(), ValidationError> {
        let combo: KeyCombo = spec.parse()?;
        self.inner
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(combo.native_id());
        Ok(())
    }

    fn is_reserved(&self, combo: &KeyCombo) -> bool {
        self.inner
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&combo.native_id())
    }

    /// Bind `spec` to `command`. Returns false when the combination is
    /// invalid, reserved, or already bound; the existing binding is kept.
    pub fn register(&self, spec: &str, command: HotkeyCommand) -> bool {
        let combo: KeyCombo = match spec.parse() {
            Ok(combo) => combo,
            Err(e) => {
                warn!("rejecting hotkey '{}': {}", spec, e);
                return false;
            }
        };
        if self.is_reserved(&combo) {
            warn!("hotkey {} is reserved by the system", combo);
            return false;
        }

        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = combo.native_id();
        if registry.bindings.contains_key(&id) {
            debug!("hotkey {} already registered", combo);
            return false;
        }

        let token = HotkeyToken(registry.next_token);
        registry.next_token += 1;
        registry.bindings.insert(
            id,
            Binding {
                token,
                combo,
                command,
            },
        );
        debug!("registered {} -> {:?} ({:?})", combo, command, token);
        true
    }

    pub fn unregister(&self, spec: &str) -> bool {
        let Ok(combo) = spec.parse::<KeyCombo>() else {
            return false;
        };
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .remove(&combo.native_id())
            .is_some()
    }

    pub fn token(&self, spec: &str) -> Option<HotkeyToken> {
        let combo = spec.parse::<KeyCombo>().ok()?;
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .get(&combo.native_id())
            .map(|b| b.token)
    }

    pub fn len(&self) -> usize {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered combinations in canonical form, ordered by token.
    pub fn registrations(&self) -> Vec<(String, HotkeyToken, HotkeyCommand)> {
        let registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = registry
            .bindings
            .values()
            .map(|b| (b.combo.to_string(), b.token, b.command))
            .collect();
        all.sort_by_key(|(_, token, _)| *token);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HotkeyEvent> {
        self.inner.events.subscribe()
    }

    /// Handle a key notification identified by its native id. Returns true
    /// when it matched a registration.
    pub fn dispatch(&self, native_id: u32) -> bool {
        let binding = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .get(&native_id)
            .cloned();

        let Some(binding) = binding else {
            return false;
        };

        debug!("hotkey {} pressed", binding.combo);
        // nobody listening yet is not an error
        let _ = self.inner.events.send(HotkeyEvent {
            token: binding.token,
            combo: binding.combo.to_string(),
            command: binding.command,
        });
        true
    }

    pub fn dispatch_combo(&self, combo: &KeyCombo) -> bool {
        self.dispatch(combo.native_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_combo("C-q").unwrap(), "Ctrl+Q");
        assert_eq!(normalize_combo("shift+ctrl+p").unwrap(), "Ctrl+Shift+P");
        assert_eq!(normalize_combo("M-S-f5").unwrap(), "Alt+Shift+F5");
        assert_eq!(normalize_combo("Cmd+Space").unwrap(), "Super+Space");
        assert!(normalize_combo("Ctrl+Shift").is_err());
    }

    #[test]
    fn test_equivalent_spellings_share_native_id() {
        let a: KeyCombo = "Ctrl+Alt+x".parse().unwrap();
        let b: KeyCombo = "A-C-X".parse().unwrap();
        assert_eq!(a.native_id(), b.native_id());

        let c: KeyCombo = "Ctrl+x".parse().unwrap();
        assert_ne!(a.native_id(), c.native_id());
    }

    #[test]
    fn test_duplicate_registration_returns_false() {
        let hotkeys = HotkeyDispatcher::new();
        assert!(hotkeys.register("Ctrl+Q", HotkeyCommand::Stop));
        let token = hotkeys.token("ctrl-q");
        assert!(!hotkeys.register("C-q", HotkeyCommand::Pause));

        assert_eq!(hotkeys.len(), 1);
        assert_eq!(hotkeys.token("Ctrl+Q"), token);
        assert_eq!(hotkeys.registrations()[0].2, HotkeyCommand::Stop);
    }

    #[test]
    fn test_batch_continues_past_failures() {
        let hotkeys = HotkeyDispatcher::new();
        let results: Vec<bool> = [
            ("Alt+Tab", HotkeyCommand::Stop),
            ("Ctrl+Q", HotkeyCommand::Stop),
            ("Ctrl+", HotkeyCommand::Pause),
            ("Ctrl+P", HotkeyCommand::TogglePause),
        ]
        .iter()
        .map(|(spec, cmd)| hotkeys.register(spec, *cmd))
        .collect();
        assert_eq!(results, vec![false, true, false, true]);
        assert_eq!(hotkeys.len(), 2);
    }

    #[test]
    fn test_unregister_frees_combo() {
        let hotkeys = HotkeyDispatcher::new();
        assert!(hotkeys.register("F9", HotkeyCommand::Stop));
        assert!(hotkeys.unregister("f9"));
        assert!(!hotkeys.unregister("f9"));
        assert!(hotkeys.register("F9", HotkeyCommand::Pause));
    }

    #[tokio::test]
    async fn test_dispatch_publishes_event() {
        let hotkeys = HotkeyDispatcher::new();
        let mut rx = hotkeys.subscribe();
        hotkeys.register("Ctrl+Q", HotkeyCommand::Stop);

        let combo: KeyCombo = "Ctrl+Q".parse().unwrap();
        assert!(hotkeys.dispatch(combo.native_id()));
        assert!(!hotkeys.dispatch_combo(&"Ctrl+W".parse().unwrap()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.combo, "Ctrl+Q");
        assert_eq!(event.command, HotkeyCommand::Stop);
        assert!(rx.try_recv().is_err());
    }
}
