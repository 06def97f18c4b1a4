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

//! Timed keyboard and mouse macro playback
//!
//! Scripts are timelines of key and mouse actions. A [`PlaybackController`]
//! replays them through an [`InputActuator`], optionally gating actions on
//! screen recognition, branching on declarative rules and tracking a state
//! machine, while hotkeys can pause or stop playback at any moment.

pub mod actuator;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod events;
pub mod expr;
pub mod fault;
pub mod gating;
pub mod hotkey;
pub mod listener;
pub mod parser;
pub mod playback;
pub mod pty;
pub mod recognition;
pub mod script;
pub mod state_machine;
pub mod types;

pub use actuator::{InputActuator, TracingActuator};
pub use config::{DispatchPolicy, PlaybackConfig};
pub use context::{ExecutionContext, Value};
pub use decision::{Decision, DecisionEngine, DecisionRule, RuleStatus};
pub use error::{Error, Result};
pub use events::{PlaybackEvent, StopReason};
pub use fault::FaultReporter;
pub use gating::{GatingConfig, RecognitionGate};
pub use hotkey::{HotkeyCommand, HotkeyDispatcher, KeyCombo};
pub use parser::parse_script;
pub use playback::{PlaybackController, PlaybackState, PlaybackStats};
pub use recognition::{Recognizer, Region, Template};
pub use script::{Script, ScriptStatus};
pub use state_machine::{State, StateMachine, StateTransition};
pub use types::{ActionSequence, FallbackPolicy, GameAction, KeyCode};
