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

//! Playback event stream published by the controller

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stop was requested by a caller or a hotkey.
    Requested,
    /// The sequence ran to the end of its last loop.
    Completed,
    /// A fallback or dispatch policy ended the sequence.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Executed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    Loaded {
        script: String,
        version: u64,
        actions: usize,
    },
    Started {
        session: u64,
        script: String,
    },
    ActionExecuted {
        session: u64,
        sequence: String,
        index: usize,
        action: String,
        outcome: ActionOutcome,
        loop_index: u32,
        // time spent on the action itself, delay excluded
        elapsed_us: u64,
    },
    GateFailed {
        session: u64,
        template: String,
        reason: String,
        attempts: u32,
    },
    DecisionTaken {
        session: u64,
        rule: String,
        branch: String,
        sequence: Option<String>,
    },
    StateChanged {
        session: u64,
        from: String,
        to: String,
    },
    Stalled {
        session: u64,
        state: String,
        trigger: String,
    },
    Paused {
        session: u64,
    },
    Resumed {
        session: u64,
    },
    Stopped {
        session: u64,
        reason: StopReason,
    },
    Faulted {
        session: u64,
        seq: Option<u64>,
        message: String,
    },
}

impl PlaybackEvent {
    pub fn session(&self) -> Option<u64> {
        match self {
            PlaybackEvent::Loaded { .. } => None,
            PlaybackEvent::Started { session, .. }
            | PlaybackEvent::ActionExecuted { session, .. }
            | PlaybackEvent::GateFailed { session, .. }
            | PlaybackEvent::DecisionTaken { session, .. }
            | PlaybackEvent::StateChanged { session, .. }
            | PlaybackEvent::Stalled { session, .. }
            | PlaybackEvent::Paused { session }
            | PlaybackEvent::Resumed { session }
            | PlaybackEvent::Stopped { session, .. }
            | PlaybackEvent::Faulted { session, .. } => Some(*session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let event = PlaybackEvent::Stopped {
            session: 3,
            reason: StopReason::Requested,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"stopped","session":3,"reason":"requested"}"#
        );
    }
}
