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

//! Error taxonomy for the automation core
//!
//! Construction problems surface as [`ValidationError`], illegal mutations as
//! [`BusinessRuleViolation`], condition failures as [`EvalError`] and misuse of
//! the controller as [`PlaybackError`]. Gating failures and stalled transitions
//! are outcomes, not errors, and live next to the code that produces them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: i64 },

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("a successful recognition result requires a matched region")]
    MissingRegion,

    #[error("state machine must have exactly one initial state, found {0}")]
    InitialStateCount(usize),

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },

    #[error("sequence '{0}' has gated actions but no fallback policy")]
    MissingFallback(String),

    #[error("invalid condition '{source_text}': {message}")]
    Condition {
        source_text: String,
        message: String,
    },

    #[error("invalid key combination '{0}'")]
    KeyCombo(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusinessRuleViolation {
    #[error("script is {status} and can only be edited while Draft")]
    NotDraft { status: String },

    #[error("script is deleted and can no longer change")]
    Deleted,

    #[error("cannot activate a script without actions")]
    EmptyScript,

    #[error("only mouse actions have a position, this is a {kind} action")]
    NotMouseAction { kind: &'static str },

    #[error("cannot change script status from {from} to {to}")]
    StatusChange { from: String, to: String },

    #[error("sequence index {index} out of range for {len} sequences")]
    SequenceOutOfRange { index: usize, len: usize },
}

/// Failure while evaluating a condition expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("condition evaluated to {0}, expected a boolean")]
    NotBoolean(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    #[error("no script loaded")]
    NoScript,

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("controller requires a running tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    BusinessRule(#[from] BusinessRuleViolation),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("index {index} out of range for sequence of {len} actions")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}
