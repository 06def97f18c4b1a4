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

//! Script aggregate: named sequences plus lifecycle status

use std::fmt;

use crate::context::Value;
use crate::error::{BusinessRuleViolation, Error, ValidationError};
use crate::types::{ActionHooks, ActionSequence, FallbackPolicy, GameAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    Draft,
    Active,
    Inactive,
    Deleted,
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptStatus::Draft => "Draft",
            ScriptStatus::Active => "Active",
            ScriptStatus::Inactive => "Inactive",
            ScriptStatus::Deleted => "Deleted",
        };
        write!(f, "{}", s)
    }
}

/// The first sequence is the one played; the others are reachable through
/// rule branches and state entry/exit hooks.
#[derive(Debug, Clone)]
pub struct Script {
    name: String,
    description: Option<String>,
    status: ScriptStatus,
    version: u64,
    // 0 repeats forever
    loop_count: u32,
    variables: Vec<(String, Value)>,
    sequences: Vec<ActionSequence>,
}

impl Script {
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty {
                field: "script name",
            });
        }
        Ok(Self {
            name: name.to_string(),
            description: None,
            status: ScriptStatus::Draft,
            version: 0,
            loop_count: 1,
            variables: Vec::new(),
            sequences: vec![ActionSequence::new("main")?],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn status(&self) -> ScriptStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn variables(&self) -> &[(String, Value)] {
        &self.variables
    }

    pub fn main(&self) -> &ActionSequence {
        &self.sequences[0]
    }

    pub fn sequences(&self) -> &[ActionSequence] {
        &self.sequences
    }

    pub fn sequence(&self, name: &str) -> Option<&ActionSequence> {
        self.sequences.iter().find(|s| s.name() == name)
    }

    pub fn action_count(&self) -> usize {
        self.sequences.iter().map(ActionSequence::len).sum()
    }

    fn ensure_draft(&self) -> Result<(), BusinessRuleViolation> {
        match self.status {
            ScriptStatus::Draft => Ok(()),
            ScriptStatus::Deleted => Err(BusinessRuleViolation::Deleted),
            other => Err(BusinessRuleViolation::NotDraft {
                status: other.to_string(),
            }),
        }
    }

    fn ensure_not_deleted(&self) -> Result<(), BusinessRuleViolation> {
        if self.status == ScriptStatus::Deleted {
            return Err(BusinessRuleViolation::Deleted);
        }
        Ok(())
    }

    fn sequence_mut(&mut self, index: usize) -> Result<&mut ActionSequence, BusinessRuleViolation> {
        let len = self.sequences.len();
        self.sequences
            .get_mut(index)
            .ok_or(BusinessRuleViolation::SequenceOutOfRange { index, len })
    }

    pub fn rename(&mut self, name: &str) -> Result<(), Error> {
        self.ensure_draft()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty {
                field: "script name",
            }
            .into());
        }
        self.name = name.to_string();
        self.version += 1;
        Ok(())
    }

    pub fn set_description(&mut self, description: &str) -> Result<(), Error> {
        self.ensure_not_deleted()?;
        let description = description.trim();
        self.description = (!description.is_empty()).then(|| description.to_string());
        self.version += 1;
        Ok(())
    }

    pub fn set_loop_count(&mut self, loops: u32) -> Result<(), Error> {
        self.ensure_draft()?;
        self.loop_count = loops;
        self.version += 1;
        Ok(())
    }

    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<(), Error> {
        self.ensure_draft()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty {
                field: "variable name",
            }
            .into());
        }
        match self.variables.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.variables.push((name.to_string(), value)),
        }
        self.version += 1;
        Ok(())
    }

    pub fn set_fallback(&mut self, sequence: usize, policy: FallbackPolicy) -> Result<(), Error> {
        self.ensure_draft()?;
        self.sequence_mut(sequence)?.set_fallback(policy);
        self.version += 1;
        Ok(())
    }

    /// Add an empty named sequence and return its index.
    pub fn add_sequence(&mut self, name: &str) -> Result<usize, Error> {
        self.ensure_draft()?;
        let sequence = ActionSequence::new(name)?;
        if self.sequence(sequence.name()).is_some() {
            return Err(ValidationError::Duplicate {
                kind: "sequence",
                name: sequence.name().to_string(),
            }
            .into());
        }
        self.sequences.push(sequence);
        self.version += 1;
        Ok(self.sequences.len() - 1)
    }

    pub fn add_action(&mut self, sequence: usize, action: GameAction) -> Result<(), Error> {
        self.add_action_with_hooks(sequence, action, ActionHooks::default())
    }

    pub fn add_action_with_hooks(
        &mut self,
        sequence: usize,
        action: GameAction,
        hooks: ActionHooks,
    ) -> Result<(), Error> {
        self.ensure_draft()?;
        self.sequence_mut(sequence)?.push_with_hooks(action, hooks);
        self.version += 1;
        Ok(())
    }

    pub fn remove_action(&mut self, sequence: usize, index: usize) -> Result<GameAction, Error> {
        self.ensure_draft()?;
        let action = self.sequence_mut(sequence)?.remove(index)?;
        self.version += 1;
        Ok(action)
    }

    pub fn activate(&mut self) -> Result<(), Error> {
        self.ensure_not_deleted()?;
        if self.main().is_empty() {
            return Err(BusinessRuleViolation::EmptyScript.into());
        }
        for sequence in &self.sequences {
            sequence.validate()?;
        }
        self.change_status(ScriptStatus::Active)
    }

    pub fn deactivate(&mut self) -> Result<(), Error> {
        if self.status != ScriptStatus::Active {
            return Err(BusinessRuleViolation::StatusChange {
                from: self.status.to_string(),
                to: ScriptStatus::Inactive.to_string(),
            }
            .into());
        }
        self.change_status(ScriptStatus::Inactive)
    }

    /// Return an inactive or active script to Draft so it can be edited.
    pub fn revise(&mut self) -> Result<(), Error> {
        self.ensure_not_deleted()?;
        self.change_status(ScriptStatus::Draft)
    }

    pub fn delete(&mut self) -> Result<(), Error> {
        self.ensure_not_deleted()?;
        self.change_status(ScriptStatus::Deleted)
    }

    fn change_status(&mut self, status: ScriptStatus) -> Result<(), Error> {
        self.status = status;
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyCode, KeyPhase};

    fn key(delay: i64) -> GameAction {
        GameAction::key(KeyCode::Char('w'), KeyPhase::Down, delay).unwrap()
    }

    #[test]
    fn test_version_increments_on_every_mutation() {
        let mut script = Script::new("farm").unwrap();
        assert_eq!(script.version(), 0);
        script.add_action(0, key(10)).unwrap();
        script.add_action(0, key(20)).unwrap();
        script.set_loop_count(3).unwrap();
        script.remove_action(0, 0).unwrap();
        script.activate().unwrap();
        assert_eq!(script.version(), 5);
        assert_eq!(script.status(), ScriptStatus::Active);
    }

    #[test]
    fn test_edits_only_while_draft() {
        let mut script = Script::new("farm").unwrap();
        script.add_action(0, key(10)).unwrap();
        script.activate().unwrap();
        let version = script.version();

        let err = script.add_action(0, key(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::BusinessRule(BusinessRuleViolation::NotDraft { .. })
        ));
        assert!(script.remove_action(0, 0).is_err());
        assert_eq!(script.version(), version);
        assert_eq!(script.main().len(), 1);
    }

    #[test]
    fn test_activation_requires_actions() {
        let mut script = Script::new("empty").unwrap();
        assert!(matches!(
            script.activate(),
            Err(Error::BusinessRule(BusinessRuleViolation::EmptyScript))
        ));
        assert_eq!(script.status(), ScriptStatus::Draft);
    }

    #[test]
    fn test_deleted_script_is_immutable() {
        let mut script = Script::new("gone").unwrap();
        script.add_action(0, key(1)).unwrap();
        script.delete().unwrap();
        let version = script.version();
        assert!(script.activate().is_err());
        assert!(script.revise().is_err());
        assert!(script.set_description("x").is_err());
        assert!(script.add_action(0, key(1)).is_err());
        assert_eq!(script.version(), version);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut script = Script::new("s").unwrap();
        assert!(matches!(
            script.remove_action(0, 0),
            Err(Error::IndexOutOfRange { index: 0, len: 0 })
        ));
        assert!(matches!(
            script.add_action(4, key(1)),
            Err(Error::BusinessRule(
                BusinessRuleViolation::SequenceOutOfRange { index: 4, len: 1 }
            ))
        ));
    }

    #[test]
    fn test_rename_keeps_settings() {
        let mut script = Script::new("draft").unwrap();
        script.set_loop_count(4).unwrap();
        script.rename(" farm ").unwrap();
        assert_eq!(script.name(), "farm");
        assert_eq!(script.loop_count(), 4);
        assert_eq!(script.version(), 2);
        assert!(script.rename("  ").is_err());
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let mut script = Script::new("s").unwrap();
        assert_eq!(script.add_sequence("heal").unwrap(), 1);
        assert!(script.add_sequence("heal").is_err());
        assert!(script.add_sequence("main").is_err());
    }
}
