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

//! Declarative rules that branch playback
//!
//! Rules are evaluated first-match in ascending priority order. The engine
//! also carries the automation state machine definition; each playback
//! session works on its own copy of it.

use std::fmt;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{EvalError, ValidationError};
use crate::expr::Condition;
use crate::state_machine::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Active,
    Inactive,
    Draft,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRule {
    name: String,
    condition: Condition,
    priority: i32,
    then_sequence: Option<String>,
    else_sequence: Option<String>,
    status: RuleStatus,
}

impl DecisionRule {
    pub fn new(name: &str, condition: &str, priority: i32) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty { field: "rule name" });
        }
        Ok(Self {
            name: name.to_string(),
            condition: Condition::parse(condition)?,
            priority,
            then_sequence: None,
            else_sequence: None,
            status: RuleStatus::Active,
        })
    }

    pub fn then_play(mut self, sequence: &str) -> Self {
        self.then_sequence = Some(sequence.to_string());
        self
    }

    pub fn else_play(mut self, sequence: &str) -> Self {
        self.else_sequence = Some(sequence.to_string());
        self
    }

    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn then_sequence(&self) -> Option<&str> {
        self.then_sequence.as_deref()
    }

    pub fn else_sequence(&self) -> Option<&str> {
        self.else_sequence.as_deref()
    }

    pub fn status(&self) -> RuleStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Then,
    Else,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Then => write!(f, "then"),
            Branch::Else => write!(f, "else"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing matched; playback continues with the current action.
    NoDecision,
    Matched {
        rule: String,
        branch: Branch,
        /// Sequence to splice in place of the current action, if the rule names one.
        sequence: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    // sorted by priority, ties kept in registration order
    rules: Vec<DecisionRule>,
    machine: Option<StateMachine>,
}

impl DecisionEngine {
    pub fn new(rules: Vec<DecisionRule>) -> Result<Self, ValidationError> {
        for (i, rule) in rules.iter().enumerate() {
            if rules[..i].iter().any(|r| r.name == rule.name) {
                return Err(ValidationError::Duplicate {
                    kind: "rule",
                    name: rule.name.clone(),
                });
            }
        }
        let mut rules = rules;
        rules.sort_by_key(|r| r.priority);
        Ok(Self {
            rules,
            machine: None,
        })
    }

    pub fn with_state_machine(mut self, machine: StateMachine) -> Self {
        self.machine = Some(machine);
        self
    }

    pub fn rules(&self) -> &[DecisionRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&DecisionRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn state_machine(&self) -> Option<&StateMachine> {
        self.machine.as_ref()
    }

    /// Fresh copy of the state machine, positioned at its initial state.
    pub fn session_machine(&self) -> Option<StateMachine> {
        self.machine.clone().map(|mut m| {
            m.reset();
            m
        })
    }

    /// Every sequence name a rule or state refers to.
    pub fn referenced_sequences(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for rule in &self.rules {
            names.extend(rule.then_sequence());
            names.extend(rule.else_sequence());
        }
        if let Some(machine) = &self.machine {
            for state in machine.states() {
                names.extend(state.entry_sequence());
                names.extend(state.exit_sequence());
            }
        }
        names
    }

    /// First active rule, by ascending priority, whose condition holds.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<Decision, EvalError> {
        for rule in self.rules.iter().filter(|r| r.is_active()) {
            if rule.condition.evaluate(ctx)? {
                debug!("rule '{}' matched", rule.name);
                return Ok(Decision::Matched {
                    rule: rule.name.clone(),
                    branch: Branch::Then,
                    sequence: rule.then_sequence.clone(),
                });
            }
        }
        Ok(Decision::NoDecision)
    }

    /// Evaluate one explicitly selected rule, taking its else branch when the
    /// condition is false.
    pub fn evaluate_rule(&self, name: &str, ctx: &ExecutionContext) -> Result<Decision, EvalError> {
        let Some(rule) = self.rules.iter().find(|r| r.name == name && r.is_active()) else {
            return Ok(Decision::NoDecision);
        };

        if rule.condition.evaluate(ctx)? {
            Ok(Decision::Matched {
                rule: rule.name.clone(),
                branch: Branch::Then,
                sequence: rule.then_sequence.clone(),
            })
        } else if let Some(sequence) = &rule.else_sequence {
            Ok(Decision::Matched {
                rule: rule.name.clone(),
                branch: Branch::Else,
                sequence: Some(sequence.clone()),
            })
        } else {
            Ok(Decision::NoDecision)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Value;

    fn ctx() -> ExecutionContext {
        ExecutionContext::with_vars([("hp", Value::Number(30.0))])
    }

    #[test]
    fn test_first_match_by_ascending_priority() {
        let engine = DecisionEngine::new(vec![
            DecisionRule::new("p3", "hp < 100", 3).unwrap().then_play("three"),
            DecisionRule::new("p1", "hp > 100", 1).unwrap().then_play("one"),
            DecisionRule::new("p2", "hp < 50", 2).unwrap().then_play("two"),
        ])
        .unwrap();

        assert_eq!(
            engine.evaluate(&ctx()).unwrap(),
            Decision::Matched {
                rule: "p2".into(),
                branch: Branch::Then,
                sequence: Some("two".into())
            }
        );
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let engine = DecisionEngine::new(vec![
            DecisionRule::new("first", "true", 1).unwrap().then_play("a"),
            DecisionRule::new("second", "true", 1).unwrap().then_play("b"),
        ])
        .unwrap();
        let Decision::Matched { rule, .. } = engine.evaluate(&ctx()).unwrap() else {
            panic!("expected a match");
        };
        assert_eq!(rule, "first");
    }

    #[test]
    fn test_inactive_rules_are_skipped() {
        let engine = DecisionEngine::new(vec![
            DecisionRule::new("off", "true", 0)
                .unwrap()
                .with_status(RuleStatus::Inactive),
            DecisionRule::new("draft", "true", 1)
                .unwrap()
                .with_status(RuleStatus::Draft),
        ])
        .unwrap();
        assert_eq!(engine.evaluate(&ctx()).unwrap(), Decision::NoDecision);
    }

    #[test]
    fn test_no_match_is_no_decision() {
        let engine =
            DecisionEngine::new(vec![DecisionRule::new("low", "hp < 10", 0).unwrap()]).unwrap();
        assert_eq!(engine.evaluate(&ctx()).unwrap(), Decision::NoDecision);
    }

    #[test]
    fn test_undefined_variable_fails_evaluation() {
        let engine =
            DecisionEngine::new(vec![DecisionRule::new("mana", "mana < 10", 0).unwrap()]).unwrap();
        assert_eq!(
            engine.evaluate(&ctx()),
            Err(EvalError::UndefinedVariable("mana".into()))
        );
    }

    #[test]
    fn test_explicit_rule_takes_else_branch() {
        let engine = DecisionEngine::new(vec![
            DecisionRule::new("heal", "hp < 10", 0)
                .unwrap()
                .then_play("potion")
                .else_play("attack"),
        ])
        .unwrap();
        assert_eq!(
            engine.evaluate_rule("heal", &ctx()).unwrap(),
            Decision::Matched {
                rule: "heal".into(),
                branch: Branch::Else,
                sequence: Some("attack".into())
            }
        );
        assert_eq!(
            engine.evaluate_rule("missing", &ctx()).unwrap(),
            Decision::NoDecision
        );
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let result = DecisionEngine::new(vec![
            DecisionRule::new("a", "true", 0).unwrap(),
            DecisionRule::new("a", "false", 1).unwrap(),
        ]);
        assert!(matches!(result, Err(ValidationError::Duplicate { .. })));
    }
}
