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

//! Finite state machine tracking the automation's higher-level mode

use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{EvalError, ValidationError};
use crate::expr::Condition;

#[derive(Debug, Clone, PartialEq)]
pub struct State {
    name: String,
    on_entry: Option<String>,
    on_exit: Option<String>,
    initial: bool,
}

impl State {
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty {
                field: "state name",
            });
        }
        Ok(Self {
            name: name.to_string(),
            on_entry: None,
            on_exit: None,
            initial: false,
        })
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Name of the script sequence played when the machine enters this state.
    pub fn on_entry(mut self, sequence: &str) -> Self {
        self.on_entry = Some(sequence.to_string());
        self
    }

    /// Name of the script sequence played when the machine leaves this state.
    pub fn on_exit(mut self, sequence: &str) -> Self {
        self.on_exit = Some(sequence.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_sequence(&self) -> Option<&str> {
        self.on_entry.as_deref()
    }

    pub fn exit_sequence(&self) -> Option<&str> {
        self.on_exit.as_deref()
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    from: String,
    to: String,
    guard: Condition,
    priority: i32,
    order: usize,
}

impl StateTransition {
    pub fn new(from: &str, to: &str, guard: &str, priority: i32) -> Result<Self, ValidationError> {
        Ok(Self {
            from: from.trim().to_string(),
            to: to.trim().to_string(),
            guard: Condition::parse(guard)?,
            priority,
            order: 0,
        })
    }

    pub fn unguarded(from: &str, to: &str, priority: i32) -> Self {
        Self {
            from: from.trim().to_string(),
            to: to.trim().to_string(),
            guard: Condition::always(),
            priority,
            order: 0,
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn guard(&self) -> &Condition {
        &self.guard
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Registration order, the final tie-break between equal priorities.
    pub fn order(&self) -> usize {
        self.order
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Moved { from: String, to: String },
    /// No guard held; the machine stays where it is.
    Held { state: String },
    /// No guard held although the caller required progress.
    Stalled { state: String },
}

#[derive(Debug, Default)]
pub struct StateMachineBuilder {
    states: Vec<State>,
    transitions: Vec<StateTransition>,
}

impl StateMachineBuilder {
    pub fn state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn transition(mut self, transition: StateTransition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn build(self) -> Result<StateMachine, ValidationError> {
        let initial: Vec<usize> = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.initial)
            .map(|(i, _)| i)
            .collect();
        if initial.len() != 1 {
            return Err(ValidationError::InitialStateCount(initial.len()));
        }

        for (i, state) in self.states.iter().enumerate() {
            if self.states[..i].iter().any(|s| s.name == state.name) {
                return Err(ValidationError::Duplicate {
                    kind: "state",
                    name: state.name.clone(),
                });
            }
        }

        let known = |name: &str| self.states.iter().any(|s| s.name == name);
        for t in &self.transitions {
            for endpoint in [&t.from, &t.to] {
                if !known(endpoint) {
                    return Err(ValidationError::Unknown {
                        kind: "state",
                        name: endpoint.clone(),
                    });
                }
            }
        }

        let transitions = self
            .transitions
            .into_iter()
            .enumerate()
            .map(|(order, mut t)| {
                t.order = order;
                t
            })
            .collect();

        Ok(StateMachine {
            initial: initial[0],
            current: initial[0],
            states: self.states,
            transitions,
        })
    }
}

/// Owns its states and guarded transitions; the current state is always one
/// of the owned states.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachine {
    states: Vec<State>,
    transitions: Vec<StateTransition>,
    initial: usize,
    current: usize,
}

impl StateMachine {
    pub fn builder() -> StateMachineBuilder {
        StateMachineBuilder::default()
    }

    pub fn current(&self) -> &State {
        &self.states[self.current]
    }

    pub fn initial_state(&self) -> &State {
        &self.states[self.initial]
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Pick the transition that would fire from the current state.
    ///
    /// Lowest priority number wins; equal priorities go to the transition
    /// registered first.
    pub fn select(&self, ctx: &ExecutionContext) -> Result<Option<&StateTransition>, EvalError> {
        let current = &self.states[self.current].name;
        let mut best: Option<&StateTransition> = None;
        for t in self.transitions.iter().filter(|t| &t.from == current) {
            if !t.guard.evaluate(ctx)? {
                continue;
            }
            best = match best {
                Some(b) if (b.priority, b.order) <= (t.priority, t.order) => Some(b),
                _ => Some(t),
            };
        }
        Ok(best)
    }

    pub fn step(
        &mut self,
        ctx: &ExecutionContext,
        require_progress: bool,
    ) -> Result<TransitionOutcome, EvalError> {
        let from = self.current().name.clone();
        let target = self.select(ctx)?.map(|t| t.to.clone());

        match target {
            Some(to) => {
                // validated at build time
                if let Some(idx) = self.states.iter().position(|s| s.name == to) {
                    self.current = idx;
                }
                debug!("state machine: {} -> {}", from, to);
                Ok(TransitionOutcome::Moved { from, to })
            }
            None if require_progress => Ok(TransitionOutcome::Stalled { state: from }),
            None => Ok(TransitionOutcome::Held { state: from }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Value;

    fn machine() -> StateMachine {
        StateMachine::builder()
            .state(State::new("town").unwrap().initial())
            .state(State::new("dungeon").unwrap().on_entry("enter_dungeon"))
            .state(State::new("shop").unwrap())
            .transition(StateTransition::new("town", "shop", "gold > 100", 5).unwrap())
            .transition(StateTransition::new("town", "dungeon", "gold > 10", 1).unwrap())
            .transition(StateTransition::new("town", "shop", "gold > 10", 1).unwrap())
            .transition(StateTransition::unguarded("dungeon", "town", 0))
            .build()
            .unwrap()
    }

    fn gold(n: f64) -> ExecutionContext {
        ExecutionContext::with_vars([("gold", Value::Number(n))])
    }

    #[test]
    fn test_exactly_one_initial_state() {
        let none = StateMachine::builder()
            .state(State::new("a").unwrap())
            .build();
        assert_eq!(none.unwrap_err(), ValidationError::InitialStateCount(0));

        let two = StateMachine::builder()
            .state(State::new("a").unwrap().initial())
            .state(State::new("b").unwrap().initial())
            .build();
        assert_eq!(two.unwrap_err(), ValidationError::InitialStateCount(2));
    }

    #[test]
    fn test_unknown_state_in_transition() {
        let result = StateMachine::builder()
            .state(State::new("a").unwrap().initial())
            .transition(StateTransition::unguarded("a", "nowhere", 0))
            .build();
        assert!(matches!(result, Err(ValidationError::Unknown { .. })));
    }

    #[test]
    fn test_lowest_priority_wins() {
        let mut fsm = machine();
        let outcome = fsm.step(&gold(500.0), false).unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Moved {
                from: "town".into(),
                to: "dungeon".into()
            }
        );
        assert_eq!(fsm.current().name(), "dungeon");
    }

    #[test]
    fn test_equal_priority_tie_break_is_registration_order() {
        for _ in 0..10 {
            let fsm = machine();
            let chosen = fsm.select(&gold(50.0)).unwrap().unwrap();
            assert_eq!(chosen.to(), "dungeon");
            assert_eq!(chosen.order(), 1);
        }
    }

    #[test]
    fn test_no_transition_holds_or_stalls() {
        let mut fsm = machine();
        assert_eq!(
            fsm.step(&gold(0.0), false).unwrap(),
            TransitionOutcome::Held {
                state: "town".into()
            }
        );
        assert_eq!(
            fsm.step(&gold(0.0), true).unwrap(),
            TransitionOutcome::Stalled {
                state: "town".into()
            }
        );
        assert_eq!(fsm.current().name(), "town");
    }

    #[test]
    fn test_guard_error_propagates() {
        let mut fsm = machine();
        let err = fsm.step(&ExecutionContext::new(), false).unwrap_err();
        assert_eq!(err, EvalError::UndefinedVariable("gold".into()));
        assert_eq!(fsm.current().name(), "town");
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut fsm = machine();
        fsm.step(&gold(50.0), false).unwrap();
        fsm.reset();
        assert_eq!(fsm.current().name(), "town");
    }
}
