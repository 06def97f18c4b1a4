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

//! Playback engine for macro scripts
//!
//! [`PlaybackController`] is a cheap, cloneable handle. Control calls are
//! synchronous and only flip shared state and a watch signal; the timeline
//! itself is walked by one worker task per session, which owns the session's
//! [`ExecutionContext`] and state machine copy.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::actuator::{self, InputActuator};
use crate::config::{DispatchPolicy, PlaybackConfig};
use crate::context::ExecutionContext;
use crate::decision::{Decision, DecisionEngine};
use crate::error::{BusinessRuleViolation, Error, PlaybackError, Result, ValidationError};
use crate::events::{ActionOutcome, PlaybackEvent, StopReason};
use crate::fault::FaultReporter;
use crate::gating::{GateOutcome, RecognitionGate};
use crate::hotkey::{HotkeyCommand, HotkeyEvent};
use crate::recognition::{NoRecognizer, Recognizer, Template};
use crate::script::{Script, ScriptStatus};
use crate::state_machine::{StateMachine, TransitionOutcome};
use crate::types::{DecisionPoint, FallbackPolicy, GameAction, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loaded,
    Playing,
    Paused,
}

impl PlaybackState {
    fn in_session(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Paused)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loaded => "loaded",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSignal {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStats {
    pub executed: u64,
    pub skipped: u64,
    pub repeated: u64,
    pub failed: u64,
    pub loops: u32,
    pub last_session: Option<Duration>,
}

struct Session {
    id: u64,
    signal: watch::Sender<RunSignal>,
}

struct Shared {
    state: PlaybackState,
    script: Option<Arc<Script>>,
    session: Option<Session>,
    next_session: u64,
    automation_state: Option<String>,
    stats: PlaybackStats,
}

struct Deps {
    actuator: Arc<dyn InputActuator>,
    gate: RecognitionGate,
    engine: Arc<DecisionEngine>,
    faults: FaultReporter,
    events: broadcast::Sender<PlaybackEvent>,
    state_tx: watch::Sender<PlaybackState>,
    config: PlaybackConfig,
    runtime: tokio::runtime::Handle,
}

impl Deps {
    fn emit(&self, event: PlaybackEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

pub struct PlaybackControllerBuilder {
    actuator: Arc<dyn InputActuator>,
    recognizer: Arc<dyn Recognizer>,
    engine: DecisionEngine,
    faults: FaultReporter,
    config: PlaybackConfig,
}

impl PlaybackControllerBuilder {
    pub fn recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.recognizer = recognizer;
        self
    }

    pub fn decision_engine(mut self, engine: DecisionEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn fault_reporter(mut self, faults: FaultReporter) -> Self {
        self.faults = faults;
        self
    }

    pub fn config(mut self, config: PlaybackConfig) -> Self {
        self.config = config;
        self
    }

    /// Must be called from within a tokio runtime; sessions are spawned on it.
    pub fn build(self) -> Result<PlaybackController> {
        self.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PlaybackError::NoRuntime)?;
        let gate = RecognitionGate::new(self.recognizer, self.config.gating.clone())?;
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (state_tx, _) = watch::channel(PlaybackState::Idle);

        Ok(PlaybackController {
            shared: Arc::new(Mutex::new(Shared {
                state: PlaybackState::Idle,
                script: None,
                session: None,
                next_session: 1,
                automation_state: None,
                stats: PlaybackStats::default(),
            })),
            deps: Arc::new(Deps {
                actuator: self.actuator,
                gate,
                engine: Arc::new(self.engine),
                faults: self.faults,
                events,
                state_tx,
                config: self.config,
                runtime,
            }),
        })
    }
}

#[derive(Clone)]
pub struct PlaybackController {
    shared: Arc<Mutex<Shared>>,
    deps: Arc<Deps>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_state(deps: &Deps, shared: &mut Shared, state: PlaybackState) {
    shared.state = state;
    deps.state_tx.send_replace(state);
}

impl PlaybackController {
    pub fn builder(actuator: Arc<dyn InputActuator>) -> PlaybackControllerBuilder {
        PlaybackControllerBuilder {
            actuator,
            recognizer: Arc::new(NoRecognizer),
            engine: DecisionEngine::default(),
            faults: FaultReporter::default(),
            config: PlaybackConfig::default(),
        }
    }

    pub fn current_state(&self) -> PlaybackState {
        lock(&self.shared).state
    }

    pub fn is_playing(&self) -> bool {
        self.current_state() == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.current_state() == PlaybackState::Paused
    }

    /// Current state of the automation state machine, while a session runs.
    pub fn automation_state(&self) -> Option<String> {
        lock(&self.shared).automation_state.clone()
    }

    pub fn stats(&self) -> PlaybackStats {
        lock(&self.shared).stats.clone()
    }

    pub fn script(&self) -> Option<Arc<Script>> {
        lock(&self.shared).script.clone()
    }

    pub fn faults(&self) -> &FaultReporter {
        &self.deps.faults
    }

    pub fn decision_engine(&self) -> &DecisionEngine {
        &self.deps.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.deps.events.subscribe()
    }

    /// Resolves once no session is playing or paused.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.deps.state_tx.subscribe();
        let _ = rx.wait_for(|state| !state.in_session()).await;
    }

    pub fn load(&self, script: impl Into<Arc<Script>>) -> Result<()> {
        let script = script.into();
        self.validate_script(&script)?;

        let mut shared = lock(&self.shared);
        if shared.state.in_session() {
            return Err(PlaybackError::InvalidState {
                operation: "load",
                state: shared.state.to_string(),
            }
            .into());
        }

        info!(
            "loaded script '{}' v{} ({} actions)",
            script.name(),
            script.version(),
            script.action_count()
        );
        self.deps.emit(PlaybackEvent::Loaded {
            script: script.name().to_string(),
            version: script.version(),
            actions: script.action_count(),
        });
        shared.script = Some(script);
        set_state(&self.deps, &mut shared, PlaybackState::Loaded);
        Ok(())
    }

    fn validate_script(&self, script: &Script) -> Result<()> {
        if script.status() == ScriptStatus::Deleted {
            return Err(BusinessRuleViolation::Deleted.into());
        }
        if script.main().is_empty() {
            return Err(BusinessRuleViolation::EmptyScript.into());
        }
        let mut gate_vars: HashMap<String, &str> = HashMap::new();
        for sequence in script.sequences() {
            sequence.validate()?;
            for action in sequence.actions() {
                let hooks = sequence.hooks(&action.id());
                if let Some(template) = hooks.and_then(|h| h.gate.as_ref()) {
                    let key = variable_name(template.name());
                    match gate_vars.get(key.as_str()) {
                        Some(other) if *other != template.name() => {
                            return Err(ValidationError::Duplicate {
                                kind: "gate variable",
                                name: format!("gate.{} ({} and {})", key, other, template.name()),
                            }
                            .into());
                        }
                        Some(_) => {}
                        None => {
                            gate_vars.insert(key, template.name());
                        }
                    }
                }
                if let Some(DecisionPoint::Rule(name)) = hooks.and_then(|h| h.decision.as_ref())
                {
                    if self.deps.engine.rule(name).is_none() {
                        return Err(ValidationError::Unknown {
                            kind: "rule",
                            name: name.clone(),
                        }
                        .into());
                    }
                }
            }
        }
        for name in self.deps.engine.referenced_sequences() {
            if script.sequence(name).is_none() {
                return Err(ValidationError::Unknown {
                    kind: "sequence",
                    name: name.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn play(&self) -> Result<()> {
        let mut shared = lock(&self.shared);
        match shared.state {
            PlaybackState::Idle => Err(PlaybackError::NoScript.into()),
            PlaybackState::Playing => Err(PlaybackError::InvalidState {
                operation: "play",
                state: shared.state.to_string(),
            }
            .into()),
            PlaybackState::Paused => {
                if let Some(session) = &shared.session {
                    session.signal.send_replace(RunSignal::Run);
                    info!("resumed session {}", session.id);
                    self.deps.emit(PlaybackEvent::Resumed {
                        session: session.id,
                    });
                }
                set_state(&self.deps, &mut shared, PlaybackState::Playing);
                Ok(())
            }
            PlaybackState::Loaded => {
                let script = shared.script.clone().ok_or(PlaybackError::NoScript)?;
                let id = shared.next_session;
                shared.next_session += 1;

                let (signal, signal_rx) = watch::channel(RunSignal::Run);
                let machine = self.deps.engine.session_machine();
                shared.automation_state = machine.as_ref().map(|m| m.current().name().to_string());
                shared.stats = PlaybackStats::default();
                shared.session = Some(Session { id, signal });
                set_state(&self.deps, &mut shared, PlaybackState::Playing);
                drop(shared);

                info!("starting session {} for '{}'", id, script.name());
                self.deps.emit(PlaybackEvent::Started {
                    session: id,
                    script: script.name().to_string(),
                });

                let worker = Worker::new(
                    id,
                    script,
                    Arc::clone(&self.deps),
                    Arc::clone(&self.shared),
                    signal_rx,
                    machine,
                );
                self.deps.runtime.spawn(worker.run());
                Ok(())
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut shared = lock(&self.shared);
        match shared.state {
            PlaybackState::Playing => {
                if let Some(session) = &shared.session {
                    session.signal.send_replace(RunSignal::Pause);
                    info!("paused session {}", session.id);
                    self.deps.emit(PlaybackEvent::Paused {
                        session: session.id,
                    });
                }
                set_state(&self.deps, &mut shared, PlaybackState::Paused);
                Ok(())
            }
            PlaybackState::Paused => Ok(()),
            other => Err(PlaybackError::InvalidState {
                operation: "pause",
                state: other.to_string(),
            }
            .into()),
        }
    }

    pub fn toggle_pause(&self) -> Result<()> {
        match self.current_state() {
            PlaybackState::Paused => self.play(),
            _ => self.pause(),
        }
    }

    /// Stop the running session, if any. Safe to call from any state and any
    /// thread; takes effect before this call returns.
    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        let Some(session) = shared.session.take() else {
            return;
        };
        session.signal.send_replace(RunSignal::Stop);
        shared.automation_state = None;
        set_state(&self.deps, &mut shared, PlaybackState::Loaded);
        info!("stopped session {}", session.id);
        self.deps.emit(PlaybackEvent::Stopped {
            session: session.id,
            reason: StopReason::Requested,
        });
    }

    fn apply_hotkey(&self, command: HotkeyCommand) {
        let result = match command {
            HotkeyCommand::Stop => {
                self.stop();
                Ok(())
            }
            HotkeyCommand::Pause => self.pause(),
            HotkeyCommand::Resume => match self.current_state() {
                PlaybackState::Paused => self.play(),
                _ => Ok(()),
            },
            HotkeyCommand::TogglePause => self.toggle_pause(),
            HotkeyCommand::Play => self.play(),
        };
        if let Err(e) = result {
            debug!("hotkey {:?} ignored: {}", command, e);
        }
    }

    /// Drain hotkey notifications on a task of their own and apply them.
    pub fn listen(&self, mut hotkeys: broadcast::Receiver<HotkeyEvent>) -> JoinHandle<()> {
        let controller = self.clone();
        self.deps.runtime.spawn(async move {
            loop {
                match hotkeys.recv().await {
                    Ok(event) => {
                        debug!("hotkey {} -> {:?}", event.combo, event.command);
                        controller.apply_hotkey(event.command);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("hotkey listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

enum Flow {
    Continue,
    Stop(StopReason),
}

enum GateStep {
    Passed,
    Failed,
    Interrupted,
}

type FlowFuture<'a> = Pin<Box<dyn Future<Output = Flow> + Send + 'a>>;

/// Context key for a template's gate results. Templates whose names only
/// differ in punctuation share a key and are rejected at load.
fn variable_name(template: &str) -> String {
    template
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

struct Worker {
    session: u64,
    script: Arc<Script>,
    deps: Arc<Deps>,
    shared: Arc<Mutex<Shared>>,
    signal: watch::Receiver<RunSignal>,
    ctx: ExecutionContext,
    machine: Option<StateMachine>,
}

impl Worker {
    fn new(
        session: u64,
        script: Arc<Script>,
        deps: Arc<Deps>,
        shared: Arc<Mutex<Shared>>,
        signal: watch::Receiver<RunSignal>,
        machine: Option<StateMachine>,
    ) -> Self {
        let mut ctx = ExecutionContext::with_vars(script.variables().iter().cloned());
        ctx.set("loop", 0u64);
        ctx.set("cursor", 0u64);
        ctx.set("trigger", "");
        ctx.set("last.success", false);
        ctx.set("last.confidence", 0.0);
        if let Some(machine) = &machine {
            ctx.set("state", machine.current().name());
        }

        Self {
            session,
            script,
            deps,
            shared,
            signal,
            ctx,
            machine,
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut PlaybackStats)) {
        let mut shared = lock(&self.shared);
        if shared.session.as_ref().map(|s| s.id) == Some(self.session) {
            f(&mut shared.stats);
        }
    }

    fn fault(&self, error: &anyhow::Error, context: &str) -> Option<u64> {
        let seq = self.deps.faults.report(error, Some(context));
        self.deps.emit(PlaybackEvent::Faulted {
            session: self.session,
            seq,
            message: format!("{}: {:#}", context, error),
        });
        seq
    }

    async fn run(mut self) {
        let started = Instant::now();
        let loops = self.script.loop_count();
        let mut iteration = 0u32;

        let reason = loop {
            self.ctx.set("loop", iteration as u64);
            if let Flow::Stop(reason) = self.play_sequence(0, 0).await {
                break reason;
            }
            iteration += 1;
            self.update_stats(|s| s.loops = iteration);
            if loops != 0 && iteration >= loops {
                break StopReason::Completed;
            }
        };

        self.finish(reason, started.elapsed());
    }

    fn finish(&self, reason: StopReason, elapsed: Duration) {
        let mut shared = lock(&self.shared);
        let current = shared.session.as_ref().map(|s| s.id) == Some(self.session);
        if !current {
            // stop() already moved the controller on
            debug!("session {} ended after stop", self.session);
            return;
        }
        shared.session = None;
        shared.automation_state = None;
        shared.stats.last_session = Some(elapsed);
        set_state(&self.deps, &mut shared, PlaybackState::Loaded);
        info!("session {} ended: {:?}", self.session, reason);
        self.deps.emit(PlaybackEvent::Stopped {
            session: self.session,
            reason,
        });
    }

    /// Block while paused. Returns false once the session is stopped.
    async fn wait_while_paused(&mut self) -> bool {
        loop {
            match *self.signal.borrow_and_update() {
                RunSignal::Run => return true,
                RunSignal::Stop => return false,
                RunSignal::Pause => {}
            }
            if self.signal.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Resolves as soon as the signal leaves `Run`.
    async fn interrupted(signal: &mut watch::Receiver<RunSignal>) {
        loop {
            if *signal.borrow_and_update() != RunSignal::Run {
                return;
            }
            if signal.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `delay`, aborting immediately on pause or stop. A paused
    /// wait resumes with whatever time was left. Returns false on stop.
    async fn wait(&mut self, delay: Duration) -> bool {
        let mut remaining = delay;
        loop {
            if !self.wait_while_paused().await {
                return false;
            }
            if remaining.is_zero() {
                tokio::task::yield_now().await;
                return *self.signal.borrow() != RunSignal::Stop;
            }

            let started = Instant::now();
            tokio::select! {
                _ = sleep(remaining) => return true,
                _ = Self::interrupted(&mut self.signal) => {
                    remaining = remaining.saturating_sub(started.elapsed());
                }
            }
        }
    }

    async fn run_gate(&mut self, template: &Template) -> GateStep {
        let gate = self.deps.gate.clone();
        loop {
            if !self.wait_while_paused().await {
                return GateStep::Interrupted;
            }

            let outcome = tokio::select! {
                outcome = gate.check(template) => Some(outcome),
                _ = Self::interrupted(&mut self.signal) => None,
            };

            // paused mid-recognition: wait, then look again
            let Some(outcome) = outcome else { continue };

            let key = variable_name(template.name());
            let (success, confidence) = outcome
                .result()
                .map(|r| (outcome.passed(), r.confidence()))
                .unwrap_or((false, 0.0));
            self.ctx.set(format!("gate.{}.success", key), success);
            self.ctx.set(format!("gate.{}.confidence", key), confidence);
            self.ctx.set("last.success", success);
            self.ctx.set("last.confidence", confidence);

            return match outcome {
                GateOutcome::Passed(_) => GateStep::Passed,
                GateOutcome::Failed {
                    reason, attempts, ..
                } => {
                    if let crate::gating::GateFailure::Recognizer(message) = &reason {
                        self.fault(
                            &anyhow::anyhow!("{}", message),
                            &format!("recognizing '{}'", template.name()),
                        );
                    }
                    self.deps.emit(PlaybackEvent::GateFailed {
                        session: self.session,
                        template: template.name().to_string(),
                        reason: reason.to_string(),
                        attempts,
                    });
                    GateStep::Failed
                }
            };
        }
    }

    fn decide(&mut self, point: &DecisionPoint) -> Option<usize> {
        let decision = match point {
            DecisionPoint::AllRules => self.deps.engine.evaluate(&self.ctx),
            DecisionPoint::Rule(name) => self.deps.engine.evaluate_rule(name, &self.ctx),
        };

        match decision {
            Ok(Decision::NoDecision) => None,
            Ok(Decision::Matched {
                rule,
                branch,
                sequence,
            }) => {
                debug!("decision: rule '{}' took {} branch", rule, branch);
                self.deps.emit(PlaybackEvent::DecisionTaken {
                    session: self.session,
                    rule,
                    branch: branch.to_string(),
                    sequence: sequence.clone(),
                });
                let name = sequence?;
                self.script.sequences().iter().position(|s| s.name() == name)
            }
            Err(e) => {
                self.fault(&Error::from(e).into(), "evaluating rules");
                None
            }
        }
    }

    async fn advance(&mut self, trigger: &Trigger, depth: usize) -> Flow {
        let Some(machine) = self.machine.as_mut() else {
            return Flow::Continue;
        };
        self.ctx.set("trigger", trigger.name.as_str());

        match machine.step(&self.ctx, trigger.require_progress) {
            Ok(TransitionOutcome::Moved { from, to }) => {
                let exit = machine.state(&from).and_then(|s| s.exit_sequence()).map(str::to_string);
                let entry = machine.state(&to).and_then(|s| s.entry_sequence()).map(str::to_string);
                self.ctx.set("state", to.as_str());
                {
                    let mut shared = lock(&self.shared);
                    if shared.session.as_ref().map(|s| s.id) == Some(self.session) {
                        shared.automation_state = Some(to.clone());
                    }
                }
                info!("automation state {} -> {}", from, to);
                self.deps.emit(PlaybackEvent::StateChanged {
                    session: self.session,
                    from,
                    to,
                });

                let hooks: Vec<String> = [exit, entry].into_iter().flatten().collect();
                if !hooks.is_empty() && depth >= self.deps.config.max_splice_depth {
                    warn!(
                        "entry/exit nesting exceeds {} at '{}', not playing {:?}",
                        depth, trigger.name, hooks
                    );
                    self.deps.faults.report_message(
                        &format!(
                            "entry/exit sequences {:?} nested deeper than {}",
                            hooks, self.deps.config.max_splice_depth
                        ),
                        Some("state machine"),
                    );
                    return Flow::Continue;
                }
                for name in hooks {
                    let index = self.script.sequences().iter().position(|s| s.name() == name);
                    if let Some(index) = index {
                        if let Flow::Stop(reason) = self.play_sequence(index, depth + 1).await {
                            return Flow::Stop(reason);
                        }
                    }
                }
                Flow::Continue
            }
            Ok(TransitionOutcome::Held { .. }) => Flow::Continue,
            Ok(TransitionOutcome::Stalled { state }) => {
                warn!("transition stalled in '{}' on '{}'", state, trigger.name);
                self.deps.faults.report_message(
                    &format!("no transition out of '{}' on '{}'", state, trigger.name),
                    Some("state machine"),
                );
                self.deps.emit(PlaybackEvent::Stalled {
                    session: self.session,
                    state,
                    trigger: trigger.name.clone(),
                });
                Flow::Continue
            }
            Err(e) => {
                self.fault(&Error::from(e).into(), "evaluating transitions");
                Flow::Continue
            }
        }
    }

    fn record(
        &self,
        sequence: &str,
        index: usize,
        action: &GameAction,
        outcome: ActionOutcome,
        elapsed: Duration,
    ) {
        let loop_index = match self.ctx.get("loop") {
            Some(crate::context::Value::Number(n)) => *n as u32,
            _ => 0,
        };
        self.deps.emit(PlaybackEvent::ActionExecuted {
            session: self.session,
            sequence: sequence.to_string(),
            index,
            action: action.to_string(),
            outcome,
            loop_index,
            elapsed_us: elapsed.as_micros() as u64,
        });
    }

    fn play_sequence(&mut self, index: usize, depth: usize) -> FlowFuture<'_> {
        Box::pin(async move {
            let script = Arc::clone(&self.script);
            let Some(sequence) = script.sequences().get(index) else {
                return Flow::Continue;
            };
            let fallback = sequence.fallback().unwrap_or(FallbackPolicy::Abort);
            let max_repeats = self.deps.config.max_fallback_repeats;
            let mut repeats = vec![0u32; sequence.len()];
            let mut cursor = 0usize;

            while cursor < sequence.len() {
                let action = &sequence.actions()[cursor];
                let hooks = sequence.hooks(&action.id());
                self.ctx.set("cursor", cursor);

                // (a) delay
                let delay = self.deps.config.scaled_delay(action.delay_ms());
                if !self.wait(delay).await {
                    return Flow::Stop(StopReason::Requested);
                }

                // (b) recognition gate
                if let Some(template) = hooks.and_then(|h| h.gate.as_ref()) {
                    match self.run_gate(template).await {
                        GateStep::Interrupted => return Flow::Stop(StopReason::Requested),
                        GateStep::Passed => {}
                        GateStep::Failed => match fallback {
                            FallbackPolicy::Skip => {
                                debug!("skipping action {} of '{}'", cursor, sequence.name());
                                self.update_stats(|s| s.skipped += 1);
                                self.record(
                                    sequence.name(),
                                    cursor,
                                    action,
                                    ActionOutcome::Skipped,
                                    Duration::ZERO,
                                );
                                cursor += 1;
                                continue;
                            }
                            FallbackPolicy::RepeatLast => {
                                repeats[cursor] += 1;
                                if repeats[cursor] > max_repeats {
                                    warn!(
                                        "gate at action {} of '{}' still failing after {} repeats, aborting",
                                        cursor,
                                        sequence.name(),
                                        max_repeats
                                    );
                                    return Flow::Stop(StopReason::Aborted);
                                }
                                self.update_stats(|s| s.repeated += 1);
                                // replay the previous action, then this gate again
                                cursor = cursor.saturating_sub(1);
                                continue;
                            }
                            FallbackPolicy::Abort => {
                                warn!(
                                    "gate failed at action {} of '{}', aborting",
                                    cursor,
                                    sequence.name()
                                );
                                return Flow::Stop(StopReason::Aborted);
                            }
                        },
                    }
                }

                // decision branch replaces the current action
                if let Some(point) = hooks.and_then(|h| h.decision.as_ref()) {
                    if let Some(branch) = self.decide(point) {
                        if depth >= self.deps.config.max_splice_depth {
                            warn!("decision branch nesting exceeds {}, ignoring", depth);
                        } else {
                            let flow = self.play_sequence(branch, depth + 1).await;
                            if let Flow::Stop(reason) = flow {
                                return Flow::Stop(reason);
                            }
                            self.ctx.set("cursor", cursor);
                            cursor += 1;
                            continue;
                        }
                    }
                }

                // (c) dispatch
                if !self.wait_while_paused().await {
                    return Flow::Stop(StopReason::Requested);
                }
                let started = Instant::now();
                let result = actuator::dispatch(self.deps.actuator.as_ref(), action.kind());
                let elapsed = started.elapsed();
                match result {
                    Ok(()) => {
                        self.update_stats(|s| s.executed += 1);
                        self.record(
                            sequence.name(),
                            cursor,
                            action,
                            ActionOutcome::Executed,
                            elapsed,
                        );
                    }
                    Err(e) => {
                        self.update_stats(|s| s.failed += 1);
                        self.fault(&e, &format!("dispatching {}", action));
                        self.record(
                            sequence.name(),
                            cursor,
                            action,
                            ActionOutcome::Failed,
                            elapsed,
                        );
                        if self.deps.config.dispatch_policy == DispatchPolicy::Abort {
                            return Flow::Stop(StopReason::Aborted);
                        }
                    }
                }

                // (d) state machine
                if let Some(trigger) = hooks.and_then(|h| h.trigger.as_ref()) {
                    if let Flow::Stop(reason) = self.advance(trigger, depth).await {
                        return Flow::Stop(reason);
                    }
                    // entry/exit sequences overwrite it
                    self.ctx.set("cursor", cursor);
                }

                cursor += 1;
            }

            Flow::Continue
        })
    }
}
