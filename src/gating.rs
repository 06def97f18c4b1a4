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

//! Recognition gating
//!
//! Wraps a [`Recognizer`] call with a timeout, a confidence threshold and a
//! bounded number of retries. The result is always an outcome value; what to
//! do on failure is the caller's fallback policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::recognition::{RecognitionResult, Recognizer, Template};

#[derive(Debug, Clone, PartialEq)]
pub struct GatingConfig {
    // Upper bound for a single recognizer call
    pub timeout: Duration,
    // Minimum confidence for a match to count
    pub threshold: f64,
    // Extra attempts after the first one
    pub retries: u32,
    // Fixed pause between attempts
    pub backoff: Duration,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            threshold: 0.8,
            retries: 2,
            backoff: Duration::from_millis(100),
        }
    }
}

impl GatingConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(ValidationError::OutOfRange {
                field: "confidence threshold",
                min: 0.0,
                max: 1.0,
                value: self.threshold,
            });
        }
        if self.timeout.is_zero() {
            return Err(ValidationError::Empty {
                field: "recognition timeout",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    Timeout,
    NotFound,
    LowConfidence { confidence: f64, threshold: f64 },
    Recognizer(String),
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateFailure::Timeout => write!(f, "recognition timed out"),
            GateFailure::NotFound => write!(f, "template not found"),
            GateFailure::LowConfidence {
                confidence,
                threshold,
            } => write!(
                f,
                "confidence {:.2} below threshold {:.2}",
                confidence, threshold
            ),
            GateFailure::Recognizer(e) => write!(f, "recognizer failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Passed(RecognitionResult),
    Failed {
        reason: GateFailure,
        attempts: u32,
        last: Option<RecognitionResult>,
    },
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Passed(_))
    }

    pub fn result(&self) -> Option<&RecognitionResult> {
        match self {
            GateOutcome::Passed(r) => Some(r),
            GateOutcome::Failed { last, .. } => last.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct RecognitionGate {
    recognizer: Arc<dyn Recognizer>,
    config: GatingConfig,
}

impl RecognitionGate {
    pub fn new(recognizer: Arc<dyn Recognizer>, config: GatingConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self { recognizer, config })
    }

    pub fn config(&self) -> &GatingConfig {
        &self.config
    }

    async fn attempt(&self, template: &Template) -> Result<RecognitionResult, (GateFailure, Option<RecognitionResult>)> {
        let call = self.recognizer.recognize(template, template.region());
        match timeout(self.config.timeout, call).await {
            Err(_) => Err((GateFailure::Timeout, None)),
            Ok(Err(e)) => Err((GateFailure::Recognizer(format!("{:#}", e)), None)),
            Ok(Ok(result)) if !result.success() => Err((GateFailure::NotFound, Some(result))),
            Ok(Ok(result)) if result.confidence() < self.config.threshold => Err((
                GateFailure::LowConfidence {
                    confidence: result.confidence(),
                    threshold: self.config.threshold,
                },
                Some(result),
            )),
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// Run the gate. Dropping the returned future cancels it cleanly.
    pub async fn check(&self, template: &Template) -> GateOutcome {
        let attempts = self.config.retries.saturating_add(1);
        let mut failure = GateFailure::NotFound;
        let mut last = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                sleep(self.config.backoff).await;
            }

            match self.attempt(template).await {
                Ok(result) => {
                    debug!(
                        "gate '{}' passed on attempt {} (confidence {:.2})",
                        template.name(),
                        attempt,
                        result.confidence()
                    );
                    return GateOutcome::Passed(result);
                }
                Err((reason, result)) => {
                    debug!(
                        "gate '{}' attempt {}/{}: {}",
                        template.name(),
                        attempt,
                        attempts,
                        reason
                    );
                    failure = reason;
                    last = result;
                }
            }
        }

        warn!(
            "gate '{}' failed after {} attempts: {}",
            template.name(),
            attempts,
            failure
        );
        GateOutcome::Failed {
            reason: failure,
            attempts,
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::Region;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        replies: Mutex<Vec<f64>>,
        calls: AtomicU32,
        latency: Duration,
    }

    impl Scripted {
        fn new(replies: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().copied().collect()),
                calls: AtomicU32::new(0),
                latency: Duration::ZERO,
            })
        }

        fn slow(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![1.0]),
                calls: AtomicU32::new(0),
                latency,
            })
        }
    }

    #[async_trait]
    impl Recognizer for Scripted {
        async fn recognize(
            &self,
            _template: &Template,
            _region: Option<Region>,
        ) -> anyhow::Result<RecognitionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.latency).await;
            let confidence = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 {
                    replies.pop().unwrap()
                } else {
                    replies[0]
                }
            };
            if confidence < 0.0 {
                anyhow::bail!("capture failed");
            }
            let region = Region::new(10, 10, 20, 20)?;
            Ok(RecognitionResult::matched(confidence, region, self.latency)?)
        }
    }

    fn gate(recognizer: Arc<Scripted>, retries: u32) -> RecognitionGate {
        RecognitionGate::new(
            recognizer,
            GatingConfig {
                timeout: Duration::from_millis(200),
                threshold: 0.8,
                retries,
                backoff: Duration::from_millis(50),
            },
        )
        .unwrap()
    }

    fn template() -> Template {
        Template::new("ok_button").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_is_failure() {
        let recognizer = Scripted::new(&[0.75]);
        let outcome = gate(recognizer.clone(), 0).check(&template()).await;
        match outcome {
            GateOutcome::Failed {
                reason: GateFailure::LowConfidence { confidence, .. },
                attempts,
                ..
            } => {
                assert_eq!(confidence, 0.75);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected low confidence failure, got {:?}", other),
        }
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_confident() {
        let recognizer = Scripted::new(&[0.5, 0.6, 0.95]);
        let outcome = gate(recognizer.clone(), 2).check(&template()).await;
        assert!(outcome.passed());
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let recognizer = Scripted::new(&[0.1]);
        let outcome = gate(recognizer.clone(), 3).check(&template()).await;
        assert!(matches!(outcome, GateOutcome::Failed { attempts: 4, .. }));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_recognizer_times_out() {
        let recognizer = Scripted::slow(Duration::from_secs(5));
        let outcome = gate(recognizer, 0).check(&template()).await;
        assert!(matches!(
            outcome,
            GateOutcome::Failed {
                reason: GateFailure::Timeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_error_is_failure() {
        let recognizer = Scripted::new(&[-1.0]);
        let outcome = gate(recognizer, 0).check(&template()).await;
        assert!(matches!(
            outcome,
            GateOutcome::Failed {
                reason: GateFailure::Recognizer(_),
                ..
            }
        ));
    }

    #[test]
    fn test_threshold_validated() {
        let config = GatingConfig {
            threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
