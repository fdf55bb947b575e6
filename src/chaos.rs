//! Chaos injection engine.
//!
//! Each configured axis — latency, abort, error — is an independent
//! Bernoulli trial evaluated per request, in that order. Latency only
//! delays; abort and error short-circuit the pipeline. An axis whose
//! probability is non-numeric or ≤ 0 is a no-op, and ≥ 100 always fires.

use crate::config::{ChaosInjection, Probability};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// What the pipeline must do after chaos evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaosOutcome {
    /// Continue normal handling.
    Pass,
    /// Short-circuit with this status code and an empty body.
    Abort(u16),
    /// Short-circuit with this status code and the configured body.
    Error { code: u16, body: String },
}

impl ChaosOutcome {
    /// Whether the pipeline must stop normal handling.
    pub fn short_circuits(&self) -> bool {
        !matches!(self, ChaosOutcome::Pass)
    }
}

/// Chaos engine with a single shared randomness source.
pub struct ChaosEngine {
    rng: Mutex<StdRng>,
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Evaluate every axis for one request. Sleeps for the latency axis
    /// when it fires; returns the abort/error outcome otherwise.
    pub async fn apply(&self, chaos: &ChaosInjection) -> ChaosOutcome {
        if let Some(latency) = &chaos.latency {
            if latency.time > 0 && self.roll(&latency.probability) {
                tokio::time::sleep(Duration::from_millis(latency.time)).await;
            }
        }

        if let Some(abort) = &chaos.abort {
            if abort.code > 0 && self.roll(&abort.probability) {
                return ChaosOutcome::Abort(abort.code);
            }
        }

        if let Some(error) = &chaos.error {
            if error.code > 0 && self.roll(&error.probability) {
                return ChaosOutcome::Error {
                    code: error.code,
                    body: error.response.clone(),
                };
            }
        }

        ChaosOutcome::Pass
    }

    /// One Bernoulli trial against a percentage in [0, 100].
    fn roll(&self, probability: &Probability) -> bool {
        let Some(p) = probability.as_f64() else {
            return false;
        };
        if p <= 0.0 {
            return false;
        }
        // gen::<f64>() samples [0, 1), so p >= 100 always fires.
        self.rng.lock().gen::<f64>() * 100.0 < p
    }
}

impl Default for ChaosEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Abort, ErrorInjection, Latency};
    use std::time::Instant;

    fn chaos(
        latency: Option<Latency>,
        abort: Option<Abort>,
        error: Option<ErrorInjection>,
    ) -> ChaosInjection {
        ChaosInjection {
            latency,
            abort,
            error,
        }
    }

    #[tokio::test]
    async fn test_all_zero_probabilities_are_no_ops() {
        let engine = ChaosEngine::new();
        let config = chaos(
            Some(Latency {
                time: 500,
                probability: 0.0.into(),
            }),
            Some(Abort {
                code: 503,
                probability: 0.0.into(),
            }),
            Some(ErrorInjection {
                code: 500,
                probability: 0.0.into(),
                response: "boom".to_string(),
            }),
        );

        let start = Instant::now();
        for _ in 0..100 {
            assert_eq!(engine.apply(&config).await, ChaosOutcome::Pass);
        }
        // Latency must not have fired either.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_abort_at_full_probability_always_fires() {
        let engine = ChaosEngine::new();
        let config = chaos(
            None,
            Some(Abort {
                code: 503,
                probability: 100.0.into(),
            }),
            None,
        );

        for _ in 0..100 {
            assert_eq!(engine.apply(&config).await, ChaosOutcome::Abort(503));
        }
    }

    #[tokio::test]
    async fn test_error_carries_configured_body() {
        let engine = ChaosEngine::new();
        let config = chaos(
            None,
            None,
            Some(ErrorInjection {
                code: 500,
                probability: Probability::Text("100".to_string()),
                response: r#"{"error":"injected"}"#.to_string(),
            }),
        );

        match engine.apply(&config).await {
            ChaosOutcome::Error { code, body } => {
                assert_eq!(code, 500);
                assert_eq!(body, r#"{"error":"injected"}"#);
            }
            other => panic!("expected error outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_takes_precedence_over_error() {
        let engine = ChaosEngine::new();
        let config = chaos(
            None,
            Some(Abort {
                code: 503,
                probability: 100.0.into(),
            }),
            Some(ErrorInjection {
                code: 500,
                probability: 100.0.into(),
                response: String::new(),
            }),
        );

        assert_eq!(engine.apply(&config).await, ChaosOutcome::Abort(503));
    }

    #[tokio::test]
    async fn test_non_numeric_probability_disables_axis() {
        let engine = ChaosEngine::new();
        let config = chaos(
            None,
            Some(Abort {
                code: 503,
                probability: Probability::Text("often".to_string()),
            }),
            None,
        );

        for _ in 0..50 {
            assert_eq!(engine.apply(&config).await, ChaosOutcome::Pass);
        }
    }

    #[tokio::test]
    async fn test_zero_code_disables_axis() {
        let engine = ChaosEngine::new();
        let config = chaos(
            None,
            Some(Abort {
                code: 0,
                probability: 100.0.into(),
            }),
            None,
        );
        assert_eq!(engine.apply(&config).await, ChaosOutcome::Pass);
    }

    #[tokio::test]
    async fn test_latency_fires_without_short_circuit() {
        let engine = ChaosEngine::new();
        let config = chaos(
            Some(Latency {
                time: 30,
                probability: 100.0.into(),
            }),
            None,
            None,
        );

        let start = Instant::now();
        let outcome = engine.apply(&config).await;
        assert_eq!(outcome, ChaosOutcome::Pass);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
