//! Result checker port: raw backend reply -> classified outcome.

use crate::domain::WorkOutcome;

/// Classifier from a raw reply to `{Success, ApplicationFailure,
/// Unrecognized}`. Pure: no side effects, no awaiting.
pub trait ResultChecker: Send + Sync {
    fn classify(&self, raw: serde_json::Value) -> WorkOutcome;
}

/// Checker for the conventional reply envelope:
///
/// - `{"status": "ok", "reply": <value>}` -> success carrying `reply`
/// - `{"status": "error", "reason": <string>, "retryable": <bool>}` ->
///   application failure (`retryable` defaults to false)
/// - anything else -> unrecognized
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeChecker;

impl ResultChecker for EnvelopeChecker {
    fn classify(&self, raw: serde_json::Value) -> WorkOutcome {
        match raw.get("status").and_then(|s| s.as_str()) {
            Some("ok") => {
                let reply = raw.get("reply").cloned().unwrap_or(serde_json::Value::Null);
                WorkOutcome::success(reply)
            }
            Some("error") => {
                let reason = raw
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unspecified")
                    .to_string();
                let retryable = raw
                    .get("retryable")
                    .and_then(|r| r.as_bool())
                    .unwrap_or(false);
                WorkOutcome::failure(reason, retryable)
            }
            _ => WorkOutcome::unrecognized(raw),
        }
    }
}

/// Adapter that lifts a plain function into a [`ResultChecker`].
pub struct FnChecker<F> {
    f: F,
}

impl<F> FnChecker<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ResultChecker for FnChecker<F>
where
    F: Fn(serde_json::Value) -> WorkOutcome + Send + Sync,
{
    fn classify(&self, raw: serde_json::Value) -> WorkOutcome {
        (self.f)(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_is_success() {
        let out = EnvelopeChecker.classify(serde_json::json!({"status": "ok", "reply": 42}));
        assert_eq!(out, WorkOutcome::success(serde_json::json!(42)));
    }

    #[test]
    fn error_envelope_is_application_failure() {
        let out = EnvelopeChecker.classify(serde_json::json!({
            "status": "error", "reason": "backend busy", "retryable": true
        }));
        assert_eq!(out, WorkOutcome::failure("backend busy", true));
    }

    #[test]
    fn retryable_defaults_to_false() {
        let out = EnvelopeChecker.classify(serde_json::json!({"status": "error"}));
        assert_eq!(out, WorkOutcome::failure("unspecified", false));
    }

    #[test]
    fn anything_else_is_unrecognized() {
        let raw = serde_json::json!(["not", "an", "envelope"]);
        let out = EnvelopeChecker.classify(raw.clone());
        assert_eq!(out, WorkOutcome::unrecognized(raw));
    }
}
