use chrono::Utc;

use super::store::{ModelUsage, Store};

/// USD per million tokens (input, output). Thinking tokens are priced as
/// output. Unknown models fall back to the default-model rate.
const MODEL_COSTS: &[(&str, f64, f64)] = &[
    ("claude-sonnet-4-6", 3.00, 15.00),
    ("claude-opus-4-6", 15.00, 75.00),
    ("claude-haiku-4-5-20251001", 0.80, 4.00),
];

const FALLBACK_INPUT_RATE: f64 = 3.00;
const FALLBACK_OUTPUT_RATE: f64 = 15.00;

/// Fraction of the daily budget after which low-complexity calls are
/// escalated to the local model.
pub const ESCALATION_FRACTION: f64 = 0.70;

pub fn model_rates(model: &str) -> (f64, f64) {
    MODEL_COSTS
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or((FALLBACK_INPUT_RATE, FALLBACK_OUTPUT_RATE))
}

/// Estimated USD cost of a set of per-model usage rows.
pub fn cost_of(rows: &[ModelUsage]) -> f64 {
    rows.iter()
        .map(|row| {
            let (input_rate, output_rate) = model_rates(&row.model);
            (row.input_tokens as f64 * input_rate
                + (row.output_tokens + row.thinking_tokens) as f64 * output_rate)
                / 1_000_000.0
        })
        .sum()
}

/// Epoch seconds of the most recent UTC midnight.
pub fn utc_midnight_epoch() -> f64 {
    let now = Utc::now().timestamp();
    (now - now.rem_euclid(86_400)) as f64
}

/// Today's estimated spend (UTC day boundary).
pub fn today_spend(store: &Store) -> f64 {
    match store.usage_by_model_since(utc_midnight_epoch()) {
        Ok(rows) => cost_of(&rows),
        Err(e) => {
            tracing::warn!("Failed to query daily spend: {e}");
            0.0
        }
    }
}

/// Spend over the trailing 30 days.
pub fn month_spend(store: &Store) -> f64 {
    let cutoff = Utc::now().timestamp() as f64 - 30.0 * 86_400.0;
    match store.usage_by_model_since(cutoff) {
        Ok(rows) => cost_of(&rows),
        Err(e) => {
            tracing::warn!("Failed to query monthly spend: {e}");
            0.0
        }
    }
}

/// Check daily and monthly spend against configured caps.
/// Returns the violated label and the current spend on breach.
pub fn check_budget(
    store: &Store,
    daily_limit: f64,
    monthly_limit: f64,
) -> Result<(), (String, f64, f64)> {
    if daily_limit > 0.0 {
        let spend = today_spend(store);
        if spend >= daily_limit {
            return Err(("daily".to_string(), spend, daily_limit));
        }
    }
    if monthly_limit > 0.0 {
        let spend = month_spend(store);
        if spend >= monthly_limit {
            return Err(("monthly".to_string(), spend, monthly_limit));
        }
    }
    Ok(())
}

/// True when today's spend exceeds `fraction` of the daily cap.
/// With no cap configured this never escalates.
pub fn daily_spend_exceeds_fraction(store: &Store, daily_limit: f64, fraction: f64) -> bool {
    if daily_limit <= 0.0 {
        return false;
    }
    today_spend(store) > daily_limit * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::ModelUsage;

    fn usage(model: &str, input: u64, output: u64, thinking: u64) -> ModelUsage {
        ModelUsage {
            model: model.to_string(),
            calls: 1,
            input_tokens: input,
            output_tokens: output,
            thinking_tokens: thinking,
        }
    }

    #[test]
    fn known_model_rates() {
        assert_eq!(model_rates("claude-opus-4-6"), (15.00, 75.00));
        assert_eq!(model_rates("claude-sonnet-4-6"), (3.00, 15.00));
    }

    #[test]
    fn unknown_model_uses_fallback_rate() {
        assert_eq!(model_rates("some-future-model"), (3.00, 15.00));
    }

    #[test]
    fn thinking_tokens_priced_as_output() {
        let with_thinking = cost_of(&[usage("claude-opus-4-6", 0, 0, 1_000_000)]);
        let as_output = cost_of(&[usage("claude-opus-4-6", 0, 1_000_000, 0)]);
        assert!((with_thinking - as_output).abs() < f64::EPSILON);
        assert!((with_thinking - 75.0).abs() < 1e-9);
    }

    #[test]
    fn cost_sums_across_models() {
        let rows = vec![
            usage("claude-sonnet-4-6", 1_000_000, 0, 0), // $3
            usage("claude-opus-4-6", 0, 1_000_000, 0),   // $75
        ];
        assert!((cost_of(&rows) - 78.0).abs() < 1e-9);
    }

    #[test]
    fn no_budget_never_escalates() {
        let store = Store::open_in_memory().unwrap();
        store.record_usage("claude-opus-4-6", 0, 10_000_000, 0).unwrap();
        assert!(!daily_spend_exceeds_fraction(&store, 0.0, ESCALATION_FRACTION));
    }

    #[test]
    fn escalation_triggers_past_the_fraction() {
        let store = Store::open_in_memory().unwrap();
        // 1M opus output tokens today = $75.
        store.record_usage("claude-opus-4-6", 0, 1_000_000, 0).unwrap();
        assert!(daily_spend_exceeds_fraction(&store, 100.0, 0.70));
        assert!(!daily_spend_exceeds_fraction(&store, 200.0, 0.70));
    }

    #[test]
    fn budget_check_reports_violated_period() {
        let store = Store::open_in_memory().unwrap();
        store.record_usage("claude-opus-4-6", 0, 1_000_000, 0).unwrap(); // $75
        match check_budget(&store, 50.0, 0.0) {
            Err((label, spend, limit)) => {
                assert_eq!(label, "daily");
                assert!(spend >= limit);
            }
            Ok(()) => panic!("expected daily budget breach"),
        }
        assert!(check_budget(&store, 100.0, 100.0).is_ok());
    }

    #[test]
    fn utc_midnight_is_today_and_not_in_the_future() {
        let midnight = utc_midnight_epoch();
        let now = Utc::now().timestamp() as f64;
        assert!(midnight <= now);
        assert!(now - midnight < 86_400.0);
    }
}
