pub mod anthropic;
pub mod ollama;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::budget;
use crate::core::guards::ram_used_percent;
use crate::core::store::Store;

use anthropic::AnthropicClient;
use ollama::OllamaClient;

/// RAM ceiling for routing low-complexity work to the local model.
const LOCAL_RAM_CEILING_PERCENT: u64 = 75;

thread_local! {
    static WORKER_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// RAII marker for a pipeline worker thread. The gateway's event-loop
/// guard treats any unmarked thread that carries a runtime handle as the
/// async runtime itself: spawn_blocking threads still see the handle, so
/// a plain `Handle::try_current()` check cannot tell them apart.
pub struct WorkerScope(());

impl Drop for WorkerScope {
    fn drop(&mut self) {
        WORKER_THREAD.with(|c| c.set(false));
    }
}

/// Mark the current thread as a sanctioned blocking worker for the
/// lifetime of the returned scope.
pub fn enter_worker() -> WorkerScope {
    WORKER_THREAD.with(|c| c.set(true));
    WorkerScope(())
}

fn on_marked_worker() -> bool {
    WORKER_THREAD.with(|c| c.get())
}

/// Should the event-loop guard fire? Pure for testability.
fn misused_on_event_loop(marked_worker: bool, has_runtime_handle: bool) -> bool {
    has_runtime_handle && !marked_worker
}

/// What a model call is for. Routing is keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Classify,
    Plan,
    CodeGen,
    Audit,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Low,
    High,
}

/// Where a call was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Remote { model: String },
    Local { model: String },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{period} budget exceeded: ${spend:.2} >= ${limit:.2} limit")]
    BudgetExceeded {
        period: String,
        spend: f64,
        limit: f64,
    },
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("transient API error: {0}")]
    Api(String),
    #[error("model returned no usable text")]
    Empty,
    #[error("{0}")]
    Fatal(String),
}

impl GatewayError {
    /// Transient kinds the gateway retries with backoff.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited
                | GatewayError::Timeout
                | GatewayError::Api(_)
                | GatewayError::Empty
        )
    }
}

/// Parameters of a single gateway call.
pub struct CallRequest<'a> {
    pub purpose: Purpose,
    pub complexity: Complexity,
    pub prompt: &'a str,
    pub system: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
    pub thinking: bool,
}

impl<'a> CallRequest<'a> {
    pub fn new(purpose: Purpose, prompt: &'a str, system: &'a str) -> Self {
        Self {
            purpose,
            complexity: Complexity::High,
            prompt,
            system,
            max_tokens: 2000,
            temperature: 0.0,
            thinking: false,
        }
    }

    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn thinking(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }
}

/// Pure routing decision, separated from I/O so the rules are testable.
///
/// Rules, in order:
/// 1. audit → remote high-capability model. Cross-model review is the core
///    safety invariant; audit never routes to the local model.
/// 2. code_gen → remote default model.
/// 3. budget escalation: past the spend fraction, low-complexity
///    classify/plan goes local when the endpoint is healthy, even under
///    RAM pressure. High-complexity work is never demoted.
/// 4. low-complexity classify/plan → local when healthy and RAM is low.
/// 5. everything else → remote default.
pub fn select_route(
    purpose: Purpose,
    complexity: Complexity,
    spend_escalated: bool,
    local_healthy: bool,
    ram_percent: Option<u64>,
    default_model: &str,
    complex_model: &str,
    local_model: &str,
) -> Route {
    if purpose == Purpose::Audit {
        return Route::Remote {
            model: complex_model.to_string(),
        };
    }
    if purpose == Purpose::CodeGen {
        return Route::Remote {
            model: default_model.to_string(),
        };
    }

    let routable = matches!(purpose, Purpose::Classify | Purpose::Plan);

    if routable && complexity == Complexity::Low && spend_escalated && local_healthy {
        return Route::Local {
            model: local_model.to_string(),
        };
    }

    if routable
        && complexity == Complexity::Low
        && local_healthy
        && ram_percent
            .map(|p| p < LOCAL_RAM_CEILING_PERCENT)
            .unwrap_or(false)
    {
        return Route::Local {
            model: local_model.to_string(),
        };
    }

    Route::Remote {
        model: default_model.to_string(),
    }
}

/// The single call surface every pipeline node uses.
///
/// Synchronous by design: nodes run inside blocking workers. Calling this
/// from the async runtime would stall the event loop, so the guard below
/// logs loudly if it ever happens.
pub struct Gateway {
    config: Arc<Config>,
    store: Arc<Store>,
    remote: AnthropicClient,
    local: OllamaClient,
}

impl Gateway {
    pub fn new(config: Arc<Config>, store: Arc<Store>) -> Self {
        let remote = AnthropicClient::new(config.anthropic_api_key.clone());
        let local = OllamaClient::new(config.ollama_base_url.clone());
        Self {
            config,
            store,
            remote,
            local,
        }
    }

    pub fn local_client(&self) -> &OllamaClient {
        &self.local
    }

    /// Route and execute a model call. Returns the response text.
    pub fn call(&self, req: CallRequest<'_>) -> Result<String, GatewayError> {
        // Event-loop guard: this path blocks (HTTP + backoff sleeps) and
        // must only ever run inside a marked worker thread.
        if misused_on_event_loop(
            on_marked_worker(),
            tokio::runtime::Handle::try_current().is_ok(),
        ) {
            error!(
                "Gateway::call() invoked on the async runtime! This stalls the \
                 event loop. Wrap the caller in spawn_blocking."
            );
        }

        let spend_escalated = budget::daily_spend_exceeds_fraction(
            &self.store,
            self.config.daily_budget_usd,
            budget::ESCALATION_FRACTION,
        );
        // Escalation never overrides the complexity gate: only
        // low-complexity purposes are ever local candidates.
        let local_candidate = matches!(req.purpose, Purpose::Classify | Purpose::Plan)
            && req.complexity == Complexity::Low;
        // The health probe costs a round-trip; only pay it when the
        // decision can depend on it.
        let local_healthy = local_candidate && self.local.healthy();

        let route = select_route(
            req.purpose,
            req.complexity,
            spend_escalated,
            local_healthy,
            ram_used_percent(),
            &self.config.default_model,
            &self.config.complex_model,
            &self.config.ollama_default_model,
        );
        info!(
            "Routed {:?} (complexity={:?}) to {:?}",
            req.purpose, req.complexity, route
        );

        if let Route::Local { model } = &route {
            match self.local.generate(model, req.prompt, req.system) {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!("Local model call failed, falling back to remote: {e}");
                }
            }
        }

        let model = match &route {
            Route::Remote { model } => model.clone(),
            // Local fallback lands on the remote default model.
            Route::Local { .. } => self.config.default_model.clone(),
        };
        self.call_remote(&model, &req)
    }

    fn call_remote(&self, model: &str, req: &CallRequest<'_>) -> Result<String, GatewayError> {
        if let Err((period, spend, limit)) = budget::check_budget(
            &self.store,
            self.config.daily_budget_usd,
            self.config.monthly_budget_usd,
        ) {
            return Err(GatewayError::BudgetExceeded {
                period,
                spend,
                limit,
            });
        }

        let thinking = req.thinking && self.config.enable_thinking;
        let max_attempts = self.config.api_max_retries.max(1);
        let mut last_err = GatewayError::Fatal("no attempts made".to_string());

        for attempt in 0..max_attempts {
            match self.remote.complete(
                model,
                req.prompt,
                req.system,
                req.max_tokens,
                req.temperature,
                thinking,
            ) {
                Ok(completion) => {
                    if let Err(e) = self.store.record_usage(
                        model,
                        completion.input_tokens,
                        completion.output_tokens,
                        completion.thinking_tokens,
                    ) {
                        warn!("Failed to persist usage record: {e}");
                    }
                    return Ok(completion.text);
                }
                Err(e) if e.is_retryable() => {
                    let wait = backoff_delay(&e, attempt);
                    warn!(
                        "{e}, retrying in {}s (attempt {}/{max_attempts})",
                        wait.as_secs(),
                        attempt + 1
                    );
                    last_err = e;
                    if attempt + 1 < max_attempts {
                        std::thread::sleep(wait);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        error!("Remote model failed after {max_attempts} attempts: {last_err}");
        Err(last_err)
    }
}

/// Exponential backoff; rate-limit and empty responses start one step
/// higher since they recover more slowly than plain timeouts.
fn backoff_delay(err: &GatewayError, attempt: u32) -> Duration {
    let exponent = match err {
        GatewayError::RateLimited | GatewayError::Empty => attempt + 1,
        _ => attempt,
    };
    Duration::from_secs(1u64 << exponent.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: &str = "claude-sonnet-4-6";
    const COMPLEX: &str = "claude-opus-4-6";
    const LOCAL: &str = "llama3.1:8b";

    fn route(
        purpose: Purpose,
        complexity: Complexity,
        escalated: bool,
        healthy: bool,
        ram: Option<u64>,
    ) -> Route {
        select_route(
            purpose, complexity, escalated, healthy, ram, DEFAULT, COMPLEX, LOCAL,
        )
    }

    #[test]
    fn audit_always_routes_to_remote_complex_model() {
        // Even with budget escalation and a healthy local endpoint.
        let r = route(Purpose::Audit, Complexity::Low, true, true, Some(10));
        assert_eq!(
            r,
            Route::Remote {
                model: COMPLEX.to_string()
            }
        );
    }

    #[test]
    fn code_gen_always_routes_to_remote_default() {
        let r = route(Purpose::CodeGen, Complexity::Low, true, true, Some(10));
        assert_eq!(
            r,
            Route::Remote {
                model: DEFAULT.to_string()
            }
        );
    }

    #[test]
    fn low_complexity_classify_goes_local_when_healthy_and_ram_is_low() {
        let r = route(Purpose::Classify, Complexity::Low, false, true, Some(50));
        assert_eq!(
            r,
            Route::Local {
                model: LOCAL.to_string()
            }
        );
    }

    #[test]
    fn high_ram_keeps_classify_remote() {
        let r = route(Purpose::Classify, Complexity::Low, false, true, Some(80));
        assert_eq!(
            r,
            Route::Remote {
                model: DEFAULT.to_string()
            }
        );
    }

    #[test]
    fn unknown_ram_is_treated_as_unsafe_for_local() {
        let r = route(Purpose::Classify, Complexity::Low, false, true, None);
        assert!(matches!(r, Route::Remote { .. }));
    }

    #[test]
    fn unhealthy_local_endpoint_keeps_everything_remote() {
        let r = route(Purpose::Plan, Complexity::Low, true, false, Some(10));
        assert_eq!(
            r,
            Route::Remote {
                model: DEFAULT.to_string()
            }
        );
    }

    #[test]
    fn budget_escalation_routes_low_purposes_local_regardless_of_ram() {
        let r = route(Purpose::Classify, Complexity::Low, true, true, Some(99));
        assert_eq!(
            r,
            Route::Local {
                model: LOCAL.to_string()
            }
        );
        // General-purpose calls stay remote even under escalation.
        let r = route(Purpose::General, Complexity::Low, true, true, Some(10));
        assert!(matches!(r, Route::Remote { .. }));
    }

    #[test]
    fn high_complexity_plan_stays_remote() {
        let r = route(Purpose::Plan, Complexity::High, false, true, Some(10));
        assert_eq!(
            r,
            Route::Remote {
                model: DEFAULT.to_string()
            }
        );
    }

    #[test]
    fn budget_escalation_never_demotes_high_complexity_work() {
        // A budget-escalated Plan on a complex task must still reach the
        // remote default model, healthy local endpoint or not.
        for purpose in [Purpose::Plan, Purpose::Classify] {
            let r = route(purpose, Complexity::High, true, true, Some(10));
            assert_eq!(
                r,
                Route::Remote {
                    model: DEFAULT.to_string()
                },
                "escalated high-complexity {purpose:?} was demoted"
            );
        }
    }

    #[test]
    fn retryable_error_kinds() {
        assert!(GatewayError::RateLimited.is_retryable());
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Api("503".into()).is_retryable());
        assert!(GatewayError::Empty.is_retryable());
        assert!(!GatewayError::Fatal("bad request".into()).is_retryable());
        assert!(!GatewayError::BudgetExceeded {
            period: "daily".into(),
            spend: 10.0,
            limit: 5.0
        }
        .is_retryable());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let d0 = backoff_delay(&GatewayError::Timeout, 0);
        let d3 = backoff_delay(&GatewayError::Timeout, 3);
        assert!(d0 < d3);
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d3, Duration::from_secs(8));
        // Rate limits wait one step longer than plain timeouts.
        assert_eq!(
            backoff_delay(&GatewayError::RateLimited, 0),
            Duration::from_secs(2)
        );
        // Capped.
        assert_eq!(
            backoff_delay(&GatewayError::Timeout, 40),
            Duration::from_secs(64)
        );
    }

    #[test]
    fn event_loop_guard_fires_only_off_worker_threads() {
        // On the runtime without the worker mark: misuse.
        assert!(misused_on_event_loop(false, true));
        // Inside a marked worker (spawn_blocking still sees the handle).
        assert!(!misused_on_event_loop(true, true));
        // Plain threads without a runtime are fine either way.
        assert!(!misused_on_event_loop(false, false));
    }

    #[test]
    fn worker_scope_is_thread_local_and_reentrant_safe() {
        assert!(!on_marked_worker());
        {
            let _scope = enter_worker();
            assert!(on_marked_worker());
        }
        assert!(!on_marked_worker());
    }

    #[test]
    fn budget_error_message_names_the_period() {
        let e = GatewayError::BudgetExceeded {
            period: "daily".into(),
            spend: 12.5,
            limit: 10.0,
        };
        let msg = e.to_string();
        assert!(msg.contains("daily"));
        assert!(msg.contains("$12.50"));
    }
}
