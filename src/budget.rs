use serde::{Deserialize, Serialize};

pub const MIN_BUDGET_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Providers only accept this temperature while extended thinking is on.
pub const THINKING_TEMPERATURE: f32 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Max,
}

impl ReasoningEffort {
    pub const fn budget_tokens(self) -> u32 {
        match self {
            ReasoningEffort::Low => 1024,
            ReasoningEffort::Medium => 8192,
            ReasoningEffort::High => 16384,
            ReasoningEffort::Max => 32768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

impl ThinkingConfig {
    pub fn enabled(budget_tokens: u32) -> Self {
        Self {
            kind: "enabled".to_string(),
            budget_tokens: Some(budget_tokens),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kind == "enabled"
    }
}

/// Resolved token and sampling parameters for one upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetPlan {
    pub budget_tokens: Option<u32>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl BudgetPlan {
    pub fn thinking(&self) -> Option<ThinkingConfig> {
        self.budget_tokens.map(ThinkingConfig::enabled)
    }
}

/// Resolves the reasoning budget.
///
/// An explicit `thinking` block overrides the effort table; `{"type":"disabled"}`
/// turns thinking off even when an effort is given. Without a caller
/// `max_tokens`, room for `answer_tokens` is added on top of the budget.
pub fn plan(
    effort: Option<ReasoningEffort>,
    thinking: Option<&ThinkingConfig>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    answer_tokens: u32,
) -> BudgetPlan {
    let budget = match thinking {
        Some(cfg) if !cfg.is_enabled() => None,
        Some(cfg) => Some(
            cfg.budget_tokens
                .unwrap_or_else(|| effort.unwrap_or(ReasoningEffort::Medium).budget_tokens()),
        ),
        None => effort.map(ReasoningEffort::budget_tokens),
    };

    let Some(budget) = budget else {
        return BudgetPlan {
            budget_tokens: None,
            max_tokens: max_tokens.unwrap_or(answer_tokens),
            temperature: temperature.unwrap_or(DEFAULT_TEMPERATURE).clamp(0.0, 2.0),
        };
    };

    let max_tokens = max_tokens.unwrap_or_else(|| budget.saturating_add(answer_tokens));
    let budget = clamp_budget(budget, max_tokens);

    if let Some(t) = temperature {
        if t != THINKING_TEMPERATURE {
            tracing::debug!(
                "Overriding temperature {} -> {} for extended thinking",
                t,
                THINKING_TEMPERATURE
            );
        }
    }

    BudgetPlan {
        budget_tokens: Some(budget),
        max_tokens,
        temperature: THINKING_TEMPERATURE,
    }
}

/// The budget must stay strictly below `max_tokens`.
fn clamp_budget(budget: u32, max_tokens: u32) -> u32 {
    if budget < max_tokens {
        return budget;
    }
    let clamped = MIN_BUDGET_TOKENS.max(max_tokens.saturating_sub(1024));
    if clamped < max_tokens {
        clamped
    } else {
        max_tokens.saturating_sub(1).max(1)
    }
}
