//! Token accounting and spend estimates.
//!
//! The text pipeline knows its whole workload before the first request: every
//! block, and the instruction wrapped around each one. That makes it possible
//! to price the run up front and refuse it when the projection exceeds the
//! ceiling, before a single paid call is made.

use crate::error::ScanbookError;
use crate::pipeline::chunk::TextBlock;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Tokens sent and received by one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Published list prices, USD per 1M tokens (input, output).
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o", 5.00, 15.00),
    ("gpt-4o-2024-08-06", 2.50, 10.00),
    ("gpt-4o-2024-05-13", 5.00, 15.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o-mini-2024-07-18", 0.15, 0.60),
    ("chatgpt-4o-latest", 5.00, 15.00),
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1-nano", 0.10, 0.40),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-4-turbo-2024-04-09", 10.00, 30.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-4-32k", 60.00, 120.00),
    ("gpt-3.5-turbo-0125", 0.50, 1.50),
    ("claude-sonnet-4-20250514", 3.00, 15.00),
    ("claude-haiku-4-20250514", 0.80, 4.00),
    ("gemini-2.0-flash", 0.10, 0.40),
    ("gemini-2.5-pro", 1.25, 10.00),
];

/// Look up the list price of `model`.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    PRICING
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|&(_, input, output)| ModelPricing::new(input, output))
}

/// Projected or actual spend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostEstimate {
    pub sent_tokens: u64,
    pub received_tokens: u64,
    pub sent_usd: f64,
    pub received_usd: f64,
}

impl CostEstimate {
    pub fn price(sent_tokens: u64, received_tokens: u64, pricing: &ModelPricing) -> Self {
        Self {
            sent_tokens,
            received_tokens,
            sent_usd: sent_tokens as f64 * pricing.input_per_million / 1_000_000.0,
            received_usd: received_tokens as f64 * pricing.output_per_million / 1_000_000.0,
        }
    }

    pub fn total_usd(&self) -> f64 {
        self.sent_usd + self.received_usd
    }
}

/// Project the spend of reformatting `blocks`.
///
/// Each block is sent with the instruction wrapped around it and is expected
/// to come back at roughly its own size.
pub fn estimate_formatting_cost(
    blocks: &[TextBlock],
    instruction_tokens: usize,
    pricing: &ModelPricing,
) -> CostEstimate {
    let data_tokens: u64 = blocks.iter().map(|b| b.tokens as u64).sum();
    let sent = blocks.len() as u64 * instruction_tokens as u64 + data_tokens;
    CostEstimate::price(sent, data_tokens, pricing)
}

/// Refuse a run whose projected spend is above `ceiling_usd`.
pub fn enforce_ceiling(estimate: &CostEstimate, ceiling_usd: f64) -> Result<(), ScanbookError> {
    let total = estimate.total_usd();
    if total > ceiling_usd {
        return Err(ScanbookError::CostCeilingExceeded {
            estimated_usd: total,
            ceiling_usd,
        });
    }
    Ok(())
}

/// Running total of tokens actually consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenLedger {
    pub sent: u64,
    pub received: u64,
}

impl TokenLedger {
    pub fn record(&mut self, usage: TokenUsage) {
        self.sent += usage.input;
        self.received += usage.output;
    }

    pub fn spend(&self, pricing: &ModelPricing) -> CostEstimate {
        CostEstimate::price(self.sent, self.received, pricing)
    }
}
