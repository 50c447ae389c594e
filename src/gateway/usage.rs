//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every provider call through a UsageSink:
//! - the CLI uses `TallyUsageSink` to print a per-run summary
//! - tests use `NoopUsageSink`

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name: "openrouter" or "endpoint".
    pub provider: &'static str,
    /// Model used.
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<&'static str>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// Survey run the call belongs to.
    pub run_id: Option<Uuid>,
    /// Configuration label the call was made for.
    pub configuration: Option<String>,
    /// Attempt number within the gateway retry loop (0-based).
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            run_id: None,
            configuration: None,
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn configuration(mut self, label: Option<String>) -> Self {
        self.configuration = label;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: &'static str) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code);
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures are not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Totals accumulated by [`TallyUsageSink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTally {
    pub calls: u64,
    pub errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Counts calls, errors and tokens across a run. Each record is also
/// emitted as a `tracing` debug event.
#[derive(Debug, Default)]
pub struct TallyUsageSink {
    calls: AtomicU64,
    errors: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl TallyUsageSink {
    pub fn snapshot(&self) -> UsageTally {
        UsageTally {
            calls: self.calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl UsageSink for TallyUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::debug!(
            provider = record.provider,
            model = %record.model,
            status = record.status.as_str(),
            error_code = record.error_code.unwrap_or(""),
            attempt = record.attempt,
            latency_ms = record.latency_ms,
            tokens = record.input_tokens + record.output_tokens,
            configuration = record.configuration.as_deref().unwrap_or(""),
            caller = record.caller,
            "provider call"
        );
        self.calls.fetch_add(1, Ordering::Relaxed);
        if record.status == CallStatus::Error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.input_tokens
            .fetch_add(u64::from(record.input_tokens), Ordering::Relaxed);
        self.output_tokens
            .fetch_add(u64::from(record.output_tokens), Ordering::Relaxed);
    }
}
