//! Prometheus metrics for quota operations

use crate::error::{FaucetError, FaucetResult};
use prometheus::{opts, Encoder, IntCounterVec, Registry, TextEncoder};
use quota_common::Amount;

pub struct FaucetMetrics {
    registry: Registry,
    /// Operations by name and outcome (`ok` or an error code)
    pub operations_total: IntCounterVec,
    /// Amount moved, by direction (`disbursed`, `returned`); saturates at `u64::MAX`
    pub amount_total: IntCounterVec,
}

impl FaucetMetrics {
    pub fn new() -> FaucetResult<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            opts!("faucet_operations_total", "Quota operations by outcome"),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;

        let amount_total = IntCounterVec::new(
            opts!("faucet_amount_total", "Amount moved through the faucet"),
            &["direction"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(amount_total.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations_total,
            amount_total,
        })
    }

    pub fn record_operation(&self, operation: &str, outcome: &str) {
        self.operations_total.with_label_values(&[operation, outcome]).inc();
    }

    pub fn record_amount(&self, direction: &str, amount: Amount) {
        let counter = self.amount_total.with_label_values(&[direction]);
        counter.inc_by(u64::try_from(amount.0).unwrap_or(u64::MAX).min(u64::MAX - counter.get()));
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> FaucetResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| FaucetError::InternalError(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> FaucetError {
    FaucetError::InternalError(format!("Metrics: {}", err))
}
