//! Cost-Tracking Gateway.
//!
//! Supervises the local reverse proxy that the sandboxed agent's model-API
//! calls are routed through, and reconstructs token usage and dollar cost
//! from its log.

pub mod pricing;
pub mod proxy;
pub mod usage;

pub use pricing::{estimate_cost, pricing_for, ModelPricing};
pub use proxy::{free_port, rewrite_host, Gateway, GatewayConfig, UsageSource};
pub use usage::{parse_usage_logs, UsageRecord, UsageSummary};
