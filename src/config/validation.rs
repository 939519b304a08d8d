//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, caps > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::EngineConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("pool.max_idle_per_key ({per_key}) exceeds pool.max_idle_total ({total})")]
    PerKeyAboveTotal { per_key: usize, total: usize },

    #[error("tls.{0} must not be empty")]
    EmptyPath(&'static str),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::EmptyPath("cert_path"));
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::EmptyPath("key_path"));
        }
    }

    if config.pool.max_idle_per_key == 0 {
        errors.push(ValidationError::Zero("pool.max_idle_per_key"));
    }
    if config.pool.max_idle_total == 0 {
        errors.push(ValidationError::Zero("pool.max_idle_total"));
    } else if config.pool.max_idle_per_key > config.pool.max_idle_total {
        errors.push(ValidationError::PerKeyAboveTotal {
            per_key: config.pool.max_idle_per_key,
            total: config.pool.max_idle_total,
        });
    }
    if config.pool.idle_ttl_secs == 0 {
        errors.push(ValidationError::Zero("pool.idle_ttl_secs"));
    }
    if config.pool.purge_interval_secs == 0 {
        errors.push(ValidationError::Zero("pool.purge_interval_secs"));
    }

    if config.http2.max_concurrent_streams == 0 {
        errors.push(ValidationError::Zero("http2.max_concurrent_streams"));
    }
    if config.http2.initial_window_size == 0 {
        errors.push(ValidationError::Zero("http2.initial_window_size"));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.connect_secs"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.request_secs"));
    }
    if config.dns.timeout_secs == 0 {
        errors.push(ValidationError::Zero("dns.timeout_secs"));
    }

    if config.limits.max_head_bytes == 0 {
        errors.push(ValidationError::Zero("limits.max_head_bytes"));
    }
    if config.limits.max_body_bytes == 0 {
        errors.push(ValidationError::Zero("limits.max_body_bytes"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
