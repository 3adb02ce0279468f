//! Request parameter validation shared by the HTTP handlers.

use alloy::primitives::{Address, U256};

use crate::network::{NetworkConfig, NetworkRegistry, UnsupportedNetwork};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} missing")]
    Missing(&'static str),
    #[error("{0} must be valid number")]
    InvalidNumber(&'static str),
    #[error("{0} must be valid address")]
    InvalidAddress(&'static str),
    #[error(transparent)]
    UnsupportedNetwork(#[from] UnsupportedNetwork),
}

pub fn validate_string<'a>(
    param: Option<&'a str>,
    label: &'static str,
) -> Result<&'a str, ValidationError> {
    match param.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ValidationError::Missing(label)),
    }
}

pub fn validate_number(param: Option<&str>, label: &'static str) -> Result<u64, ValidationError> {
    validate_string(param, label)?
        .parse()
        .map_err(|_| ValidationError::InvalidNumber(label))
}

/// Parses a decimal or `0x`-prefixed hex 256-bit integer.
pub fn validate_u256(param: Option<&str>, label: &'static str) -> Result<U256, ValidationError> {
    let value = validate_string(param, label)?;
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(value, 10),
    };
    parsed.map_err(|_| ValidationError::InvalidNumber(label))
}

pub fn validate_address(
    param: Option<&str>,
    label: &'static str,
) -> Result<Address, ValidationError> {
    validate_string(param, label)?
        .parse()
        .map_err(|_| ValidationError::InvalidAddress(label))
}

pub fn validate_network<'a>(
    param: Option<&str>,
    registry: &'a NetworkRegistry,
) -> Result<&'a NetworkConfig, ValidationError> {
    let value = validate_string(param, "chainId")?;
    Ok(registry.resolve(value)?)
}
