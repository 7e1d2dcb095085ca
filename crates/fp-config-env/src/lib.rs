// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment variable parsing for function platform runtime configuration.
//!
//! Typed getters over `std::env` for the variables listed in the platform
//! contract's Configuration section (`EXECUTION_TIMEOUT_MS`,
//! `MAX_POOL_SIZE`, `MIN_POOL`, `MAX_CACHE_SIZE_GB`, `CACHE_TTL_DAYS`,
//! `CACHE_DIR`, `DEBOUNCE_MS`, connection strings, channel names). `fp-config`
//! layers these on top of file-parsed defaults.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::str::FromStr;

/// Errors that can occur while reading a typed environment variable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvParseError {
    /// The variable was present but not valid UTF-8.
    #[error("environment variable {name} is not valid unicode")]
    NotUnicode {
        /// Variable name.
        name: String,
    },
    /// The variable was present but failed to parse as the requested type.
    #[error("environment variable {name}={value:?} is not a valid {expected}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Raw string value.
        value: String,
        /// Expected type description, e.g. `"u64"`.
        expected: &'static str,
    },
}

/// Read an optional environment variable as a raw `String`.
pub fn read_string(name: &str) -> Result<Option<String>, EnvParseError> {
    match std::env::var(name) {
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(EnvParseError::NotUnicode {
            name: name.to_string(),
        }),
    }
}

/// Read and parse an optional environment variable via [`FromStr`].
pub fn read_parsed<T>(name: &str) -> Result<Option<T>, EnvParseError>
where
    T: FromStr,
{
    let Some(raw) = read_string(name)? else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| EnvParseError::InvalidValue {
            name: name.to_string(),
            value: raw,
            expected: std::any::type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn missing_variable_is_none() {
        std::env::remove_var("FP_TEST_MISSING");
        assert_eq!(read_string("FP_TEST_MISSING").unwrap(), None);
        assert_eq!(read_parsed::<u64>("FP_TEST_MISSING").unwrap(), None);
    }

    #[test]
    #[serial]
    fn parses_u64() {
        std::env::set_var("FP_TEST_U64", "30000");
        assert_eq!(read_parsed::<u64>("FP_TEST_U64").unwrap(), Some(30_000));
        std::env::remove_var("FP_TEST_U64");
    }

    #[test]
    #[serial]
    fn invalid_u64_is_rejected() {
        std::env::set_var("FP_TEST_U64_BAD", "not-a-number");
        let err = read_parsed::<u64>("FP_TEST_U64_BAD").unwrap_err();
        assert!(matches!(err, EnvParseError::InvalidValue { .. }));
        std::env::remove_var("FP_TEST_U64_BAD");
    }
}
