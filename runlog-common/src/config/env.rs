//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `RUNLOG_*` environment variables with
//! validation, error collection, and source tracking.

use super::source::Sourced;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the RUNLOG_ prefix reading the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Create a parser reading variables through `lookup` instead of the
    /// process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            prefix: "RUNLOG_",
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn read(&self, var_name: &str) -> Option<String> {
        (self.lookup)(var_name)
    }

    /// Get a raw value if the variable is set.
    pub fn get_raw(&self, name: &str) -> Option<Sourced<String>> {
        let var_name = self.var_name(name);
        self.read(&var_name)
            .map(|value| Sourced::from_env(value, var_name))
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        self.get_raw(name)
            .unwrap_or_else(|| Sourced::default_value(default.to_string()))
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Some(value) => Sourced::from_env(Some(value), var_name),
            None => Sourced::default_value(None),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            None => Sourced::default_value(default),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        self.get_range(name, default, min, max, "unsigned 64-bit integer")
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.get_range(name, default, min, max, "unsigned 32-bit integer")
    }

    /// Get a usize value with default and range validation.
    pub fn get_usize_range(
        &mut self,
        name: &str,
        default: usize,
        min: usize,
        max: usize,
    ) -> Sourced<usize> {
        self.get_range(name, default, min, max, "unsigned integer")
    }

    fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T, expected: &str) -> Sourced<T>
    where
        T: FromStr + PartialOrd + fmt::Display + Copy,
    {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => match value.trim().parse::<T>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: expected.to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.read(&var_name) {
            Some(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::from_env(default.to_string(), var_name)
                    }
                }
            }
            None => Sourced::default_value(default.to_string()),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvParser::with_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn test_get_bool_true_values() {
        for val in ["1", "true", "yes", "on", "TRUE", "Yes"] {
            let mut parser = parser(&[("RUNLOG_TEST_BOOL", val)]);
            let result = parser.get_bool("TEST_BOOL", false);
            assert!(result.value, "Expected true for '{}'", val);
            assert!(!parser.has_errors());
        }
    }

    #[test]
    fn test_get_bool_false_values() {
        for val in ["0", "false", "no", "off", "FALSE", ""] {
            let mut parser = parser(&[("RUNLOG_TEST_BOOL", val)]);
            let result = parser.get_bool("TEST_BOOL", true);
            assert!(!result.value, "Expected false for '{}'", val);
            assert!(!parser.has_errors());
        }
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let mut parser = parser(&[("RUNLOG_BAD_BOOL", "maybe")]);
        let result = parser.get_bool("BAD_BOOL", false);
        assert!(!result.value);
        assert!(parser.has_errors());
    }

    #[test]
    fn test_get_u64_range_valid() {
        let mut parser = parser(&[("RUNLOG_TEST_U64", "50")]);
        let result = parser.get_u64_range("TEST_U64", 10, 0, 100);
        assert_eq!(result.value, 50);
        assert!(!result.is_default());
        assert!(!parser.has_errors());
    }

    #[test]
    fn test_get_u64_range_out_of_range() {
        let mut parser = parser(&[("RUNLOG_TEST_U64", "200")]);
        let result = parser.get_u64_range("TEST_U64", 10, 0, 100);
        assert_eq!(result.value, 10);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));
    }

    #[test]
    fn test_get_usize_range_not_a_number() {
        let mut parser = parser(&[("RUNLOG_CAP", "lots")]);
        let result = parser.get_usize_range("CAP", 7, 1, 100);
        assert_eq!(result.value, 7);
        assert!(result.is_default());
        assert!(matches!(
            parser.take_errors().as_slice(),
            [EnvError::InvalidValue { .. }]
        ));
        assert!(!parser.has_errors());
    }

    #[test]
    fn test_missing_values_use_default_source() {
        let mut parser = parser(&[]);
        assert!(parser.get_string("NAME", "x").is_default());
        assert_eq!(parser.get_optional_string("NAME").value, None);
        assert_eq!(parser.get_log_level("LOG", "info").value, "info");
    }

    #[test]
    fn test_empty_optional_string_is_none() {
        let mut parser = parser(&[("RUNLOG_MAIN", "")]);
        let result = parser.get_optional_string("MAIN");
        assert_eq!(result.value, None);
        assert!(!result.is_default());
    }

    #[test]
    fn test_log_level_validation() {
        let mut parser = parser(&[("RUNLOG_LOG", "LOUD")]);
        let result = parser.get_log_level("LOG", "warn");
        assert_eq!(result.value, "warn");
        assert!(matches!(
            parser.errors()[0],
            EnvError::InvalidLogLevel { .. }
        ));
    }
}
