//! Output formatting utilities

use std::fmt;

use anyhow::{bail, Result};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use serde::Serialize;
use tally_core::{Currency, OperationResult};

/// Marker error: the failure was already printed as JSON
#[derive(Debug)]
pub struct AlreadyReported;

impl fmt::Display for AlreadyReported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("command failed")
    }
}

impl std::error::Error for AlreadyReported {}

/// Print a success message
pub fn success(msg: &str) {
    println!("{}", msg.green());
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{}", msg.red());
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{}", msg.yellow());
}

/// Create a styled table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a core result wrapped in an `OperationResult` envelope
pub fn print_json<T: Serialize>(result: tally_core::Result<T>) -> Result<()> {
    let envelope = OperationResult::from(result);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    if envelope.success {
        Ok(())
    } else {
        Err(AlreadyReported.into())
    }
}

/// Format minor units as a signed decimal amount with currency code
pub fn format_amount(minor: impl Into<i128>, currency: Currency) -> String {
    let minor: i128 = minor.into();
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, currency)
}

/// Parse a positive major-unit amount ("12", "12.5", "12.50") into minor units
pub fn parse_amount(input: &str) -> Result<i64> {
    let input = input.trim();
    let (whole, fraction) = match input.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (input, ""),
    };

    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid amount {:?}: expected a number like 12.50", input);
    }
    if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid amount {:?}: at most two decimal places", input);
    }

    let cents = format!("{:0<2}", fraction).parse::<i64>()?;
    let minor = whole
        .parse::<i64>()
        .ok()
        .and_then(|w| w.checked_mul(100))
        .and_then(|w| w.checked_add(cents));
    match minor {
        Some(minor) => Ok(minor),
        None => bail!("Amount {:?} is too large", input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("12").unwrap(), 1200);
        assert_eq!(parse_amount("12.5").unwrap(), 1250);
        assert_eq!(parse_amount(" 0.07 ").unwrap(), 7);
        assert!(parse_amount("-3").is_err());
        assert!(parse_amount("1.234").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount(".5").is_err());
        assert!(parse_amount("99999999999999999999").is_err());
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1250, Currency::Usd), "12.50 USD");
        assert_eq!(format_amount(-7, Currency::Eur), "-0.07 EUR");
    }
}
