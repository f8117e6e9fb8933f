use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Locale settings for monetary amounts written into audit descriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoneyFormat {
    pub symbol: String,
    pub thousands_separator: char,
    pub decimal_separator: char,
}

impl Default for MoneyFormat {
    fn default() -> Self {
        Self {
            symbol: "R$".to_string(),
            thousands_separator: '.',
            decimal_separator: ',',
        }
    }
}

impl MoneyFormat {
    /// Two decimal places, half away from zero, grouped thousands
    pub fn format(&self, amount: Decimal) -> String {
        let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(2);
        let negative = rounded.is_sign_negative() && !rounded.is_zero();
        let digits = rounded.abs().to_string();
        let (integer, fraction) = digits.split_once('.').unwrap_or((digits.as_str(), "00"));

        let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
        for (i, c) in integer.chars().enumerate() {
            if i > 0 && (integer.len() - i) % 3 == 0 {
                grouped.push(self.thousands_separator);
            }
            grouped.push(c);
        }

        format!(
            "{}{} {}{}{}",
            if negative { "-" } else { "" },
            self.symbol,
            grouped,
            self.decimal_separator,
            fraction
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn brl(amount: &str) -> String {
        MoneyFormat::default().format(Decimal::from_str(amount).unwrap())
    }

    #[test]
    fn test_brazilian_formatting() {
        assert_eq!(brl("1234.5"), "R$ 1.234,50");
        assert_eq!(brl("0"), "R$ 0,00");
        assert_eq!(brl("999"), "R$ 999,00");
        assert_eq!(brl("1000000"), "R$ 1.000.000,00");
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        assert_eq!(brl("10.005"), "R$ 10,01");
        assert_eq!(brl("10.004"), "R$ 10,00");
        assert_eq!(brl("-2.345"), "-R$ 2,35");
    }

    #[test]
    fn test_custom_separators() {
        let usd = MoneyFormat {
            symbol: "US$".to_string(),
            thousands_separator: ',',
            decimal_separator: '.',
        };
        assert_eq!(usd.format(Decimal::from_str("12345.6").unwrap()), "US$ 12,345.60");
    }
}
