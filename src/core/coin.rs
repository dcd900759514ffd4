// Monetary amounts in satoshis with checked arithmetic

use std::fmt;
use thiserror::Error;

/// Number of decimal places the smallest unit is below one coin
pub const SMALLEST_UNIT_EXPONENT: u32 = 8;

const SATOSHIS_PER_COIN: i64 = 100_000_000;

/// Errors from `Coin` arithmetic and parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoinError {
    /// Arithmetic wrapped around the signed 64-bit range
    #[error("coin amount overflow")]
    Overflow,
    /// A decimal string carried more than 8 fractional digits
    #[error("amount has more precision than one satoshi")]
    TooPrecise,
    /// Not a decimal number
    #[error("invalid amount: {0}")]
    InvalidFormat(String),
}

/// A monetary amount: a signed 64-bit count of satoshis.
///
/// All arithmetic is checked; anything that would wrap reports
/// [`CoinError::Overflow`]. The full i64 range is representable; whether a
/// value is valid network money is decided against the network cap during
/// validation, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Coin {
    /// Amount in satoshis
    pub value: i64,
}

impl Coin {
    pub const ZERO: Coin = Coin { value: 0 };
    pub const SATOSHI: Coin = Coin { value: 1 };
    pub const NEGATIVE_SATOSHI: Coin = Coin { value: -1 };
    pub const MICROCOIN: Coin = Coin { value: 100 };
    pub const MILLICOIN: Coin = Coin { value: 100_000 };
    pub const CENT: Coin = Coin { value: 1_000_000 };
    pub const COIN: Coin = Coin {
        value: SATOSHIS_PER_COIN,
    };
    pub const FIFTY_COINS: Coin = Coin {
        value: 50 * SATOSHIS_PER_COIN,
    };

    /// Wrap a raw satoshi count
    pub const fn from_sat(value: i64) -> Self {
        Self { value }
    }

    /// Build an amount from whole coins and cents, e.g. `(1, 23)` = 1.23 CRW
    pub fn from_coins_and_cents(coins: i64, cents: i64) -> Result<Self, CoinError> {
        if !(0..100).contains(&cents) || coins < 0 {
            return Err(CoinError::InvalidFormat(format!("{coins} coins, {cents} cents")));
        }
        let whole = coins
            .checked_mul(SATOSHIS_PER_COIN)
            .ok_or(CoinError::Overflow)?;
        whole
            .checked_add(cents * Coin::CENT.value)
            .map(Coin::from_sat)
            .ok_or(CoinError::Overflow)
    }

    pub fn checked_add(self, other: Coin) -> Result<Coin, CoinError> {
        self.value
            .checked_add(other.value)
            .map(Coin::from_sat)
            .ok_or(CoinError::Overflow)
    }

    pub fn checked_sub(self, other: Coin) -> Result<Coin, CoinError> {
        self.value
            .checked_sub(other.value)
            .map(Coin::from_sat)
            .ok_or(CoinError::Overflow)
    }

    pub fn checked_mul(self, factor: i64) -> Result<Coin, CoinError> {
        self.value
            .checked_mul(factor)
            .map(Coin::from_sat)
            .ok_or(CoinError::Overflow)
    }

    /// Integer division by a divisor (truncates toward zero)
    pub fn checked_div(self, divisor: i64) -> Result<Coin, CoinError> {
        self.value
            .checked_div(divisor)
            .map(Coin::from_sat)
            .ok_or(CoinError::Overflow)
    }

    pub fn checked_neg(self) -> Result<Coin, CoinError> {
        self.value
            .checked_neg()
            .map(Coin::from_sat)
            .ok_or(CoinError::Overflow)
    }

    pub fn is_positive(&self) -> bool {
        self.value > 0
    }

    pub fn is_negative(&self) -> bool {
        self.value < 0
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn is_greater_than(&self, other: Coin) -> bool {
        self.value > other.value
    }

    pub fn is_less_than(&self, other: Coin) -> bool {
        self.value < other.value
    }

    /// Parse a decimal coin amount, e.g. `"0.01"`, `"1E-2"`, `"-1"`.
    ///
    /// Exact: sub-satoshi precision is rejected with [`CoinError::TooPrecise`].
    pub fn parse(text: &str) -> Result<Coin, CoinError> {
        parse_decimal(text, true)
    }

    /// Parse a decimal coin amount, silently truncating sub-satoshi precision
    /// toward zero.
    pub fn parse_inexact(text: &str) -> Result<Coin, CoinError> {
        parse_decimal(text, false)
    }

    /// Render without trailing fractional zeros: `1.23`, `0.0015`, `7`
    pub fn to_plain_string(&self) -> String {
        let (sign, whole, frac) = self.split();
        let mut s = format!("{sign}{whole}");
        let frac = frac.trim_end_matches('0');
        if !frac.is_empty() {
            s.push('.');
            s.push_str(frac);
        }
        s
    }

    /// Render with the currency code and at least two decimals: `1.00 CRW`
    pub fn to_friendly_string(&self) -> String {
        let (sign, whole, frac) = self.split();
        let mut frac = frac.trim_end_matches('0').to_string();
        while frac.len() < 2 {
            frac.push('0');
        }
        format!("{sign}{whole}.{frac} CRW")
    }

    fn split(&self) -> (&'static str, i128, String) {
        let v = self.value as i128;
        let sign = if v < 0 { "-" } else { "" };
        let abs = v.abs();
        let whole = abs / SATOSHIS_PER_COIN as i128;
        let frac = format!("{:08}", abs % SATOSHIS_PER_COIN as i128);
        (sign, whole, frac)
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

/// Parse `[-]digits[.digits][(e|E)[-]digits]` into satoshis.
fn parse_decimal(text: &str, exact: bool) -> Result<Coin, CoinError> {
    let bad = || CoinError::InvalidFormat(text.to_string());
    let s = text.trim();
    if s.is_empty() {
        return Err(bad());
    }

    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    // Split off an optional exponent
    let (num, exp) = match s.find(['e', 'E']) {
        Some(pos) => {
            let exp: i32 = s[pos + 1..].parse().map_err(|_| bad())?;
            (&s[..pos], exp)
        }
        None => (s, 0),
    };

    // Mantissa digits with the decimal point removed
    let (int_part, frac_part) = match num.find('.') {
        Some(pos) => (&num[..pos], &num[pos + 1..]),
        None => (num, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(bad());
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(bad());
    }

    let mut mantissa: i128 = 0;
    for b in int_part.bytes().chain(frac_part.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add((b - b'0') as i128))
            .ok_or(CoinError::Overflow)?;
    }

    // satoshis = mantissa * 10^(8 - scale), scale = frac digits - exponent
    let scale = frac_part.len() as i32 - exp;
    let shift = SMALLEST_UNIT_EXPONENT as i32 - scale;
    let mut sat = if shift >= 0 {
        if shift > 38 && mantissa != 0 {
            return Err(CoinError::Overflow);
        }
        let factor = 10i128.checked_pow(shift.min(38) as u32).ok_or(CoinError::Overflow)?;
        mantissa.checked_mul(factor).ok_or(CoinError::Overflow)?
    } else {
        let down = -shift;
        if down > 38 {
            // Far below one satoshi
            if exact && mantissa != 0 {
                return Err(CoinError::TooPrecise);
            }
            0
        } else {
            let divisor = 10i128.pow(down as u32);
            if exact && mantissa % divisor != 0 {
                return Err(CoinError::TooPrecise);
            }
            mantissa / divisor
        }
    };
    if negative {
        sat = -sat;
    }

    if sat < i64::MIN as i128 || sat > i64::MAX as i128 {
        return Err(CoinError::Overflow);
    }
    Ok(Coin::from_sat(sat as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Coin::parse("0.01").unwrap(), Coin::CENT);
        assert_eq!(Coin::parse("1E-2").unwrap(), Coin::CENT);
        assert_eq!(
            Coin::parse("1.01").unwrap(),
            Coin::COIN.checked_add(Coin::CENT).unwrap()
        );
        assert_eq!(Coin::parse("-1").unwrap(), Coin::COIN.checked_neg().unwrap());
        assert_eq!(Coin::parse("0.00000001").unwrap().value, 1);
        assert_eq!(Coin::parse("0.000000010").unwrap().value, 1);
    }

    #[test]
    fn test_parse_rejects_fractional_satoshis() {
        assert_eq!(Coin::parse("2E-20"), Err(CoinError::TooPrecise));
        assert_eq!(Coin::parse("0.000000011"), Err(CoinError::TooPrecise));
    }

    #[test]
    fn test_parse_inexact() {
        assert_eq!(Coin::parse_inexact("0.00000001").unwrap().value, 1);
        assert_eq!(Coin::parse_inexact("0.000000011").unwrap().value, 1);
        assert_eq!(Coin::parse_inexact("2E-20").unwrap().value, 0);
    }

    #[test]
    fn test_parse_range_limits() {
        // One satoshi past i64::MAX
        assert_eq!(Coin::parse("92233720368.54775808"), Err(CoinError::Overflow));
        // Exactly i64::MIN
        assert_eq!(
            Coin::parse("-92233720368.54775808").unwrap().value,
            i64::MIN
        );
        assert_eq!(Coin::parse("92233720368.54775807").unwrap().value, i64::MAX);
        assert_eq!(
            Coin::parse("-92233720368.54775809"),
            Err(CoinError::Overflow)
        );
    }

    #[test]
    fn test_from_coins_and_cents() {
        assert_eq!(Coin::from_coins_and_cents(0, 1).unwrap(), Coin::CENT);
        assert_eq!(
            Coin::from_coins_and_cents(1, 23).unwrap().value,
            123_000_000
        );
        assert!(Coin::from_coins_and_cents(1, -1).is_err());
        assert!(Coin::from_coins_and_cents(-1, 0).is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(
            Coin::from_sat(i64::MAX).checked_add(Coin::SATOSHI),
            Err(CoinError::Overflow)
        );
        assert_eq!(
            Coin::from_sat(i64::MIN).checked_sub(Coin::SATOSHI),
            Err(CoinError::Overflow)
        );
        assert_eq!(
            Coin::from_sat(i64::MAX).checked_mul(2),
            Err(CoinError::Overflow)
        );
        assert_eq!(
            Coin::from_sat(i64::MIN).checked_mul(2),
            Err(CoinError::Overflow)
        );
        assert_eq!(Coin::from_sat(i64::MIN).checked_neg(), Err(CoinError::Overflow));
        assert_eq!(
            Coin::from_sat(10).checked_add(Coin::from_sat(5)).unwrap().value,
            15
        );
    }

    #[test]
    fn test_predicates() {
        assert!(Coin::SATOSHI.is_positive());
        assert!(!Coin::SATOSHI.is_negative());
        assert!(!Coin::SATOSHI.is_zero());
        assert!(Coin::NEGATIVE_SATOSHI.is_negative());
        assert!(Coin::ZERO.is_zero());
        assert!(Coin::from_sat(2).is_greater_than(Coin::from_sat(1)));
        assert!(!Coin::from_sat(2).is_greater_than(Coin::from_sat(2)));
        assert!(Coin::from_sat(1).is_less_than(Coin::from_sat(2)));
    }

    #[test]
    fn test_to_friendly_string() {
        assert_eq!(Coin::COIN.to_friendly_string(), "1.00 CRW");
        assert_eq!(
            Coin::from_coins_and_cents(1, 23).unwrap().to_friendly_string(),
            "1.23 CRW"
        );
        assert_eq!(
            Coin::COIN.checked_div(1000).unwrap().to_friendly_string(),
            "0.001 CRW"
        );
        assert_eq!(
            Coin::from_coins_and_cents(1, 23)
                .unwrap()
                .checked_neg()
                .unwrap()
                .to_friendly_string(),
            "-1.23 CRW"
        );
    }

    #[test]
    fn test_to_plain_string() {
        assert_eq!(Coin::from_sat(150_000).to_plain_string(), "0.0015");
        assert_eq!(Coin::parse("1.23").unwrap().to_plain_string(), "1.23");
        assert_eq!(Coin::parse("0.1").unwrap().to_plain_string(), "0.1");
        assert_eq!(
            Coin::parse("87654321.12345678").unwrap().to_plain_string(),
            "87654321.12345678"
        );
        // No trailing zeros
        assert_eq!(Coin::parse("1.0").unwrap().to_plain_string(), "1");
        assert_eq!(Coin::parse("8.00000000").unwrap().to_plain_string(), "8");
    }

    #[test]
    fn test_plain_string_at_range_edges() {
        assert_eq!(
            Coin::from_sat(i64::MIN).to_plain_string(),
            "-92233720368.54775808"
        );
        assert_eq!(
            Coin::from_sat(i64::MAX).to_plain_string(),
            "92233720368.54775807"
        );
    }
}
