//! Like `#[serde(with = "::hex")]` for JSON-RPC quantities: `u64` values
//! encoded as `0x`-prefixed hex strings without leading zeros.
//!
//! Plain JSON numbers are accepted when decoding, some nodes emit them for
//! fields such as `blockNumber` in receipts.

use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex(*value))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Num(u64),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => parse(&s).map_err(D::Error::custom),
    }
}

/// Formats a block number the way JSON-RPC expects it in params.
pub fn to_hex(value: u64) -> String {
    format!("{value:#x}")
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| format!("quantity '{s}' is missing the 0x prefix"))?;
    if digits.is_empty() {
        return Err(format!("quantity '{s}' has no digits"));
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_formats_without_leading_zeros() {
        assert_eq!(to_hex(0), "0x0");
        assert_eq!(to_hex(255), "0xff");
        assert_eq!(to_hex(1_000_000), "0xf4240");
    }

    #[test]
    fn it_parses_prefixed_hex() {
        assert_eq!(parse("0xff"), Ok(255));
        assert_eq!(parse("0x0"), Ok(0));
    }

    #[test]
    fn it_rejects_bad_quantities() {
        assert!(parse("ff").is_err());
        assert!(parse("0x").is_err());
        assert!(parse("0xzz").is_err());
    }

    #[test]
    fn it_accepts_plain_numbers() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "crate::quantity")]
            n: u64,
        }
        let w: Wrapper = serde_json::from_str(r#"{"n": 12}"#).unwrap();
        assert_eq!(w.n, 12);
        let w: Wrapper = serde_json::from_str(r#"{"n": "0xc"}"#).unwrap();
        assert_eq!(w.n, 12);
    }
}
