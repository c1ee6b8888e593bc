// ABOUTME: Numeric token scanner using nom combinators

use crate::value::Value;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, hex_digit1, one_of};
use nom::combinator::{all_consuming, opt, recognize};
use nom::IResult;
use nom::Parser;

/// Scan a finished token as a numeric literal.
///
/// Accepts decimal integers, `0x` hex integers, and reals with an optional
/// fraction and exponent; a sign is allowed in front of any of them.
/// Integers that do not fit 32 bits fall back to reals. Returns `None` when
/// the token is not a number at all (the caller then treats it as a symbol
/// or reports an error for digit-leading tokens).
pub fn scan_number(token: &[u8]) -> Option<Value> {
    let s = std::str::from_utf8(token).ok()?;

    if let Ok((_, (sign, digits))) = all_consuming(hex_form).parse(s) {
        return Some(hex_value(sign, digits));
    }

    if all_consuming(integer_form).parse(s).is_ok() {
        return match s.parse::<i32>() {
            Ok(i) => Some(Value::Integer(i)),
            // Out of 32-bit range; keep the magnitude as a real
            Err(_) => s.parse::<f64>().ok().map(Value::Real),
        };
    }

    if all_consuming(real_form).parse(s).is_ok() {
        return s.parse::<f64>().ok().map(Value::Real);
    }

    None
}

fn sign(input: &str) -> IResult<&str, Option<char>> {
    opt(one_of("+-")).parse(input)
}

fn hex_form(input: &str) -> IResult<&str, (Option<char>, &str)> {
    let (input, s) = sign(input)?;
    let (input, _) = tag("0x")(input)?;
    let (input, digits) = hex_digit1(input)?;
    Ok((input, (s, digits)))
}

fn integer_form(input: &str) -> IResult<&str, &str> {
    recognize((sign, digit1)).parse(input)
}

/// Reals: `12.`, `12.5`, `.5`, with an optional exponent on any of them,
/// or a bare exponent form like `1e9`.
fn real_form(input: &str) -> IResult<&str, &str> {
    recognize((
        sign,
        alt((
            recognize((digit1, opt((char('.'), opt(digit1))))),
            recognize((char('.'), digit1)),
        )),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)
}

fn hex_value(sign: Option<char>, digits: &str) -> Value {
    let negative = sign == Some('-');
    let mut exact: Option<i64> = Some(0);
    let mut approx = 0.0f64;
    for d in digits.bytes() {
        let v = match d {
            b'0'..=b'9' => d - b'0',
            b'a'..=b'f' => 10 + d - b'a',
            _ => 10 + d - b'A',
        } as i64;
        exact = exact.and_then(|m| m.checked_mul(16)).and_then(|m| m.checked_add(v));
        approx = approx * 16.0 + v as f64;
    }
    if let Some(mag) = exact {
        let signed = if negative { -mag } else { mag };
        if let Ok(i) = i32::try_from(signed) {
            return Value::Integer(i);
        }
    }
    Value::Real(if negative { -approx } else { approx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(s: &str) -> Option<Value> {
        scan_number(s.as_bytes())
    }

    #[test]
    fn test_scan_integers() {
        assert!(scan("42").unwrap().equals(&Value::Integer(42)));
        assert!(scan("-42").unwrap().equals(&Value::Integer(-42)));
        assert!(scan("+7").unwrap().equals(&Value::Integer(7)));
        assert!(scan("0").unwrap().equals(&Value::Integer(0)));
        assert!(scan("2147483647").unwrap().equals(&Value::Integer(i32::MAX)));
        assert!(scan("-2147483648").unwrap().equals(&Value::Integer(i32::MIN)));
    }

    #[test]
    fn test_scan_integer_overflow_becomes_real() {
        assert!(scan("2147483648").unwrap().equals(&Value::Real(2147483648.0)));
        assert!(scan("-9999999999").unwrap().equals(&Value::Real(-9999999999.0)));
    }

    #[test]
    fn test_scan_hex() {
        assert!(scan("0xFF").unwrap().equals(&Value::Integer(255)));
        assert!(scan("0x10").unwrap().equals(&Value::Integer(16)));
        assert!(scan("-0x10").unwrap().equals(&Value::Integer(-16)));
        assert!(scan("0xdeadbeef").unwrap().equals(&Value::Real(3735928559.0)));
    }

    #[test]
    fn test_scan_reals() {
        assert!(scan("2.5").unwrap().equals(&Value::Real(2.5)));
        assert!(scan("-2.5").unwrap().equals(&Value::Real(-2.5)));
        assert!(scan(".5").unwrap().equals(&Value::Real(0.5)));
        assert!(scan("-.5").unwrap().equals(&Value::Real(-0.5)));
        assert!(scan("42.").unwrap().equals(&Value::Real(42.0)));
        assert!(scan("1e3").unwrap().equals(&Value::Real(1000.0)));
        assert!(scan("1.5e-2").unwrap().equals(&Value::Real(0.015)));
    }

    #[test]
    fn test_scan_rejects_non_numbers() {
        assert!(scan("foo").is_none());
        assert!(scan("-").is_none());
        assert!(scan("+").is_none());
        assert!(scan(".").is_none());
        assert!(scan("12abc").is_none());
        assert!(scan("1.2.3").is_none());
        assert!(scan("0x").is_none());
        assert!(scan("").is_none());
    }
}
