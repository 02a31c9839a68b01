//! Checksummed payment reference numbers.
//!
//! A reference number ties an incoming bank payment to a billing cycle
//! without a foreign key at payment-creation time. The domestic format is
//! the Finnish creditor reference: the digits of the member id and the
//! cycle year followed by a single weighted check digit. The international
//! rendering prefixes the same digits with `RF` and a mod-97 checksum.

use crate::error::{AppError, AppResult};

const CHECK_WEIGHTS: [u32; 3] = [7, 3, 1];

/// Builds the reference number for one membership's cycle year. The base is
/// the member id concatenated with the four-digit year, so consecutive
/// years of the same membership never collide.
pub fn generate(membership_id: i32, year: i32) -> String {
    let base = format!("{membership_id}{year}");
    let check = check_digit(&base);
    format!("{base}{check}")
}

/// Strips whitespace and rejects anything that is not purely digits.
pub fn normalize(raw: &str) -> AppResult<String> {
    let digits: String = raw.split_whitespace().collect();
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(AppError::InvalidReferenceFormat(raw.to_string()));
    }
    Ok(digits)
}

/// Recomputes the trailing check digit and compares. Run before attaching a
/// payment whose free-text reference matched a cycle.
pub fn validate(raw: &str) -> AppResult<bool> {
    let digits = normalize(raw)?;
    if digits.len() < 2 {
        return Ok(false);
    }
    let (base, check) = digits.split_at(digits.len() - 1);
    Ok(check_digit(base).to_string() == check)
}

/// Renders a domestic reference in the international RF format, e.g.
/// `218012` becomes `RF28218012`. The digits `271500` are "RF" in numeric
/// encoding plus two placeholder check digits for the mod-97 step.
pub fn to_international(raw: &str) -> AppResult<String> {
    let digits = normalize(raw)?;
    let value: u128 = format!("{digits}271500")
        .parse()
        .map_err(|_| AppError::InvalidReferenceFormat(raw.to_string()))?;
    let checksum = 98 - (value % 97);
    Ok(format!("RF{checksum:02}{digits}"))
}

/// Groups digits in blocks of five from the right for printed documents,
/// e.g. `1234567` becomes `12 34567`.
pub fn group_right(raw: &str) -> String {
    let digits: Vec<u8> = raw
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    let mut grouped = Vec::new();
    for (index, byte) in digits.iter().rev().enumerate() {
        if index > 0 && index % 5 == 0 {
            grouped.push(b' ');
        }
        grouped.push(*byte);
    }
    grouped.reverse();
    String::from_utf8(grouped).unwrap_or_else(|_| raw.to_string())
}

fn check_digit(base: &str) -> u32 {
    let sum: u32 = base
        .bytes()
        .rev()
        .zip(CHECK_WEIGHTS.iter().cycle())
        .map(|(byte, weight)| (byte - b'0') as u32 * weight)
        .sum();
    (10 - sum % 10) % 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_references_validate() {
        for membership_id in [1, 42, 218, 99999] {
            for year in [2012, 2016, 2024] {
                let reference = generate(membership_id, year);
                assert!(validate(&reference).unwrap(), "reference {reference}");
            }
        }
    }

    #[test]
    fn mutating_any_digit_breaks_validation() {
        let reference = generate(218, 2012);
        for position in 0..reference.len() {
            let mut bytes = reference.clone().into_bytes();
            bytes[position] = if bytes[position] == b'9' {
                b'0'
            } else {
                bytes[position] + 1
            };
            let mutated = String::from_utf8(bytes).unwrap();
            assert!(!validate(&mutated).unwrap(), "mutation at {position}");
        }
    }

    #[test]
    fn known_domestic_reference_is_valid() {
        // 218012 carries check digit 2 over base 21801.
        assert!(validate("218012").unwrap());
        assert!(validate("21 8012").unwrap());
        assert!(!validate("218013").unwrap());
    }

    #[test]
    fn rf_conversion_matches_literal_case() {
        assert_eq!(to_international("218012").unwrap(), "RF28218012");
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            validate("2180a2"),
            Err(AppError::InvalidReferenceFormat(_))
        ));
        assert!(matches!(
            to_international(""),
            Err(AppError::InvalidReferenceFormat(_))
        ));
        assert!(matches!(
            normalize("  "),
            Err(AppError::InvalidReferenceFormat(_))
        ));
    }

    #[test]
    fn grouping_splits_from_the_right() {
        assert_eq!(group_right("1234567"), "12 34567");
        assert_eq!(group_right("12345"), "12345");
        assert_eq!(group_right("218012"), "2 18012");
    }
}
