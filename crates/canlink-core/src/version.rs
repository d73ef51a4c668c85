//! Firmware version comparison

use std::cmp::Ordering;

use crate::error::{AdapterError, AdapterResult};

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split(['.', '-'])
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compare dotted numeric versions; missing components count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (components(a), components(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Fail with `Handshake` when `reported` is below `minimum`
pub fn check_firmware(reported: &str, minimum: Option<&str>) -> AdapterResult<()> {
    let Some(minimum) = minimum.filter(|m| !m.trim().is_empty()) else {
        return Ok(());
    };
    if compare_versions(reported, minimum) == Ordering::Less {
        return Err(AdapterError::Handshake(format!(
            "firmware {} is older than required {}",
            reported, minimum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2.10", "1.2.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.3-beta", "1.0.4"), Ordering::Less);
    }

    #[test]
    fn test_check_firmware() {
        assert!(check_firmware("1.0.0", None).is_ok());
        assert!(check_firmware("1.0.0", Some("")).is_ok());
        assert!(check_firmware("1.4.0", Some("1.3.9")).is_ok());
        assert!(matches!(
            check_firmware("1.3.0", Some("1.3.9")),
            Err(AdapterError::Handshake(_))
        ));
    }
}
