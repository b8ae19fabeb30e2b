use std::path::Path;

use anyhow::{Context as _, Result};

/// Parse an unsigned integer the way the kernel tools print them: decimal,
/// `0x` prefixed hex or `0` prefixed octal. Trailing garbage after the digits
/// is ignored.
pub fn parse_c_integer(raw: &str) -> Option<u64> {
    let raw = raw.trim_start();
    let (digits, radix) = if let Some(hex) = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
    {
        (hex, 16)
    } else if raw.len() > 1 && raw.starts_with('0') {
        (&raw[1..], 8)
    } else {
        (raw, 10)
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        // the leading "0" of "0x" or "0..." still parses as zero
        return (radix != 10).then_some(0);
    }
    u64::from_str_radix(&digits[..end], radix).ok()
}

/// Read a numeric sysfs attribute.
pub async fn read_u64(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read attribute {path:?}"))?;
    parse_c_integer(&content).with_context(|| {
        format!(
            "Attribute {path:?} is not a number: {:?}",
            content.trim_end()
        )
    })
}

#[cfg(test)]
pub mod tests {

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("512\n", Some(512))]
    #[case("0\n", Some(0))]
    #[case("0x20", Some(32))]
    #[case("010", Some(8))]
    #[case("  3 trailing", Some(3))]
    #[case("", None)]
    #[case("abc", None)]
    #[case("0x", Some(0))]
    #[case("0xg", Some(0))]
    fn test_parse_c_integer(#[case] raw: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_c_integer(raw), expected);
    }

    #[tokio::test]
    async fn test_read_u64() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("size");
        tokio::fs::write(&path, "131072\n").await?;
        assert_eq!(read_u64(&path).await?, 131072);

        assert!(read_u64(dir.path().join("missing")).await.is_err());
        Ok(())
    }
}
