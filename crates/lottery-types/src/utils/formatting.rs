//! String helpers for log output and loosely typed chain values.

/// Shortens an id or hash to its first 8 characters for log lines.
pub fn truncate_id(id: &str) -> String {
	if id.len() <= 8 {
		id.to_string()
	} else {
		format!("{}..", &id[..8])
	}
}

/// Adds a `0x` prefix unless one is already present.
pub fn with_0x_prefix(hex_str: &str) -> String {
	if hex_str.to_lowercase().starts_with("0x") {
		hex_str.to_string()
	} else {
		format!("0x{}", hex_str)
	}
}

/// Strips a leading `0x` or `0X`.
pub fn without_0x_prefix(hex_str: &str) -> &str {
	hex_str
		.strip_prefix("0x")
		.or_else(|| hex_str.strip_prefix("0X"))
		.unwrap_or(hex_str)
}

/// True for a `0x`-prefixed, 42 character hex string.
///
/// Event arguments arrive from heterogeneous contract ABIs, so the buyer of a
/// purchase is located by shape rather than by position.
pub fn is_address_like(value: &str) -> bool {
	value.len() == 42
		&& value.starts_with("0x")
		&& value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_truncate_id() {
		assert_eq!(truncate_id("abc"), "abc");
		assert_eq!(truncate_id("12345678"), "12345678");
		assert_eq!(truncate_id("0x5FbDB2315678afecb367"), "0x5FbDB2..");
	}

	#[test]
	fn test_prefix_helpers() {
		assert_eq!(with_0x_prefix("dead"), "0xdead");
		assert_eq!(with_0x_prefix("0Xdead"), "0Xdead");
		assert_eq!(without_0x_prefix("0xdead"), "dead");
		assert_eq!(without_0x_prefix("beef"), "beef");
	}

	#[test]
	fn test_is_address_like() {
		assert!(is_address_like("0x5FbDB2315678afecb367f032d93F642f64180aa3"));
		assert!(!is_address_like("5FbDB2315678afecb367f032d93F642f64180aa3"));
		assert!(!is_address_like("0x5FbDB2315678afecb367f032d93F642f64180aa"));
		assert!(!is_address_like("0xZZbDB2315678afecb367f032d93F642f64180aa3"));
	}
}
