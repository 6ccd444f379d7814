use std::env;
use std::sync::OnceLock;

static SEPCONV_CHECK_FINITE: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// When set, flat-stream initialization rejects NaN and infinite weights.
pub(crate) fn check_finite_enabled() -> bool {
    *SEPCONV_CHECK_FINITE.get_or_init(|| match env::var("SEPCONV_CHECK_FINITE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
