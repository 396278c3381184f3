use std::env;
use std::sync::OnceLock;

static EINLOOM_HOIST: OnceLock<bool> = OnceLock::new();
static EINLOOM_TRACE: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn hoist_enabled() -> bool {
    *EINLOOM_HOIST.get_or_init(|| match env::var("EINLOOM_HOIST") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => true,
    })
}

pub(crate) fn trace_enabled() -> bool {
    *EINLOOM_TRACE.get_or_init(|| match env::var("EINLOOM_TRACE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => true,
    })
}
