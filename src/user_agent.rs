//! Shared User-Agent string for fetcher and manifest traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/chapterdl/chapterdl";

/// Default User-Agent for outgoing requests (identifies the tool).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("chapterdl/{version} (+{PROJECT_UA_URL})")
}
