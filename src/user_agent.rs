//! User-Agent string for storage HTTP clients.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/export-transfer";

/// Default User-Agent for storage requests (identifies the tool and version).
#[must_use]
pub(crate) fn default_storage_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("export-transfer/{version} (vm-export; +{PROJECT_UA_URL})")
}
