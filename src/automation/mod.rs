//! # Browser Automation
//!
//! Headless completion of interactive launch steps. When a test suspends at
//! the `redirect` or `launch` endpoint and the instance names a script for it,
//! the engine hands the script to a [`LaunchAutomation`] instead of waiting
//! for a human.

use std::collections::BTreeMap;

use crate::error::AutomationError;
use crate::instance::InstanceContext;

/// Instance parameter naming the script for the standalone launch redirect.
pub const STANDALONE_LAUNCH_SCRIPT: &str = "standalone_launch_script";

/// Instance parameter naming the script for an EHR launch.
pub const EHR_LAUNCH_SCRIPT: &str = "ehr_launch_script";

pub trait LaunchAutomation {
    /// Drives a browser through `script`, starting at `redirect_url` when the
    /// test supplied one. Returns the parameters the flow ended with (for an
    /// OAuth redirect, its query).
    fn run_script(
        &self,
        script: &str,
        redirect_url: Option<&str>,
    ) -> Result<BTreeMap<String, String>, AutomationError>;
}

/// The instance parameter holding the script for `endpoint`, if that
/// endpoint is automatable.
pub fn script_parameter(endpoint: &str) -> Option<&'static str> {
    match endpoint {
        "redirect" => Some(STANDALONE_LAUNCH_SCRIPT),
        "launch" => Some(EHR_LAUNCH_SCRIPT),
        _ => None,
    }
}

/// The configured, non-blank script for `endpoint`.
pub fn configured_script<'a>(instance: &'a dyn InstanceContext, endpoint: &str) -> Option<&'a str> {
    script_parameter(endpoint)
        .and_then(|name| instance.get(name))
        .filter(|script| !script.trim().is_empty())
}
