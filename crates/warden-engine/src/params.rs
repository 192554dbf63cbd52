//! Script parameter substitution applied when `enableParameter` is set.
//!
//! Builtin environment markers look like `{{ACS::InstanceId}}` and are
//! resolved from the arguments seeded at fetch time. Plain `{{name}}`
//! markers are custom parameters the control plane substitutes before
//! delivery and pass through untouched here.

use std::collections::HashMap;

/// Scripts whose resolved text contains this sentinel held interpolated
/// secrets; their script file is deleted after the run.
pub const SECRET_SENTINEL: &str = "oos-secret";

const MARKER_OPEN: &str = "{{";
const MARKER_CLOSE: &str = "}}";
const BUILTIN_NAMESPACE: &str = "ACS::";

/// Replace builtin environment markers. An unknown builtin name is a
/// validation error carrying the offending marker.
pub fn resolve_environment_parameters(
    content: &str,
    args: &HashMap<String, String>,
) -> Result<String, String> {
    let mut resolved = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(open) = rest.find(MARKER_OPEN) {
        let Some(close) = rest[open..].find(MARKER_CLOSE) else {
            break;
        };
        let close = open + close;
        let marker = &rest[open + MARKER_OPEN.len()..close];
        let name = marker.trim();

        resolved.push_str(&rest[..open]);
        if let Some(builtin) = name.strip_prefix(BUILTIN_NAMESPACE) {
            match args.get(builtin.trim()) {
                Some(value) => resolved.push_str(value),
                None => return Err(format!("{MARKER_OPEN}{name}{MARKER_CLOSE}")),
            }
        } else {
            // Custom parameter, already substituted upstream.
            resolved.push_str(&rest[open..close + MARKER_CLOSE.len()]);
        }
        rest = &rest[close + MARKER_CLOSE.len()..];
    }
    resolved.push_str(rest);

    Ok(resolved)
}

/// Secret-store text substitution. The real resolver lives outside the
/// execution core; the engine only requires a pure function.
pub trait ParameterStore: Send + Sync {
    fn replace(&self, content: &str) -> anyhow::Result<String>;
}

/// Default store: no substitution.
pub struct IdentityParameterStore;

impl ParameterStore for IdentityParameterStore {
    fn replace(&self, content: &str) -> anyhow::Result<String> {
        Ok(content.to_string())
    }
}
