//! Per-slot payload templating and the environment-driven event payload.

use crate::config::required_var;
use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::fs;

/// Replaced with the slot's invocation number in a launch payload.
pub const ID_PLACEHOLDER: &str = "##ID##";

/// Substitutes the first [`ID_PLACEHOLDER`] in `template` with
/// `region_index * launches + launch_index`. Templates without the
/// placeholder come back unchanged.
pub fn render(template: &str, region_index: usize, launches: usize, launch_index: usize) -> String {
    let id = region_index * launches + launch_index;
    template.replacen(ID_PLACEHOLDER, &id.to_string(), 1)
}

const EVENT_PREFIX: &str = "EVENT_";

/// Builds the worker event payload from `EVENT_*` variables.
///
/// `addr` and `port` are required. `cacert`, `srvcrt` and `srvkey` name PEM
/// files whose base64 body is embedded; unreadable files are skipped.
/// `mode` defaults to `"1"`.
pub fn event_payload<F>(lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(&format!("{EVENT_PREFIX}{key}")).filter(|v| !v.is_empty());
    let mut event = Map::new();

    for key in ["addr", "port"] {
        let value = required_var(&lookup, &format!("{EVENT_PREFIX}{key}"))?;
        event.insert(key.into(), Value::String(value));
    }

    for key in ["cacert", "srvcrt", "srvkey"] {
        let Some(path) = var(key) else { continue };
        match fs::read_to_string(&path) {
            Ok(pem) => {
                event.insert(key.into(), Value::String(pem_body(&pem)));
            }
            Err(e) => tracing::warn!(key, path, error = %e, "skipping unreadable certificate file"),
        }
    }

    event.insert("mode".into(), Value::String(var("mode").unwrap_or_else(|| "1".into())));

    for key in ["bucket", "nonblock", "expect_statefile", "rm_tmpdir"] {
        if let Some(value) = var(key) {
            event.insert(key.into(), Value::String(value));
        }
    }

    Ok(Value::Object(event).to_string())
}

/// Concatenated lines between the first `-----BEGIN ` marker and the next
/// `-----END ` marker or blank line.
fn pem_body(pem: &str) -> String {
    pem.lines()
        .skip_while(|line| !line.starts_with("-----BEGIN "))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END ") && !line.trim().is_empty())
        .map(str::trim)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
        move |name| vars.get(name).cloned()
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_is_unique_per_slot() {
        let template = r###"{"id":"##ID##"}"###;
        let launches = 3;
        let mut seen = Vec::new();
        for region in 0..2 {
            for launch in 0..launches {
                seen.push(render(template, region, launches, launch));
            }
        }
        assert_eq!(seen[0], r#"{"id":"0"}"#);
        assert_eq!(seen[4], r#"{"id":"4"}"#);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), seen.len());
    }

    #[test]
    fn render_without_placeholder_is_identity() {
        assert_eq!(render(r#"{"a":1}"#, 1, 5, 2), r#"{"a":1}"#);
    }

    #[test]
    fn render_replaces_first_occurrence_only() {
        assert_eq!(render("##ID##-##ID##", 0, 1, 0), "0-##ID##");
    }

    #[test]
    fn event_payload_requires_addr_and_port() {
        let err = event_payload(lookup(vars(&[("EVENT_addr", "10.0.0.1")]))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(ref name) if name == "EVENT_port"));
    }

    #[test]
    fn event_payload_fields() {
        let mut pem = tempfile::NamedTempFile::new().unwrap();
        write!(
            pem,
            "junk\n-----BEGIN CERTIFICATE-----\nAAAA\nBBBB\n-----END CERTIFICATE-----\n"
        )
        .unwrap();
        let path = pem.path().to_str().unwrap().to_string();

        let payload = event_payload(lookup(vars(&[
            ("EVENT_addr", "10.0.0.1"),
            ("EVENT_port", "13579"),
            ("EVENT_cacert", &path),
            ("EVENT_srvkey", "/nonexistent/key.pem"),
            ("EVENT_bucket", "frames"),
        ])))
        .unwrap();

        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["addr"], "10.0.0.1");
        assert_eq!(value["port"], "13579");
        assert_eq!(value["cacert"], "AAAABBBB");
        assert_eq!(value["mode"], "1");
        assert_eq!(value["bucket"], "frames");
        assert!(value.get("srvkey").is_none());
        assert!(value.get("nonblock").is_none());
    }
}
