//! Launch settings and the environment-backed credential loader.

use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub const ACCESS_KEY_ID_VAR: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
pub const FUNCTION_NAME_VAR: &str = "LAMBDA_FUNCTION";

/// Looks up `name`, treating an unset or empty variable as missing.
pub fn required_var<F>(lookup: &F, name: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(name.to_string())),
    }
}

/// Reads a variable from the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Name of the function to invoke, from `LAMBDA_FUNCTION`.
pub fn function_name_from_env() -> Result<String, ConfigError> {
    required_var(&process_env, FUNCTION_NAME_VAR)
}

/// Signing credentials. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Credentials {
            access_key_id: access_key_id.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Credentials {
            access_key_id: required_var(&lookup, ACCESS_KEY_ID_VAR)?,
            secret_key: required_var(&lookup, SECRET_ACCESS_KEY_VAR)?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.access_key_id.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("access_key_id", &format_args!("{visible}****"))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// What to do with the responses of a fan-out.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePolicy {
    /// Record outcomes, never fail the launch because of them.
    #[default]
    Ignore,
    /// Any unsuccessful response fails the launch.
    Strict,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tls,
    /// Plain TCP. Only useful against local endpoints.
    Tcp,
}

fn default_service() -> String {
    "lambda".into()
}

fn default_domain() -> String {
    "amazonaws.com".into()
}

fn default_port() -> u16 {
    443
}

fn default_max_launches() -> usize {
    10_000
}

fn default_regions() -> Vec<String> {
    vec!["us-east-1".into()]
}

/// Where and how a launch connects.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LaunchSettings {
    #[serde(default = "default_service")]
    pub service: String,
    /// Provider domain appended to `<service>.<region>.`.
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    /// Connect here instead of resolving the endpoint host. The host header
    /// and TLS server name are unchanged.
    #[serde(default)]
    pub connect_to: Option<SocketAddr>,
    /// Per-connection bound. Unset means connects run until the OS gives up.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub response_policy: ResponsePolicy,
    /// Upper bound on launches per region in a single fan-out.
    #[serde(default = "default_max_launches")]
    pub max_launches: usize,
    /// Regions used when a launch does not name any.
    #[serde(default = "default_regions")]
    pub default_regions: Vec<String>,
}

impl LaunchSettings {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        LaunchSettings {
            service: default_service(),
            domain: default_domain(),
            port: default_port(),
            transport: TransportKind::default(),
            connect_to: None,
            connect_timeout_ms: None,
            response_policy: ResponsePolicy::default(),
            max_launches: default_max_launches(),
            default_regions: default_regions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn credentials_from_lookup() {
        let creds = Credentials::from_lookup(lookup(&[
            (ACCESS_KEY_ID_VAR, "AKIDEXAMPLE"),
            (SECRET_ACCESS_KEY_VAR, "secret"),
        ]))
        .unwrap();
        assert_eq!(creds, Credentials::new("AKIDEXAMPLE", "secret"));
    }

    #[test]
    fn missing_secret_fails_fast() {
        let err = Credentials::from_lookup(lookup(&[(ACCESS_KEY_ID_VAR, "AKIDEXAMPLE")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingEnv(ref name) if name == SECRET_ACCESS_KEY_VAR)
        );

        let err = Credentials::from_lookup(lookup(&[
            (ACCESS_KEY_ID_VAR, ""),
            (SECRET_ACCESS_KEY_VAR, "secret"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(ref name) if name == ACCESS_KEY_ID_VAR));
    }

    #[test]
    fn debug_redacts_secret() {
        let creds = Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI");
        let printed = format!("{creds:?}");
        assert!(!printed.contains("wJalrXUtnFEMI"));
        assert!(!printed.contains("AKIDEXAMPLE"));
        assert!(printed.contains("AKID****"));
    }

    #[test]
    fn settings_defaults_apply() {
        let settings: LaunchSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings, LaunchSettings::default());
        assert_eq!(settings.port, 443);
        assert_eq!(settings.transport, TransportKind::Tls);
        assert_eq!(settings.response_policy, ResponsePolicy::Ignore);
        assert_eq!(settings.default_regions, vec!["us-east-1".to_string()]);
        assert!(settings.connect_timeout().is_none());
        assert_eq!(settings.max_launches, 10_000);
    }

    #[test]
    fn settings_parse_overrides() {
        let yaml = r#"
domain: example.test
port: 8443
transport: tcp
connect_to: "127.0.0.1:9000"
connect_timeout_ms: 250
response_policy: strict
max_launches: 500
default_regions: [us-west-2, eu-west-1]
"#;
        let settings: LaunchSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.domain, "example.test");
        assert_eq!(settings.transport, TransportKind::Tcp);
        assert_eq!(settings.connect_to, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(settings.connect_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(settings.response_policy, ResponsePolicy::Strict);
        assert_eq!(settings.max_launches, 500);
        assert_eq!(settings.default_regions.len(), 2);
    }
}
