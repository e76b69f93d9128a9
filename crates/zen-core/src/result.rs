use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of a provider call, shared by CLI and HTTP transports.
///
/// `exit_code` is the process exit code for CLI providers and the HTTP
/// status for API providers. A non-zero exit code is not an execution
/// error: the call itself succeeded, the command reported failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(default, with = "duration_ms")]
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 || (200..300).contains(&self.exit_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.exit_code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.exit_code)
    }

    /// `body` when present, otherwise `stdout`.
    pub fn output(&self) -> &str {
        if self.body.is_empty() {
            &self.stdout
        } else {
            &self.body
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
