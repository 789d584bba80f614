use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;

/// A provisioned backend server as recorded in the inventory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Droplet {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    /// `host:port` requests are forwarded to
    pub server_host: String,
    /// Empty when the droplet should always be considered healthy
    #[serde(default)]
    pub health_url: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "started_time"
    )]
    pub started_time: Option<DateTime<Utc>>,
}

impl Droplet {
    /// Build the descriptor for a freshly provisioned instance, deriving the
    /// forwarding host and health URL from the `[backend]` settings.
    pub fn from_provisioned(
        id: i64,
        name: impl Into<String>,
        private_ip: impl Into<String>,
        public_ip: Option<String>,
        started_time: DateTime<Utc>,
        config: &BackendConfig,
    ) -> Self {
        let private_ip = private_ip.into();
        let server_host = format!("{private_ip}:{}", config.new_host_port);
        let scheme = if config.new_host_health_https {
            "https"
        } else {
            "http"
        };
        let health_url = format!("{scheme}://{server_host}{}", config.new_host_health_path);
        Self {
            id,
            name: name.into(),
            private_ip,
            public_ip,
            server_host,
            health_url,
            started_time: Some(started_time),
        }
    }
}

/// Inventory files store `started-time` as a native TOML datetime; plain RFC 3339
/// strings are accepted too.
mod started_time {
    use std::str::FromStr;

    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};
    use toml::{Value, value::Datetime};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => {
                let text = time.to_rfc3339_opts(SecondsFormat::AutoSi, true);
                Datetime::from_str(&text)
                    .map_err(serde::ser::Error::custom)?
                    .serialize(serializer)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let text = match Value::deserialize(deserializer)? {
            Value::Datetime(datetime) => datetime.to_string(),
            Value::String(text) => text,
            other => {
                return Err(D::Error::custom(format!(
                    "expected a datetime for started-time, found {}",
                    other.type_str()
                )));
            }
        };
        DateTime::parse_from_rfc3339(&text)
            .map(|time| Some(time.with_timezone(&Utc)))
            .map_err(|e| D::Error::custom(format!("invalid started-time '{text}': {e}")))
    }
}
