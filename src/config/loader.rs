use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{
    models::ServerConfig,
    validation::{ServerConfigValidator, ValidationError},
};

/// Load and validate configuration from a file using the config crate.
/// Supports TOML (default), YAML and JSON, chosen by extension.
pub async fn load_config(config_path: impl AsRef<Path>) -> Result<ServerConfig> {
    let config_path = config_path.as_ref().to_path_buf();
    // Resolving `bind` may block on DNS, so validation runs off the executor too
    tokio::task::spawn_blocking(move || -> Result<ServerConfig> {
        let config = load_config_unchecked(&config_path)?;
        ServerConfigValidator::validate(&config)?;
        Ok(config)
    })
    .await
    .wrap_err("Config loading task failed")?
}

/// Load configuration without validation (used by the validate command)
pub fn load_config_unchecked(config_path: &Path) -> Result<ServerConfig> {
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    // The balancer has no implicit default in a file
    if settings.get_string("loadbalancing.type").is_err() {
        return Err(ValidationError::MissingField {
            field: "loadbalancing.type".to_string(),
        })
        .with_context(|| format!("Invalid config in {}", config_path.display()));
    }

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::LoadBalancerType;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
bind = "127.0.0.1:8080"
add-x-forwarded-for = true
watch-config = false
inventory-file = "inventory.toml"

[loadbalancing]
type = "leastconn"

[backend]
dial-timeout = "2s"
latency-average-seconds = 30
health-check-timeout = "250ms"
new-host-port = 8080
new-host-health-path = "/index.html"

[provisioning]
enable = false
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path()).await.unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert!(!config.watch_config);
        assert_eq!(config.loadbalancing.kind, LoadBalancerType::LeastConn);
        assert_eq!(config.backend.dial_timeout, Duration::from_secs(2));
        assert_eq!(
            config.backend.health_check_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.backend.new_host_port, 8080);
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
bind: "127.0.0.1:3000"
inventory-file: "droplets.toml"
loadbalancing:
  type: "roundrobin"
backend:
  health-check-timeout: "500ms"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path()).await.unwrap();
        assert_eq!(config.bind, "127.0.0.1:3000");
        assert_eq!(config.loadbalancing.kind, LoadBalancerType::RoundRobin);
        assert_eq!(
            config.backend.health_check_timeout,
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let toml_content = r#"
bind = "127.0.0.1:8080"

[loadbalancing]
type = "roundrobin"

[backend]
health-check-timeout = "2s"
"#;
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        assert!(load_config(temp_file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_requires_balancer_type() {
        for toml_content in ["bind = \"127.0.0.1:8080\"\n", "[loadbalancing]\n"] {
            let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
            write!(temp_file, "{}", toml_content).unwrap();

            let err = load_config(temp_file.path()).await.unwrap_err();
            assert!(format!("{err:#}").contains("loadbalancing.type"), "{err:#}");
        }
    }

    #[tokio::test]
    async fn test_load_reports_invalid_bind() {
        let toml_content = r#"
bind = "127.0.0.1:notaport"

[loadbalancing]
type = "roundrobin"
"#;
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let err = load_config(temp_file.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("127.0.0.1:notaport"), "{err:#}");
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_balancer() {
        let toml_content = r#"
[loadbalancing]
type = "fastest"
"#;
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        assert!(load_config(temp_file.path()).await.is_err());
    }
}
