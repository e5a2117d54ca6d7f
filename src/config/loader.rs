use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Load configuration from a file using the config crate.
/// The format follows the file extension: YAML (default), JSON, TOML or INI.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<ServerConfig> {
    let config_path = config_path.as_ref();

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
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
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
shutdown_timeout_secs: 5
json_indented: true
logging:
  level: "debug"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.shutdown_timeout_secs, 5);
        assert!(config.json_indented);
        assert!(!config.disable_compression);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_toml_config() {
        let toml_content = r#"
disable_compression = true
min_compress_size = 1024

[logging]
json = false
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert!(config.disable_compression);
        assert_eq!(config.min_compress_size, 1024);
        assert!(!config.logging.json);
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config("/nonexistent/httplog.json").unwrap_err();
        assert!(err.to_string().contains("Failed to build config"));
    }
}
