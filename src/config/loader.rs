use super::schema::{Config, ConnectorConfig, MAX_CHUNK_SIZE};
use crate::error::{ConfigError, Result};
use crate::invocation::SEGMENT_DELIMITER;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "QREXEC_PROXY_";
const DEFAULT_CONFIG_DIR: &str = "/etc/qrexec-proxy";

pub fn load_default() -> Result<Config> {
    let dir = Path::new(DEFAULT_CONFIG_DIR);
    let config: Config = Figment::new()
        .merge(Toml::file(dir.join("config.toml")))
        .merge(Json::file(dir.join("config.json")))
        .merge(Yaml::file(dir.join("config.yaml")))
        .merge(Yaml::file(dir.join("config.yml")))
        // Override with environment variables (QREXEC_PROXY_ prefix, `__` nests)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    if !path.is_file() {
        return Err(ConfigError::Parse(format!(
            "Configuration file {} does not exist",
            path.display()
        ))
        .into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, chain) in &config.chains {
        if name.is_empty() {
            return Err(ConfigError::Validation("Chain names must not be empty".into()).into());
        }
        if name.contains(SEGMENT_DELIMITER) {
            return Err(ConfigError::Validation(format!(
                "Chain '{name}' must not contain '{SEGMENT_DELIMITER}'"
            ))
            .into());
        }
        for plugin in &chain.plugins {
            if plugin.kind.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Chain '{name}' has a plugin without a type"
                ))
                .into());
            }
        }
    }

    if config.relay.chunk_size == 0 || config.relay.chunk_size > MAX_CHUNK_SIZE {
        return Err(ConfigError::Validation(format!(
            "relay.chunkSize must be between 1 and {MAX_CHUNK_SIZE}"
        ))
        .into());
    }

    match &config.connector {
        ConnectorConfig::Qrexec { program } | ConnectorConfig::Command { program, .. } => {
            if program.as_os_str().is_empty() {
                return Err(
                    ConfigError::Validation("connector.program must not be empty".into()).into(),
                );
            }
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for chain in config.chains.values_mut() {
        for plugin in &mut chain.plugins {
            for value in plugin.params.values_mut() {
                substitute_in_value(value)?;
            }
        }
    }

    if let ConnectorConfig::Command { args, .. } = &mut config.connector {
        for arg in args {
            *arg = substitute_env_vars(arg)?;
        }
    }

    Ok(config)
}

fn substitute_in_value(value: &mut serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::String(s) => *s = substitute_env_vars(s)?,
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_in_value(item)?;
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                substitute_in_value(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{var_name}' not found"
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{LogFormat, LogOutput};
    use crate::error::ProxyError;
    use std::io::Write;
    use tempfile::Builder;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("QREXEC_PROXY_TEST_VAR", "test_value");

        let result = substitute_env_vars("Hello ${QREXEC_PROXY_TEST_VAR}!").unwrap();
        assert_eq!(result, "Hello test_value!");

        let result = substitute_env_vars("${QREXEC_PROXY_MISSING:-default}").unwrap();
        assert_eq!(result, "default");

        assert!(substitute_env_vars("${QREXEC_PROXY_MISSING}").is_err());

        std::env::remove_var("QREXEC_PROXY_TEST_VAR");
    }

    #[test]
    fn test_load_yaml() {
        let file = write_config(
            ".yaml",
            r#"
connector:
  type: command
  program: sh
  args: ["-c", "exec cat"]
relay:
  chunkSize: 4096
logging:
  format: json
  output: stderr
chains:
  timeout:
    plugins:
      - type: timeout
        params:
          seconds: 1
      - type: sniff
        enabled: false
"#,
        );

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.relay.chunk_size, 4096);
        assert_eq!(config.relay.close_grace_ms, 2000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.output, LogOutput::Stderr);
        assert!(matches!(config.connector, ConnectorConfig::Command { .. }));

        let chain = &config.chains["timeout"];
        assert_eq!(chain.plugins.len(), 2);
        assert_eq!(chain.plugins[0].kind, "timeout");
        assert_eq!(chain.plugins[0].params["seconds"], 1);
        assert!(!chain.plugins[1].enabled);
    }

    #[test]
    fn test_load_toml_preserves_plugin_order() {
        let file = write_config(
            ".toml",
            r#"
[[chains.audit.plugins]]
type = "sniff"

[[chains.audit.plugins]]
type = "byte_limit"
params = { outboundLimit = 10, inboundLimit = -1 }

[[chains.audit.plugins]]
type = "pass"
"#,
        );

        let config = load_from_path(file.path()).unwrap();
        let kinds: Vec<_> = config.chains["audit"]
            .plugins
            .iter()
            .map(|p| p.kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["sniff", "byte_limit", "pass"]);
        assert!(matches!(config.connector, ConnectorConfig::Qrexec { .. }));
    }

    #[test]
    fn test_param_substitution() {
        std::env::set_var("QREXEC_PROXY_TEST_STATE", "/run/count");
        let file = write_config(
            ".json",
            r#"{"chains": {"limited": {"plugins": [
                {"type": "count", "params": {"limit": 3, "intervalSeconds": 60,
                 "stateDir": "${QREXEC_PROXY_TEST_STATE}"}}
            ]}}}"#,
        );

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(
            config.chains["limited"].plugins[0].params["stateDir"],
            "/run/count"
        );
        std::env::remove_var("QREXEC_PROXY_TEST_STATE");
    }

    #[test]
    fn test_rejects_invalid_chain_name() {
        let config = Config::default().with_chain("a+b", vec![]);
        assert!(matches!(
            validate(&config),
            Err(ProxyError::Config(ConfigError::Validation(_)))
        ));
    }

    #[test]
    fn test_rejects_chunk_size() {
        let mut config = Config::default();
        config.relay.chunk_size = 0;
        assert!(validate(&config).is_err());
        config.relay.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config(".ini", "");
        assert!(load_from_path(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_from_path("/nonexistent/qrexec-proxy.yaml").is_err());
    }
}
