use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::schema::HostConfig;
use crate::error::{ConfigError, Result};

pub const ENV_PREFIX: &str = "PLUGIN_HOST_";
const FILE_STEM: &str = "plugin-host";

/// Candidate config files, lowest precedence first.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        roots.push(config_dir.join(FILE_STEM));
    }
    roots.push(PathBuf::from("."));

    roots
        .into_iter()
        .flat_map(|dir| {
            ["toml", "json", "yaml", "yml"]
                .into_iter()
                .map(move |ext| dir.join(format!("{FILE_STEM}.{ext}")))
        })
        .collect()
}

pub async fn load_from_env_or_file() -> Result<HostConfig> {
    let figment = default_search_paths()
        .into_iter()
        .fold(Figment::new(), |figment, path| merge_file(figment, &path));
    finish(figment)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    let path = path.as_ref();
    if !has_supported_extension(path) {
        return Err(ConfigError::Parse(
            "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
        )
        .into());
    }
    if !path.exists() {
        return Err(
            ConfigError::Parse(format!("Config file '{}' not found", path.display())).into(),
        );
    }
    finish(merge_file(Figment::new(), path))
}

fn has_supported_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("toml" | "json" | "yaml" | "yml")
    )
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        _ => figment,
    }
}

fn finish(figment: Figment) -> Result<HostConfig> {
    let config: HostConfig = figment
        // PLUGIN_HOST_SUPERVISOR__TICK_MS=500 sets supervisor.tick_ms
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &HostConfig) -> Result<()> {
    if config.supervisor.tick_ms == 0 {
        return Err(
            ConfigError::Validation("Supervisor tick must be greater than 0".into()).into(),
        );
    }

    let handshake = &config.handshake;
    if handshake.magic_cookie_key.is_empty() || handshake.magic_cookie_value.is_empty() {
        return Err(
            ConfigError::Validation("Handshake magic cookie must not be empty".into()).into(),
        );
    }

    let mut seen = HashSet::new();
    for plugin in &config.plugins {
        if plugin.id.is_empty() {
            return Err(ConfigError::Validation("Plugin has empty id".into()).into());
        }
        if plugin.executable.as_os_str().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' has empty executable",
                plugin.id
            ))
            .into());
        }
        if plugin.protocol_versions.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' offers no protocol versions",
                plugin.id
            ))
            .into());
        }
        if !seen.insert(plugin.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' is configured more than once",
                plugin.id
            ))
            .into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: HostConfig) -> Result<HostConfig> {
    let pattern = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid substitution pattern: {e}")))?;

    for plugin in &mut config.plugins {
        for arg in &mut plugin.args {
            *arg = substitute_env_vars(&pattern, arg)?;
        }
        for value in plugin.env.values_mut() {
            *value = substitute_env_vars(&pattern, value)?;
        }
    }

    Ok(config)
}

/// Expands `${VAR}` and `${VAR:-default}`.
fn substitute_env_vars(pattern: &Regex, input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in pattern.captures_iter(input) {
        let expr = &cap[1];
        let value = match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{expr}' not found"))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
