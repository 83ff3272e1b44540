use async_trait::async_trait;
use dotenvy::dotenv;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::LazyLock;
use std::{env, fs};
use thiserror::Error;

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)\}").expect("static pattern"));

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Error loading config: {0}")]
    ConfigError(String),
}

/// A configuration section that lives under its own table in a TOML file.
#[async_trait]
pub trait ConfigSectionLoader: Sized {
    /// Name of the TOML table holding this section
    const SECTION: &'static str;

    async fn load_section_from_file(file_name: &Path) -> Result<Self, LoadConfigError>;

    fn load_section_from_file_sync(file_name: &Path) -> Result<Self, LoadConfigError>;
}

pub async fn load_from_file<T: DeserializeOwned>(file_name: &Path) -> Result<T, LoadConfigError> {
    dotenv().ok();
    let contents = tokio::fs::read_to_string(file_name).await?;
    parse_expanded(&contents)
}

pub fn load_from_file_sync<T: DeserializeOwned>(file_name: &Path) -> Result<T, LoadConfigError> {
    dotenv().ok();
    let contents = fs::read_to_string(file_name)?;
    parse_expanded(&contents)
}

/// Pulls one table out of a parsed document and deserializes it.
pub fn extract_section<T: DeserializeOwned>(document: toml::Table, section: &str) -> Result<T, LoadConfigError> {
    let Some(value) = document.get(section) else {
        return Err(LoadConfigError::ConfigError(format!("missing [{section}] table")));
    };
    Ok(value.clone().try_into()?)
}

fn parse_expanded<T: DeserializeOwned>(raw: &str) -> Result<T, LoadConfigError> {
    let contents = expand_vars(raw);
    Ok(toml::from_str(&contents)?)
}

/// Replaces `${NAME}` with the value of the environment variable, leaving unknown names untouched.
fn expand_vars(raw_config: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(raw_config, |caps: &Captures| match env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => caps[0].to_string(),
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_vars_keeps_unknown() {
        let raw = "dir = \"${SYBIL_TEST_SURELY_UNSET_VAR}\"";
        assert_eq!(expand_vars(raw), raw);
    }

    #[test]
    fn test_expand_vars_substitutes() {
        // PATH is set on every platform the tests run on
        let path = env::var("PATH").unwrap();
        assert_eq!(expand_vars("p = \"${PATH}\""), format!("p = \"{path}\""));
    }

    #[test]
    fn test_extract_missing_section() {
        let document: toml::Table = toml::from_str("[other]\nkey = 1").unwrap();
        let result: Result<toml::Table, _> = extract_section(document, "detector");
        assert!(matches!(result, Err(LoadConfigError::ConfigError(_))));
    }
}
