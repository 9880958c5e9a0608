use std::{fmt::Display, str::FromStr};

use serde::Serialize;

use crate::{
    document_db::DocumentDb,
    error::{Error, Result},
    model_manager::default_model_id,
};

pub const DEFAULT_MAX_SERVICES: usize = 32;
pub const DEFAULT_LEXICAL_WINDOW: usize = 200;

pub const MAX_SERVICES_KEY: &str = "max_services";
pub const LEXICAL_WINDOW_KEY: &str = "lexical_window";
pub const MODEL_KEY: &str = "model";
pub const VECTORS_KEY: &str = "vectors";

/// Setting keys accepted by `docchat config`.
pub const SETTING_KEYS: &[&str] =
    &[MAX_SERVICES_KEY, LEXICAL_WINDOW_KEY, MODEL_KEY, VECTORS_KEY];

/// Values given on the command line. `None` defers to stored settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_services: Option<usize>,
    pub lexical_window: Option<usize>,
    pub model: Option<String>,
    pub no_vectors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    /// Capacity of the index cache. Always at least 1.
    pub max_services: usize,
    pub lexical_window: usize,
    pub model: String,
    /// Whether to build vector indexes at all.
    pub vectors: bool,
}

impl ServiceConfig {
    /// Resolve each value from the command line, then the settings table,
    /// then the built-in default.
    pub fn resolve(overrides: &ConfigOverrides, db: &DocumentDb) -> Result<Self> {
        let max_services = match overrides.max_services {
            Some(n) => n,
            None => stored(db, MAX_SERVICES_KEY)?.unwrap_or(DEFAULT_MAX_SERVICES),
        };
        let lexical_window = match overrides.lexical_window {
            Some(n) => n,
            None => stored(db, LEXICAL_WINDOW_KEY)?.unwrap_or(DEFAULT_LEXICAL_WINDOW),
        };
        let model = match &overrides.model {
            Some(model) => model.clone(),
            None => db.get_setting(MODEL_KEY)?.unwrap_or_else(default_model_id),
        };
        let vectors = if overrides.no_vectors {
            false
        } else {
            match db.get_setting(VECTORS_KEY)? {
                Some(raw) => parse_switch(VECTORS_KEY, &raw)?,
                None => true,
            }
        };

        Ok(Self {
            max_services: max_services.max(1),
            lexical_window,
            model,
            vectors,
        })
    }
}

/// Check that `value` is acceptable for `key` before it is stored.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    match key {
        MAX_SERVICES_KEY | LEXICAL_WINDOW_KEY => parse_number::<usize>(key, value).map(|_| ()),
        VECTORS_KEY => parse_switch(key, value).map(|_| ()),
        MODEL_KEY if !value.trim().is_empty() => Ok(()),
        MODEL_KEY => Err(Error::Config("model must not be empty".to_string())),
        _ => validate_key(key),
    }
}

/// Reject keys that are not in [`SETTING_KEYS`].
pub fn validate_key(key: &str) -> Result<()> {
    if SETTING_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "unknown setting '{key}' (expected one of: {})",
            SETTING_KEYS.join(", ")
        )))
    }
}

fn stored<T>(db: &DocumentDb, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    db.get_setting(key)?
        .map(|raw| parse_number(key, &raw))
        .transpose()
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid value '{raw}' for {key}: {e}")))
}

fn parse_switch(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(Error::Config(format!(
            "invalid value '{raw}' for {key}: expected on or off"
        ))),
    }
}
