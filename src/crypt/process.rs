//! Processing of `cryptsetup` and `cryptsetup_key_types` entries as they are
//! loaded.
//!
//! A volume entry may be given more than once; later parts are merged into
//! the stored entry with new keys winning. Key type commands are inherited
//! and substituted with the volume's own parameters, and retries are filled
//! in from `cryptsetup_retries`.

use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use super::volume::{check_mapped_name, substitute, unknown_parameters, CRYPTSETUP_KEY_PARAMETERS};
use crate::error::{Error, Result};
use crate::store::ConfigStore;

/// Key types available without configuration.
const BUILTIN_KEY_TYPES: &[(&str, &str, &str)] = &[
    (
        "gpg",
        "gpg --batch --pinentry-mode loopback --decrypt {key_file}",
        "gpg --batch --pinentry-mode loopback --passphrase-fd 0 --decrypt {key_file}",
    ),
    (
        "openssl",
        "openssl aes-256-cbc -pbkdf2 -d -in {key_file}",
        "openssl aes-256-cbc -pbkdf2 -d -in {key_file} -pass stdin",
    ),
];

/// Register the built-in key types.
pub fn builtin_key_types(config: &mut ConfigStore) -> Result<()> {
    for (name, key_command, plymouth_key_command) in BUILTIN_KEY_TYPES {
        process_key_type(
            config,
            name,
            json!({"key_command": key_command, "plymouth_key_command": plymouth_key_command}),
        )?;
    }
    Ok(())
}

fn expect_object(value: Value, context: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::invalid_parameter(context, "expected a mapping")),
    }
}

/// Create or update a key type.
pub fn process_key_type(config: &mut ConfigStore, name: &str, value: Value) -> Result<()> {
    let context = format!("cryptsetup_key_types.{}", name);
    let incoming = expect_object(value, &context)?;
    debug!("[{}] Processing cryptsetup key type configuration: {:?}", name, incoming);
    for parameter in incoming.keys() {
        if !CRYPTSETUP_KEY_PARAMETERS.contains(&parameter.as_str()) {
            return Err(Error::invalid_parameter(parameter.as_str(), context));
        }
    }

    let merged = match config.get_entry("cryptsetup_key_types", name) {
        Some(Value::Object(existing)) => {
            debug!("[{}] Updating key type configuration", name);
            let mut merged = existing.clone();
            merged.extend(incoming);
            merged
        }
        _ => {
            if !incoming.contains_key("key_command") {
                return Err(Error::validation(format!("Missing key_command for key type: {}", name)));
            }
            incoming
        }
    };
    config.overwrite_entry("cryptsetup_key_types", name, Value::Object(merged))
}

/// Process one `cryptsetup.<mapped_name>` entry.
pub fn process_volume(config: &mut ConfigStore, name: &str, value: Value) -> Result<()> {
    check_mapped_name(name)?;
    let incoming = expect_object(value, &format!("cryptsetup.{}", name))?;
    for parameter in unknown_parameters(&incoming) {
        error!("[{}] Unknown parameter: {}", name, parameter);
    }

    let mut merged = match config.get_entry("cryptsetup", name) {
        Some(Value::Object(existing)) => {
            debug!("[{}] Merging cryptsetup configuration: {:?}", name, incoming);
            existing.clone()
        }
        _ => Map::new(),
    };
    merged.extend(incoming);

    inherit_key_type(config, name, &mut merged)?;

    for file_type in ["key", "header"] {
        if merged.get(&format!("include_{}", file_type)).and_then(Value::as_bool) != Some(true) {
            continue;
        }
        let file_key = format!("{}_file", file_type);
        let Some(file) = merged.get(&file_key).and_then(Value::as_str) else {
            return Err(Error::validation(format!(
                "[{}] include_{} is set but {} is not",
                name, file_type, file_key
            )));
        };
        config.append_to("dependencies", json!(file))?;
    }

    let retries = resolve_retries(config, name, merged.get("retries"))?;
    merged.insert("retries".to_string(), json!(retries));

    config.overwrite_entry("cryptsetup", name, Value::Object(merged))
}

fn inherit_key_type(config: &ConfigStore, name: &str, merged: &mut Map<String, Value>) -> Result<()> {
    let key_type = match merged.get("key_type").and_then(Value::as_str) {
        Some(key_type) => key_type.to_string(),
        None => match config.get_str("cryptsetup_key_type") {
            Some(key_type) => key_type.to_string(),
            None => return Ok(()),
        },
    };
    debug!("[{}] Using key type: {}", name, key_type);
    let Some(Value::Object(template)) = config.get_entry("cryptsetup_key_types", &key_type) else {
        return Err(Error::invalid_parameter(
            "key_type",
            format!("cryptsetup.{} (unknown key type '{}')", name, key_type),
        ));
    };
    merged.insert("key_type".to_string(), json!(key_type));

    for parameter in CRYPTSETUP_KEY_PARAMETERS {
        if let Some(command) = template.get(parameter).and_then(Value::as_str) {
            let command = substitute(command, merged)?;
            merged.insert(parameter.to_string(), json!(command));
        }
    }
    Ok(())
}

/// Positive retry count, or the global default when unset or zero.
fn resolve_retries(config: &ConfigStore, name: &str, value: Option<&Value>) -> Result<u64> {
    match value {
        Some(v) if v.as_u64().is_some_and(|n| n > 0) => Ok(v.as_u64().unwrap_or_default()),
        None | Some(Value::Null) => default_retries(config, name),
        Some(v) if v.as_u64() == Some(0) => default_retries(config, name),
        Some(v) => Err(Error::invalid_parameter(
            "retries",
            format!("cryptsetup.{} (expected a positive integer, got {})", name, v),
        )),
    }
}

fn default_retries(config: &ConfigStore, name: &str) -> Result<u64> {
    let retries = config.get_u64("cryptsetup_retries").unwrap_or(5);
    if retries == 0 {
        return Err(Error::invalid_parameter("cryptsetup_retries", "must be a positive integer"));
    }
    info!("[{}] No retries specified, using default: {}", name, retries);
    Ok(retries)
}
