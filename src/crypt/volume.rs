//! Encrypted volume and key type definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Parameters a key type may define.
pub const CRYPTSETUP_KEY_PARAMETERS: [&str; 3] = ["key_command", "plymouth_key_command", "reset_command"];

/// Every parameter a volume entry may carry.
pub const CRYPTSETUP_PARAMETERS: [&str; 16] = [
    "key_type",
    "partuuid",
    "uuid",
    "path",
    "key_file",
    "header_file",
    "retries",
    "key_command",
    "plymouth_key_command",
    "reset_command",
    "try_nokey",
    "include_key",
    "include_header",
    "validate",
    "validate_key",
    "validate_header",
];

/// A configured encrypted volume, as stored under `cryptsetup.<mapped_name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptsetupVolume {
    pub key_type: Option<String>,
    pub partuuid: Option<String>,
    pub uuid: Option<String>,
    pub path: Option<String>,
    pub key_file: Option<String>,
    pub header_file: Option<String>,
    pub retries: Option<u64>,
    pub key_command: Option<String>,
    pub plymouth_key_command: Option<String>,
    pub reset_command: Option<String>,
    pub try_nokey: bool,
    pub include_key: bool,
    pub include_header: bool,
    pub validate: Option<bool>,
    pub validate_key: Option<bool>,
    pub validate_header: Option<bool>,
}

impl CryptsetupVolume {
    /// Read a stored volume entry.
    pub fn from_value(name: &str, value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid_parameter(format!("cryptsetup.{}", name), e.to_string()))
    }

    /// Identity token used to find the device at boot: (`PARTUUID`, value)
    /// or (`UUID`, value). Partuuid is preferred.
    pub fn token(&self) -> Option<(&'static str, &str)> {
        if let Some(partuuid) = self.partuuid.as_deref() {
            return Some(("partuuid", partuuid));
        }
        self.uuid.as_deref().map(|uuid| ("uuid", uuid))
    }

    /// Number of source identities configured.
    pub fn source_count(&self) -> usize {
        [&self.partuuid, &self.uuid, &self.path]
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Copy with every key-related parameter removed, for the manual
    /// fallback after keyed attempts are exhausted.
    pub fn without_keys(&self) -> Self {
        Self {
            key_file: None,
            key_command: None,
            plymouth_key_command: None,
            reset_command: None,
            try_nokey: false,
            ..self.clone()
        }
    }
}

/// Named template of key acquisition commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyType {
    pub key_command: Option<String>,
    pub plymouth_key_command: Option<String>,
    pub reset_command: Option<String>,
}

/// Parameters in `config` that are not valid volume parameters.
pub fn unknown_parameters(config: &Map<String, Value>) -> Vec<&str> {
    config
        .keys()
        .map(String::as_str)
        .filter(|k| !CRYPTSETUP_PARAMETERS.contains(k))
        .collect()
}

/// Mapped names become `/dev/mapper/<name>` and appear unquoted in the
/// generated script.
pub fn check_mapped_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_parameter(name, "cryptsetup (invalid mapped name)"))
    }
}

/// Replace `{param}` placeholders with the volume's own values.
/// `{{` and `}}` produce literal braces.
pub fn substitute(template: &str, values: &Map<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(Error::invalid_parameter(template, "key type template (unclosed '{')"));
                }
                match values.get(&key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {
                        return Err(Error::invalid_parameter(
                            key,
                            format!("key type template '{}' (no such volume parameter)", template),
                        ))
                    }
                    Some(other) => out.push_str(&other.to_string()),
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}
