//! Agent properties.
//!
//! Properties are an arbitrary JSON object sent with `register` so the
//! server can expose device metadata to operators. They come from an
//! optional properties file; the access allowlist and a `hostname` entry are
//! filled in here.

use std::path::Path;

use serde_json::{json, Map, Value};

/// Load the properties object.
///
/// The allowlist priority is: command-line `allowlist` (comma-separated
/// `u/<user>` / `g/<group>` entities, bare names get `u/` prefixed), then a
/// non-empty `allowlist` key from the file, then `u/<current user>`.
pub fn load(prop_file: Option<&Path>, allowlist: Option<&str>) -> Value {
    let mut props = read_prop_file(prop_file);

    if let Some(list) = allowlist {
        if props
            .get("allowlist")
            .and_then(Value::as_array)
            .is_some_and(|a| !a.is_empty())
        {
            log::warn!(
                "overwriting existing allowlist from properties file with \
                 command line allowlist value"
            );
        }
        props.insert("allowlist".into(), json!(normalize_allowlist(list)));
    } else if props
        .get("allowlist")
        .and_then(Value::as_array)
        .map_or(true, |a| a.is_empty())
    {
        props.insert("allowlist".into(), json!([format!("u/{}", current_user())]));
    }

    if !props.contains_key("hostname") {
        if let Ok(name) = hostname::get() {
            props.insert("hostname".into(), json!(name.to_string_lossy()));
        }
    }

    Value::Object(props)
}

fn read_prop_file(prop_file: Option<&Path>) -> Map<String, Value> {
    let Some(path) = prop_file else {
        return Map::new();
    };
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                log::error!("properties file {}: not a JSON object", path.display());
                Map::new()
            }
            Err(err) => {
                log::error!("properties file {}: {err}", path.display());
                Map::new()
            }
        },
        Err(err) => {
            log::error!("properties file {}: {err}", path.display());
            Map::new()
        }
    }
}

/// Split, trim, and prefix bare entries with `u/`.
fn normalize_allowlist(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entity| !entity.is_empty())
        .map(|entity| {
            if entity.contains('/') {
                entity.to_string()
            } else {
                format!("u/{entity}")
            }
        })
        .collect()
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn allowlist_entities_get_user_prefix() {
        assert_eq!(
            normalize_allowlist("alice, g/admins ,, u/bob"),
            vec!["u/alice", "g/admins", "u/bob"]
        );
    }

    #[test]
    fn default_allowlist_is_current_user() {
        let props = load(None, None);
        let list = props["allowlist"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].as_str().unwrap().starts_with("u/"));
    }

    #[test]
    fn cli_allowlist_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"allowlist": ["u/old"], "site": "lab-3"}"#)
            .unwrap();
        let props = load(Some(file.path()), Some("alice"));
        assert_eq!(props["allowlist"], json!(["u/alice"]));
        assert_eq!(props["site"], "lab-3");
    }

    #[test]
    fn file_allowlist_kept_without_cli_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"allowlist": ["g/ops"]}"#).unwrap();
        let props = load(Some(file.path()), None);
        assert_eq!(props["allowlist"], json!(["g/ops"]));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{broken").unwrap();
        let props = load(Some(file.path()), None);
        assert!(props["allowlist"].is_array());
    }

    #[test]
    fn hostname_is_filled_in() {
        let props = load(None, None);
        assert!(props.get("hostname").is_some());
    }
}
