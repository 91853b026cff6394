use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// A profile as exported from the workspace directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub location_field: Option<String>,
    #[serde(default)]
    pub school_field: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

impl UserRecord {
    pub fn location(&self) -> &str {
        self.location_field.as_deref().unwrap_or_default()
    }

    pub fn cache_key(&self) -> String {
        normalize_location(self.location())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateResult {
    pub lat: f64,
    pub long: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionMethod {
    #[serde(rename = "geocoding")]
    Lookup,
    #[serde(rename = "ai")]
    Fallback,
    #[serde(rename = "failed")]
    Unresolved,
}

/// Outcome of one resolver tier for a single location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Hit(CoordinateResult),
    Miss,
}

impl Resolution {
    pub fn hit(self) -> Option<CoordinateResult> {
        match self {
            Resolution::Hit(result) => Some(result),
            Resolution::Miss => None,
        }
    }
}

/// A user record annotated with how (and whether) it was placed on the map.
///
/// Coordinates are present exactly when `method` is not `Unresolved`; the
/// constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedUserRecord {
    #[serde(flatten)]
    user: UserRecord,
    #[serde(flatten)]
    coordinates: Option<CoordinateResult>,
    method: ResolutionMethod,
}

impl GeocodedUserRecord {
    pub fn resolved(user: UserRecord, coordinates: CoordinateResult, via_fallback: bool) -> Self {
        let method = if via_fallback {
            ResolutionMethod::Fallback
        } else {
            ResolutionMethod::Lookup
        };
        Self {
            user,
            coordinates: Some(coordinates),
            method,
        }
    }

    pub fn unresolved(user: UserRecord) -> Self {
        Self {
            user,
            coordinates: None,
            method: ResolutionMethod::Unresolved,
        }
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn coordinates(&self) -> Option<&CoordinateResult> {
        self.coordinates.as_ref()
    }

    pub fn method(&self) -> ResolutionMethod {
        self.method
    }
}

/// Lowercased, trimmed location text used as the cache key.
pub fn normalize_location(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn load_users(path: &Path) -> AppResult<Vec<UserRecord>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        AppError::Config(format!("failed to read input file {}: {err}", path.display()))
    })?;
    let users: Vec<UserRecord> = serde_json::from_str(&contents)
        .map_err(|err| AppError::Parse(format!("invalid input file {}: {err}", path.display())))?;
    Ok(users)
}

/// Rewrites the whole output file; readers never see a half-written array.
pub fn persist_output(path: &Path, records: &[GeocodedUserRecord]) -> AppResult<()> {
    let serialized = serde_json::to_string_pretty(records)?;
    write_replacing(path, serialized.as_bytes())
}

pub(crate) fn write_replacing(path: &Path, contents: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "output".into());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn user(id: &str, location: Option<&str>) -> UserRecord {
        UserRecord {
            id: id.into(),
            name: Some(format!("{id}-handle")),
            real_name: None,
            location_field: location.map(str::to_string),
            school_field: None,
            phone: Some(String::new()),
            locale: Some("en-US".into()),
        }
    }

    #[test]
    fn normalizes_cache_keys() {
        assert_eq!(normalize_location("  New York  "), "new york");
        assert_eq!(user("U1", None).cache_key(), "");
        assert_eq!(user("U1", Some(" Berlin ")).cache_key(), "berlin");
    }

    #[test]
    fn parses_sparse_input_records() {
        let users: Vec<UserRecord> = serde_json::from_value(json!([
            { "id": "U1", "name": "a", "real_name": "A", "location_field": "Paris",
              "school_field": null, "phone": "", "locale": "fr-FR" },
            { "id": "U2", "school_field": "MIT" }
        ]))
        .unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].location(), "Paris");
        assert_eq!(users[1].location(), "");
        assert_eq!(users[1].school_field.as_deref(), Some("MIT"));
    }

    #[test]
    fn resolved_records_flatten_coordinates() {
        let record = GeocodedUserRecord::resolved(
            user("U1", Some("Paris")),
            CoordinateResult {
                lat: 48.85,
                long: 2.35,
                confidence: 80.0,
            },
            false,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "U1");
        assert_eq!(value["lat"], 48.85);
        assert_eq!(value["long"], 2.35);
        assert_eq!(value["method"], "geocoding");
    }

    #[test]
    fn unresolved_records_omit_coordinates() {
        let record = GeocodedUserRecord::unresolved(user("U2", Some("the moon")));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["method"], "failed");
        assert!(value.get("lat").is_none());
        assert!(value.get("long").is_none());
        assert!(value.get("confidence").is_none());
        assert!(record.coordinates().is_none());
    }

    #[test]
    fn output_file_is_replaced_in_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        let first = vec![
            GeocodedUserRecord::unresolved(user("U1", None)),
            GeocodedUserRecord::unresolved(user("U2", None)),
        ];
        persist_output(&path, &first).unwrap();
        persist_output(&path, &first[..1]).unwrap();

        let written: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 1);
        assert!(!dir.path().join("nested").join("out.json.tmp").exists());
    }

    #[test]
    fn missing_input_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let err = load_users(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
