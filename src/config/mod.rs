//! Descriptor model and loader for Catalyst.
//!
//! A descriptor is a YAML document declaring one or more mock listener
//! servers. This module owns the in-memory tree ([`MockServer`] and its
//! children), the file/directory loaders, the field-qualified validation
//! pass, and the YAML writer used by the control plane.

use crate::error::{CatalystError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Root of a descriptor tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockServer {
    pub http: Http,
}

/// The HTTP section: an ordered list of listener servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Http {
    pub servers: Vec<Server>,
}

/// A single mock listener server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub listen: u16,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub logger: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logger_path: String,
    /// Optional control port; must differ from `listen` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub location: Vec<Location>,
}

/// A single route within a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub method: HttpMethod,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(
        rename = "async",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub asyncs: Option<Vec<Async>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos_injection: Option<ChaosInjection>,
    /// When set, the path is a static mount and response fields are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_files_dir: Option<String>,
}

impl Location {
    /// Whether this location serves a static directory instead of a
    /// templated response.
    pub fn is_static(&self) -> bool {
        self.static_files_dir
            .as_deref()
            .map(|d| !d.is_empty())
            .unwrap_or(false)
    }
}

/// HTTP method supported by a location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound fan-out call fired by a location handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Async {
    /// Absolute target URL. Wins over `path` when both are set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Relative path resolved against the inbound request's scheme/host.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Per-call timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Delay between retry attempts in milliseconds. Defaults to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
}

/// Chaos configuration for a location. Absent axes are no-ops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChaosInjection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Latency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<Abort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInjection>,
}

/// Latency axis: sleep `time` milliseconds with the given probability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Latency {
    pub time: u64,
    #[serde(default)]
    pub probability: Probability,
}

/// Abort axis: reply with `code` and no body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Abort {
    pub code: u16,
    #[serde(default)]
    pub probability: Probability,
}

/// Error axis: reply with `code` and the configured response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInjection {
    pub code: u16,
    #[serde(default)]
    pub probability: Probability,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
}

/// A percentage in [0, 100] that descriptors may write as a number or a
/// numeric string. Non-numeric values disable the axis they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Probability {
    Number(f64),
    Text(String),
}

impl Default for Probability {
    fn default() -> Self {
        Probability::Number(0.0)
    }
}

impl Probability {
    /// Parse into a percentage, or `None` when the value is not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Probability::Number(n) => Some(*n),
            Probability::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

impl From<f64> for Probability {
    fn from(n: f64) -> Self {
        Probability::Number(n)
    }
}

/// Load a descriptor from a YAML file and validate it.
pub fn load_file(path: &Path) -> Result<MockServer> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalystError::Load {
        path: path.display().to_string(),
        reason: format!("read failed: {e}"),
    })?;

    let tree: MockServer = serde_yaml::from_str(&content).map_err(|e| CatalystError::Load {
        path: path.display().to_string(),
        reason: format!("parse failed: {e}"),
    })?;

    validate(&tree)?;
    Ok(tree)
}

/// Load every `*.yml` / `*.yaml` descriptor in a directory.
///
/// Fails when the directory yields zero descriptors, or when any single
/// descriptor fails to load.
pub fn load_dir(dir: &Path) -> Result<Vec<MockServer>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| CatalystError::Load {
            path: dir.display().to_string(),
            reason: format!("read dir failed: {e}"),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(CatalystError::NoDescriptors(dir.display().to_string()));
    }

    let mut configs = Vec::with_capacity(files.len());
    for file in &files {
        configs.push(load_file(file)?);
    }

    // Duplicate listen ports across the whole aggregate are rejected.
    let mut seen = HashSet::new();
    for config in &configs {
        for server in &config.http.servers {
            if !seen.insert(server.listen) {
                return Err(CatalystError::InvalidConfig {
                    field: "http.servers.listen".to_string(),
                    reason: format!("duplicate listen port {} across descriptors", server.listen),
                });
            }
        }
    }

    Ok(configs)
}

/// Serialize a descriptor tree back to YAML and write it atomically
/// (same-directory temp file followed by a rename).
pub fn save_file(tree: &MockServer, path: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(tree)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, yaml.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Locate the descriptor file for `server_name` in `dir`, trying the
/// `.yml` and `.yaml` extensions in that order.
pub fn find_config_file(dir: &Path, server_name: &str) -> Option<PathBuf> {
    for ext in ["yml", "yaml"] {
        let candidate = dir.join(format!("{server_name}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Resolve the configuration directory: `CONFIG_DIR` environment variable,
/// falling back to `./config`.
pub fn config_dir_from_env() -> PathBuf {
    match std::env::var("CONFIG_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("./config"),
    }
}

/// Validate a descriptor tree. Errors point at the offending field.
pub fn validate(tree: &MockServer) -> Result<()> {
    if tree.http.servers.is_empty() {
        return Err(CatalystError::InvalidConfig {
            field: "http.servers".to_string(),
            reason: "no servers defined".to_string(),
        });
    }

    let mut ports = HashSet::new();
    for (i, server) in tree.http.servers.iter().enumerate() {
        if server.listen == 0 {
            return Err(CatalystError::InvalidConfig {
                field: format!("http.servers[{i}].listen"),
                reason: "listen port must be in [1, 65535]".to_string(),
            });
        }
        if !ports.insert(server.listen) {
            return Err(CatalystError::InvalidConfig {
                field: format!("http.servers[{i}].listen"),
                reason: format!("duplicate listen port {}", server.listen),
            });
        }
        if let Some(control) = server.port {
            if control == server.listen {
                return Err(CatalystError::InvalidConfig {
                    field: format!("http.servers[{i}].port"),
                    reason: "control port must differ from listen port".to_string(),
                });
            }
            if !ports.insert(control) {
                return Err(CatalystError::InvalidConfig {
                    field: format!("http.servers[{i}].port"),
                    reason: format!("duplicate port {control}"),
                });
            }
        }
        if server.location.is_empty() {
            return Err(CatalystError::InvalidConfig {
                field: format!("http.servers[{i}].location"),
                reason: "at least one location is required".to_string(),
            });
        }

        for (j, location) in server.location.iter().enumerate() {
            if location.path.is_empty() {
                return Err(CatalystError::InvalidConfig {
                    field: format!("http.servers[{i}].location[{j}].path"),
                    reason: "path must not be empty".to_string(),
                });
            }
            if !location.path.starts_with('/') {
                return Err(CatalystError::InvalidConfig {
                    field: format!("http.servers[{i}].location[{j}].path"),
                    reason: "path must be rooted".to_string(),
                });
            }
            if !(100..=599).contains(&location.status_code) {
                return Err(CatalystError::InvalidConfig {
                    field: format!("http.servers[{i}].location[{j}].status_code"),
                    reason: format!("status code {} out of range [100, 599]", location.status_code),
                });
            }
            // The schema text must at least be valid JSON here; compilation
            // happens when the listener is created.
            if let Some(schema) = &location.schema {
                if serde_json::from_str::<serde_json::Value>(schema).is_err() {
                    return Err(CatalystError::InvalidConfig {
                        field: format!("http.servers[{i}].location[{j}].schema"),
                        reason: "schema is not valid JSON".to_string(),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_yaml() -> &'static str {
        r#"
http:
  servers:
    - listen: 8080
      name: test-server
      version: "1.0"
      logger: false
      location:
        - path: /api/test
          method: GET
          status_code: 200
          response: '{"test": true}'
"#
    }

    fn parse(yaml: &str) -> MockServer {
        serde_yaml::from_str(yaml).expect("valid yaml")
    }

    #[test]
    fn test_parse_minimal_descriptor() {
        let tree = parse(minimal_yaml());
        assert_eq!(tree.http.servers.len(), 1);
        let server = &tree.http.servers[0];
        assert_eq!(server.listen, 8080);
        assert_eq!(server.name, "test-server");
        assert_eq!(server.location[0].method, HttpMethod::GET);
        assert_eq!(server.location[0].status_code, 200);
        assert!(validate(&tree).is_ok());
    }

    #[test]
    fn test_probability_accepts_number_and_string() {
        let chaos: ChaosInjection = serde_yaml::from_str(
            r#"
latency: { time: 100, probability: 50 }
abort: { code: 503, probability: "25.5" }
"#,
        )
        .unwrap();
        assert_eq!(chaos.latency.unwrap().probability.as_f64(), Some(50.0));
        assert_eq!(chaos.abort.unwrap().probability.as_f64(), Some(25.5));
    }

    #[test]
    fn test_probability_non_numeric_is_none() {
        let p = Probability::Text("200 80% 500 20%".to_string());
        assert_eq!(p.as_f64(), None);
    }

    #[test]
    fn test_status_code_string_rejected_at_parse() {
        let yaml = minimal_yaml().replace("status_code: 200", "status_code: \"200 80% 500 20%\"");
        assert!(serde_yaml::from_str::<MockServer>(&yaml).is_err());
    }

    #[test]
    fn test_status_code_boundaries() {
        for (code, ok) in [(100u16, true), (599, true), (99, false), (600, false)] {
            let yaml = minimal_yaml().replace("status_code: 200", &format!("status_code: {code}"));
            let tree = parse(&yaml);
            assert_eq!(validate(&tree).is_ok(), ok, "status {code}");
        }
    }

    #[test]
    fn test_validate_rejects_empty_servers() {
        let tree = MockServer::default();
        let err = validate(&tree).unwrap_err();
        assert!(err.to_string().contains("http.servers"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let mut tree = parse(minimal_yaml());
        let dup = tree.http.servers[0].clone();
        tree.http.servers.push(dup);
        assert!(validate(&tree).is_err());
    }

    #[test]
    fn test_validate_rejects_control_port_equal_to_listen() {
        let mut tree = parse(minimal_yaml());
        tree.http.servers[0].port = Some(8080);
        assert!(validate(&tree).is_err());
        tree.http.servers[0].port = Some(8282);
        assert!(validate(&tree).is_ok());
    }

    #[test]
    fn test_validate_rejects_unrooted_path() {
        let yaml = minimal_yaml().replace("/api/test", "api/test");
        assert!(validate(&parse(&yaml)).is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_schema_json() {
        let mut tree = parse(minimal_yaml());
        tree.http.servers[0].location[0].schema = Some("{not json".to_string());
        assert!(validate(&tree).is_err());
        tree.http.servers[0].location[0].schema = Some(r#"{"type":"object"}"#.to_string());
        assert!(validate(&tree).is_ok());
    }

    #[test]
    fn test_load_dir_requires_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, CatalystError::NoDescriptors(_)));
    }

    #[test]
    fn test_load_dir_rejects_cross_file_duplicate_ports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yml"), minimal_yaml()).unwrap();
        std::fs::write(dir.path().join("b.yaml"), minimal_yaml()).unwrap();
        let err = load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate listen port"));
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yml");

        let mut tree = parse(minimal_yaml());
        tree.http.servers[0].location[0].chaos_injection = Some(ChaosInjection {
            abort: Some(Abort {
                code: 503,
                probability: Probability::Text("12.5".to_string()),
            }),
            ..Default::default()
        });

        save_file(&tree, &path).unwrap();
        let reloaded = load_file(&path).unwrap();
        assert_eq!(tree, reloaded);
    }

    #[test]
    fn test_find_config_file_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("alpha.yaml")).unwrap();
        f.write_all(b"http:\n  servers: []\n").unwrap();

        assert!(find_config_file(dir.path(), "alpha").is_some());
        assert!(find_config_file(dir.path(), "beta").is_none());
    }
}
