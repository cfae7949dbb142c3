//! Manifest file parser

use super::config::{Manifest, DEFAULT_NETWORK};
use crate::error::{Result, RolloutError};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default manifest file names
pub const DEFAULT_MANIFEST_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Manifest parser
pub struct ManifestParser;

impl ManifestParser {
    /// Find manifest file in directory
    pub fn find_manifest_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse manifest file from path
    pub fn parse_file(path: &Path) -> Result<Manifest> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RolloutError::ManifestParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse manifest from string
    pub fn parse_str(content: &str) -> Result<Manifest> {
        serde_yaml::from_str(content)
            .map_err(|e| RolloutError::ManifestParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Validate a manifest, returning non-fatal warnings
    pub fn validate(manifest: &Manifest) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if manifest.services.is_empty() {
            return Err(RolloutError::ManifestParse(
                "Manifest declares no services".to_string(),
            ));
        }

        for (name, service) in &manifest.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(RolloutError::ManifestParse(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            for dep in service.dependencies() {
                if !manifest.services.contains_key(&dep) {
                    return Err(RolloutError::ManifestParse(format!(
                        "Service '{}' depends on unknown service '{}'",
                        name, dep
                    )));
                }
            }

            if let Some(networks) = &service.networks {
                for net in networks.names() {
                    if net != DEFAULT_NETWORK && !manifest.networks.contains_key(&net) {
                        warnings.push(format!(
                            "Service '{}' references undefined network '{}' (will be created)",
                            name, net
                        ));
                    }
                }
            }

            for mount in service.volumes.iter().flatten() {
                if let Some(volume) = mount.named_volume() {
                    if !manifest.volumes.contains_key(&volume) {
                        warnings.push(format!(
                            "Service '{}' mounts undeclared volume '{}'",
                            name, volume
                        ));
                    }
                }
            }

            if service.restart.is_none() {
                warnings.push(format!(
                    "Service '{}' has no restart policy; it stays down after a host reboot",
                    name
                ));
            }
        }

        manifest.start_order()?;

        Ok(warnings)
    }

    /// Interpolate environment variables in every string of the manifest
    pub fn interpolate(manifest: &mut Manifest, env: &HashMap<String, String>) -> Result<()> {
        let mut value = serde_yaml::to_value(&*manifest)?;
        interpolate_value(&mut value, env);
        *manifest = serde_yaml::from_value(value)
            .map_err(|e| RolloutError::ManifestParse(format!("After interpolation: {}", e)))?;
        Ok(())
    }
}

fn interpolate_value(value: &mut serde_yaml::Value, env: &HashMap<String, String>) {
    use serde_yaml::Value;

    match value {
        Value::String(s) => *s = interpolate_string(s, env),
        Value::Sequence(items) => items.iter_mut().for_each(|v| interpolate_value(v, env)),
        Value::Mapping(map) => map.values_mut().for_each(|v| interpolate_value(v, env)),
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("static pattern is valid")
    })
}

/// Interpolate `${VAR}`, `$VAR`, `${VAR:-default}` and `${VAR-default}`
///
/// `:-` falls back when the variable is unset or empty, `-` only when it
/// is unset. `$$` is an escaped dollar and stays `$$` for compose on the
/// host. Unknown variables without a default are left as written so the
/// host side can still resolve them.
pub fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(s, |caps: &regex::Captures| {
            let Some(name) = caps.get(1).or_else(|| caps.get(4)) else {
                return caps[0].to_string();
            };
            let value = env.get(name.as_str());
            match (caps.get(2).map(|m| m.as_str()), caps.get(3)) {
                (Some(":-"), Some(default)) => match value {
                    Some(v) if !v.is_empty() => v.clone(),
                    _ => default.as_str().to_string(),
                },
                (Some(_), Some(default)) => value
                    .cloned()
                    .unwrap_or_else(|| default.as_str().to_string()),
                _ => value.cloned().unwrap_or_else(|| caps[0].to_string()),
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::config::CommandConfig;
    use tempfile::tempdir;

    #[test]
    fn test_parse_simple_manifest() {
        let yaml = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: mongo:6
    environment:
      MONGO_INITDB_DATABASE: app
"#;

        let manifest = ManifestParser::parse_str(yaml).unwrap();
        assert_eq!(manifest.services.len(), 2);
        assert!(manifest.services.contains_key("web"));
        assert!(manifest.services.contains_key("db"));
    }

    #[test]
    fn test_parse_error_is_manifest_parse() {
        let result = ManifestParser::parse_str("services: [oops");
        assert!(matches!(result, Err(RolloutError::ManifestParse(_))));
    }

    #[test]
    fn test_validate_missing_image() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;

        let manifest = ManifestParser::parse_str(yaml).unwrap();
        assert!(ManifestParser::validate(&manifest).is_err());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let yaml = r#"
services:
  api:
    image: node
    depends_on:
      - mongo
"#;
        let manifest = ManifestParser::parse_str(yaml).unwrap();
        let err = ManifestParser::validate(&manifest).unwrap_err();
        assert!(err.to_string().contains("unknown service 'mongo'"));
    }

    #[test]
    fn test_validate_warnings() {
        let yaml = r#"
services:
  api:
    image: node
    restart: always
    networks:
      - backplane
"#;
        let manifest = ManifestParser::parse_str(yaml).unwrap();
        let warnings = ManifestParser::validate(&manifest).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("backplane"));
    }

    #[test]
    fn test_find_manifest_file() {
        let temp = tempdir().unwrap();
        assert!(ManifestParser::find_manifest_file(temp.path()).is_none());

        std::fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let found = ManifestParser::find_manifest_file(temp.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }

    #[test]
    fn test_interpolate() {
        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "1.0.0".to_string());
        env.insert("DB_HOST".to_string(), "mongo".to_string());

        assert_eq!(interpolate_string("nginx:${TAG}", &env), "nginx:1.0.0");
        assert_eq!(
            interpolate_string("mongodb://$DB_HOST:27017", &env),
            "mongodb://mongo:27017"
        );
        assert_eq!(interpolate_string("${MISSING:-fallback}", &env), "fallback");
        assert_eq!(interpolate_string("${MISSING}", &env), "${MISSING}");
    }

    #[test]
    fn test_interpolate_defaults_and_escapes() {
        let mut env = HashMap::new();
        env.insert("EMPTY".to_string(), String::new());
        env.insert("TAG".to_string(), "2.0".to_string());

        assert_eq!(interpolate_string("${EMPTY:-latest}", &env), "latest");
        assert_eq!(interpolate_string("${EMPTY-latest}", &env), "");
        assert_eq!(interpolate_string("${UNSET-latest}", &env), "latest");
        assert_eq!(interpolate_string("${TAG:-latest}", &env), "2.0");
        assert_eq!(interpolate_string("echo $$HOME", &env), "echo $$HOME");
        assert_eq!(interpolate_string("$$TAG-$TAG", &env), "$$TAG-2.0");
    }

    #[test]
    fn test_interpolate_manifest() {
        let yaml = r#"
services:
  api:
    image: user/mean-api:${TAG:-latest}
    environment:
      - MONGO_URI=${MONGO_URI}
"#;
        let mut manifest = ManifestParser::parse_str(yaml).unwrap();
        let mut env = HashMap::new();
        env.insert("MONGO_URI".to_string(), "mongodb://mongo/app".to_string());

        ManifestParser::interpolate(&mut manifest, &env).unwrap();
        let api = &manifest.services["api"];
        assert_eq!(api.image.as_deref(), Some("user/mean-api:latest"));
        assert_eq!(
            api.environment.as_ref().unwrap().to_map()["MONGO_URI"],
            "mongodb://mongo/app"
        );
    }

    #[test]
    fn test_interpolate_reaches_every_string() {
        let yaml = r#"
services:
  api:
    image: node:20
    command: ["node", "${ENTRY:-server.js}"]
    working_dir: ${APP_DIR}
    deploy:
      resources:
        limits:
          memory: ${API_MEMORY:-512m}
"#;
        let mut manifest = ManifestParser::parse_str(yaml).unwrap();
        let mut env = HashMap::new();
        env.insert("APP_DIR".to_string(), "/srv/api".to_string());

        ManifestParser::interpolate(&mut manifest, &env).unwrap();
        let api = &manifest.services["api"];
        assert_eq!(
            api.command,
            Some(CommandConfig::Exec(vec!["node".into(), "server.js".into()]))
        );
        assert_eq!(api.working_dir.as_deref(), Some("/srv/api"));
        assert_eq!(api.extra["deploy"]["resources"]["limits"]["memory"], "512m");
    }
}
