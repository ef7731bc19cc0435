//! Package reference extraction from install commands and manifests.
//!
//! Recognizes `npm install` / `npm i`, `yarn add`, `pnpm add|install`,
//! `pip install` command lines, and the `package.json`,
//! `requirements.txt` and `pyproject.toml` manifests. Scoped npm
//! packages (`@scope/name`) are treated as private and skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Package registries Sage can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registry {
    Npm,
    Pypi,
}

impl Registry {
    pub fn as_str(&self) -> &'static str {
        match self {
            Registry::Npm => "npm",
            Registry::Pypi => "pypi",
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A package named by a tool call, before any registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub registry: Registry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PackageRef {
    /// Verdict-cache key: `registry:name[@version]`.
    pub fn cache_key(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}@{}", self.registry, self.name, version),
            None => format!("{}:{}", self.registry, self.name),
        }
    }
}

/// Extract package references from one tool call. Bash commands are
/// parsed for installer invocations; Write/Edit payloads targeting a
/// known manifest are parsed as that manifest.
pub fn extract_packages(tool_name: &str, tool_input: &Value) -> Vec<PackageRef> {
    match tool_name {
        "Bash" => tool_input
            .get("command")
            .and_then(Value::as_str)
            .map(parse_install_command)
            .unwrap_or_default(),
        "Write" | "Edit" => {
            let content_field = if tool_name == "Write" {
                "content"
            } else {
                "new_string"
            };
            let Some(path) = tool_input.get("file_path").and_then(Value::as_str) else {
                return Vec::new();
            };
            let Some(content) = tool_input.get(content_field).and_then(Value::as_str) else {
                return Vec::new();
            };
            parse_manifest(path, content)
        }
        _ => Vec::new(),
    }
}

/// Parse installer invocations out of a shell command. The command is
/// split at `&&`, `||`, `;` and `|` token boundaries so each segment is
/// inspected independently.
pub fn parse_install_command(command: &str) -> Vec<PackageRef> {
    let mut packages = Vec::new();
    for segment in command
        .split_whitespace()
        .collect::<Vec<_>>()
        .split(|token| matches!(*token, "&&" | "||" | ";" | "|"))
    {
        packages.extend(parse_segment(segment));
    }
    packages
}

fn parse_segment(tokens: &[&str]) -> Vec<PackageRef> {
    if tokens.len() < 2 {
        return Vec::new();
    }
    let (registry, arg_start) = match (tokens[0], tokens[1]) {
        ("npm", "install" | "i" | "add") => (Registry::Npm, 2),
        ("yarn", "add") => (Registry::Npm, 2),
        ("pnpm", "add" | "install" | "i") => (Registry::Npm, 2),
        ("pip" | "pip3", "install") => (Registry::Pypi, 2),
        _ => return Vec::new(),
    };

    let mut packages = Vec::new();
    let mut skip_next = false;
    for token in &tokens[arg_start..] {
        if skip_next {
            skip_next = false;
            continue;
        }
        if token.starts_with('-') {
            // Value-taking flags consume the following token.
            if matches!(
                *token,
                "-r" | "--requirement" | "--registry" | "--index-url" | "-i" | "--prefix"
            ) {
                skip_next = true;
            }
            continue;
        }
        match registry {
            Registry::Npm => {
                if token.starts_with('@') {
                    debug!("Skipping scoped npm package {token}");
                    continue;
                }
                let (name, version) = split_npm_spec(token);
                if !name.is_empty() {
                    packages.push(PackageRef {
                        name,
                        registry,
                        version,
                    });
                }
            }
            Registry::Pypi => {
                if let Some(package) = parse_pip_spec(token) {
                    packages.push(package);
                }
            }
        }
    }
    packages
}

/// `name@1.2.3` → (`name`, Some("1.2.3")).
fn split_npm_spec(spec: &str) -> (String, Option<String>) {
    match spec.split_once('@') {
        Some((name, version)) if !version.is_empty() => {
            (name.to_string(), Some(version.to_string()))
        }
        _ => (spec.to_string(), None),
    }
}

/// PEP 508-ish requirement: name with an optional version constraint.
/// Only exact pins (`==`) carry a version; ranges resolve server-side.
fn parse_pip_spec(spec: &str) -> Option<PackageRef> {
    let spec = spec.trim();
    if spec.is_empty() || spec.starts_with('#') {
        return None;
    }
    let name_end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(spec.len());
    let name = &spec[..name_end];
    if name.is_empty() {
        return None;
    }
    let version = spec[name_end..]
        .strip_prefix("==")
        .map(|v| v.trim().trim_end_matches(',').to_string())
        .filter(|v| !v.is_empty());
    Some(PackageRef {
        name: name.to_string(),
        registry: Registry::Pypi,
        version,
    })
}

/// Parse a known manifest file by its basename.
pub fn parse_manifest(path: &str, content: &str) -> Vec<PackageRef> {
    let basename = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match basename {
        "package.json" => parse_package_json(content),
        "requirements.txt" => parse_requirements_txt(content),
        "pyproject.toml" => parse_pyproject_toml(content),
        _ => Vec::new(),
    }
}

fn parse_package_json(content: &str) -> Vec<PackageRef> {
    let Ok(manifest) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let mut packages = Vec::new();
    for section in ["dependencies", "devDependencies", "optionalDependencies"] {
        let Some(deps) = manifest.get(section).and_then(Value::as_object) else {
            continue;
        };
        for (name, constraint) in deps {
            if name.starts_with('@') {
                continue;
            }
            let version = constraint
                .as_str()
                .map(|v| v.trim_start_matches(['^', '~', '=', 'v']).to_string())
                .filter(|v| {
                    !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.')
                });
            packages.push(PackageRef {
                name: name.clone(),
                registry: Registry::Npm,
                version,
            });
        }
    }
    packages
}

fn parse_requirements_txt(content: &str) -> Vec<PackageRef> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .filter_map(parse_pip_spec)
        .collect()
}

fn parse_pyproject_toml(content: &str) -> Vec<PackageRef> {
    let Ok(manifest) = content.parse::<toml::Table>() else {
        return Vec::new();
    };
    let mut packages = Vec::new();

    // [project] dependencies = ["requests>=2.0", ...]
    if let Some(deps) = manifest
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
    {
        packages.extend(
            deps.iter()
                .filter_map(|d| d.as_str())
                .filter_map(parse_pip_spec),
        );
    }

    // [tool.poetry.dependencies] name = "^1.0"
    if let Some(deps) = manifest
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_table())
    {
        for (name, constraint) in deps {
            if name == "python" {
                continue;
            }
            let version = constraint
                .as_str()
                .map(|v| v.trim_start_matches(['^', '~', '=']).to_string())
                .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.'));
            packages.push(PackageRef {
                name: name.clone(),
                registry: Registry::Pypi,
                version,
            });
        }
    }

    packages
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_npm_install_variants() {
        for command in [
            "npm install left-pad",
            "npm i left-pad",
            "yarn add left-pad",
            "pnpm add left-pad",
        ] {
            let packages = parse_install_command(command);
            assert_eq!(packages.len(), 1, "failed for: {command}");
            assert_eq!(packages[0].name, "left-pad");
            assert_eq!(packages[0].registry, Registry::Npm);
        }
    }

    #[test]
    fn test_npm_versioned_and_flags() {
        let packages = parse_install_command("npm install --save-dev lodash@4.17.21 express");
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "lodash");
        assert_eq!(packages[0].version.as_deref(), Some("4.17.21"));
        assert_eq!(packages[1].name, "express");
        assert!(packages[1].version.is_none());
    }

    #[test]
    fn test_scoped_npm_skipped() {
        let packages = parse_install_command("npm install @myorg/private-pkg public-pkg");
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "public-pkg");
    }

    #[test]
    fn test_pip_install() {
        let packages = parse_install_command("pip install requests==2.31.0 flask");
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "requests");
        assert_eq!(packages[0].version.as_deref(), Some("2.31.0"));
        assert_eq!(packages[0].registry, Registry::Pypi);
        assert_eq!(packages[1].name, "flask");
    }

    #[test]
    fn test_pip_requirements_flag_value_skipped() {
        let packages = parse_install_command("pip install -r requirements.txt requests");
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "requests");
    }

    #[test]
    fn test_compound_command() {
        let packages =
            parse_install_command("cd /tmp && npm install evil-pkg; echo done | cat");
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "evil-pkg");
    }

    #[test]
    fn test_non_install_commands_ignored() {
        assert!(parse_install_command("npm run build").is_empty());
        assert!(parse_install_command("pip freeze").is_empty());
        assert!(parse_install_command("ls -la").is_empty());
    }

    #[test]
    fn test_package_json_manifest() {
        let content = r#"{
            "name": "app",
            "dependencies": {"express": "^4.18.0", "@org/internal": "1.0.0"},
            "devDependencies": {"jest": "29.7.0"}
        }"#;
        let packages = parse_manifest("/repo/package.json", content);
        assert_eq!(packages.len(), 2);
        assert!(packages.iter().any(|p| p.name == "express"
            && p.version.as_deref() == Some("4.18.0")));
        assert!(packages.iter().any(|p| p.name == "jest"));
    }

    #[test]
    fn test_requirements_txt_manifest() {
        let content = "# deps\nrequests==2.31.0\nflask>=2.0\n-r other.txt\n";
        let packages = parse_manifest("requirements.txt", content);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].version.as_deref(), Some("2.31.0"));
        assert!(packages[1].version.is_none());
    }

    #[test]
    fn test_pyproject_manifest() {
        let content = r#"
[project]
name = "app"
dependencies = ["requests>=2.0", "pyyaml==6.0.1"]

[tool.poetry.dependencies]
python = "^3.11"
httpx = "^0.27"
"#;
        let packages = parse_manifest("pyproject.toml", content);
        assert_eq!(packages.len(), 3);
        assert!(packages.iter().any(|p| p.name == "requests"));
        assert!(packages
            .iter()
            .any(|p| p.name == "pyyaml" && p.version.as_deref() == Some("6.0.1")));
        assert!(packages.iter().any(|p| p.name == "httpx"));
        assert!(!packages.iter().any(|p| p.name == "python"));
    }

    #[test]
    fn test_extract_packages_from_write() {
        let packages = extract_packages(
            "Write",
            &json!({
                "file_path": "/repo/package.json",
                "content": r#"{"dependencies": {"axios": "1.6.0"}}"#
            }),
        );
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "axios");
    }

    #[test]
    fn test_cache_key() {
        let package = PackageRef {
            name: "lodash".to_string(),
            registry: Registry::Npm,
            version: Some("4.17.21".to_string()),
        };
        assert_eq!(package.cache_key(), "npm:lodash@4.17.21");
        let unversioned = PackageRef {
            name: "flask".to_string(),
            registry: Registry::Pypi,
            version: None,
        };
        assert_eq!(unversioned.cache_key(), "pypi:flask");
    }
}
