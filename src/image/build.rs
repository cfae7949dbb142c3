//! Build specifications for the images the pipeline produces

use super::reference::ImageRef;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default build file name
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Never hashed into a content tag
const ALWAYS_IGNORED: &[&str] = &[".git"];

/// Ignore file read from the root of the build context
pub const DOCKERIGNORE: &str = ".dockerignore";

/// One image to build and publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Manifest service the image belongs to
    pub service: String,
    /// Build context directory
    pub context: PathBuf,
    /// Build file, relative to the context
    pub dockerfile: PathBuf,
    /// Reference the image is tagged and published as
    pub image: ImageRef,
}

impl BuildSpec {
    /// Create a new build spec with the default build file
    pub fn new(service: &str, context: impl Into<PathBuf>, image: ImageRef) -> Self {
        Self {
            service: service.to_string(),
            context: context.into(),
            dockerfile: PathBuf::from(DEFAULT_DOCKERFILE),
            image,
        }
    }

    /// Set the build file
    pub fn dockerfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.dockerfile = path.into();
        self
    }

    /// Path of the build file on disk
    pub fn dockerfile_path(&self) -> PathBuf {
        if self.dockerfile.is_absolute() {
            self.dockerfile.clone()
        } else {
            self.context.join(&self.dockerfile)
        }
    }
}

/// Entries of `.dockerignore` the builder never sees
///
/// Only literal paths and `**/name` patterns are honoured; anything else
/// is hashed anyway. A file with `!` exceptions is ignored altogether.
/// Hashing too much costs a rebuild, hashing too little reuses a tag.
#[derive(Debug, Default)]
struct Exclusions {
    paths: HashSet<PathBuf>,
    names: HashSet<String>,
}

impl Exclusions {
    fn load(context: &Path) -> Result<Self> {
        let mut exclusions = Self {
            names: ALWAYS_IGNORED.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        };
        let path = context.join(DOCKERIGNORE);
        if !path.is_file() {
            return Ok(exclusions);
        }

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if lines.iter().any(|l| l.starts_with('!')) {
            debug!("{} has exceptions; hashing the whole context", path.display());
            return Ok(exclusions);
        }

        for line in lines {
            let line = line.trim_start_matches("./").trim_matches('/');
            if line.contains(['*', '?', '[']) {
                match line.strip_prefix("**/") {
                    Some(name) if !name.contains(['*', '?', '[', '/']) => {
                        exclusions.names.insert(name.to_string());
                    }
                    _ => debug!("Not honouring ignore pattern '{}'", line),
                }
            } else if !line.is_empty() {
                exclusions.paths.insert(PathBuf::from(line));
            }
        }
        Ok(exclusions)
    }

    fn excludes(&self, relative: &Path) -> bool {
        self.paths.contains(relative)
            || relative
                .file_name()
                .is_some_and(|name| self.names.contains(name.to_string_lossy().as_ref()))
    }
}

/// Short content hash of everything a build reads
///
/// Context files are visited in sorted order and both relative path and
/// contents feed the hash, so renames change the tag too. The build file
/// is hashed as well since it may live outside the context.
pub fn content_tag(spec: &BuildSpec) -> Result<String> {
    let context = spec.context.as_path();
    let exclusions = Exclusions::load(context)?;
    let mut hasher = Sha256::new();

    let walker = walkdir::WalkDir::new(context)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !exclusions.excludes(e.path().strip_prefix(context).unwrap_or(e.path()))
        });

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(context).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(entry.path())?);
    }

    hasher.update(b"\0dockerfile\0");
    hasher.update(std::fs::read(spec.dockerfile_path())?);

    let hex = format!("{:x}", hasher.finalize());
    Ok(format!("c-{}", &hex[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dockerfile_path() {
        let spec = BuildSpec::new("api", "/src/backend", ImageRef::parse("user/api").unwrap());
        assert_eq!(spec.dockerfile_path(), PathBuf::from("/src/backend/Dockerfile"));

        let spec = spec.dockerfile("/ci/Dockerfile.api");
        assert_eq!(spec.dockerfile_path(), PathBuf::from("/ci/Dockerfile.api"));
    }

    fn spec(context: &Path) -> BuildSpec {
        BuildSpec::new("api", context, ImageRef::parse("user/api").unwrap())
    }

    #[test]
    fn test_content_tag_tracks_changes() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "FROM node:20\n").unwrap();
        std::fs::write(temp.path().join("server.js"), "console.log(1)\n").unwrap();

        let first = content_tag(&spec(temp.path())).unwrap();
        assert!(first.starts_with("c-"));
        assert_eq!(first.len(), 14);
        assert_eq!(first, content_tag(&spec(temp.path())).unwrap());

        std::fs::write(temp.path().join("server.js"), "console.log(2)\n").unwrap();
        assert_ne!(first, content_tag(&spec(temp.path())).unwrap());
    }

    #[test]
    fn test_content_tag_covers_build_output_dirs() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "FROM nginx\nCOPY dist /html\n").unwrap();
        std::fs::create_dir(temp.path().join("dist")).unwrap();
        std::fs::write(temp.path().join("dist").join("app.js"), "v1").unwrap();
        let before = content_tag(&spec(temp.path())).unwrap();

        std::fs::write(temp.path().join("dist").join("app.js"), "v2").unwrap();
        assert_ne!(before, content_tag(&spec(temp.path())).unwrap());
    }

    #[test]
    fn test_content_tag_covers_external_dockerfile() {
        let context = tempdir().unwrap();
        let ci = tempdir().unwrap();
        std::fs::write(context.path().join("server.js"), "console.log(1)\n").unwrap();
        let dockerfile = ci.path().join("Dockerfile.api");
        std::fs::write(&dockerfile, "FROM node:20\n").unwrap();

        let spec = spec(context.path()).dockerfile(&dockerfile);
        let before = content_tag(&spec).unwrap();

        std::fs::write(&dockerfile, "FROM node:22\n").unwrap();
        assert_ne!(before, content_tag(&spec).unwrap());
    }

    #[test]
    fn test_content_tag_skips_dockerignored_paths() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "FROM node:20\n").unwrap();
        std::fs::write(temp.path().join("index.js"), "module.exports = {}\n").unwrap();
        let ignore = "node_modules\n**/coverage\n*.log\n";
        std::fs::write(temp.path().join(DOCKERIGNORE), ignore).unwrap();
        let before = content_tag(&spec(temp.path())).unwrap();

        let modules = temp.path().join("node_modules").join("left-pad");
        std::fs::create_dir_all(&modules).unwrap();
        std::fs::write(modules.join("index.js"), "x").unwrap();
        let coverage = temp.path().join("lib").join("coverage");
        std::fs::create_dir_all(&coverage).unwrap();
        std::fs::write(coverage.join("lcov.info"), "x").unwrap();
        assert_eq!(before, content_tag(&spec(temp.path())).unwrap());

        // wildcard patterns other than **/name are hashed anyway
        std::fs::write(temp.path().join("npm.log"), "x").unwrap();
        assert_ne!(before, content_tag(&spec(temp.path())).unwrap());
    }

    #[test]
    fn test_content_tag_ignores_nothing_with_exceptions() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "FROM node:20\n").unwrap();
        std::fs::write(temp.path().join(DOCKERIGNORE), "build\n!build/keep.js\n").unwrap();
        let before = content_tag(&spec(temp.path())).unwrap();

        std::fs::create_dir(temp.path().join("build")).unwrap();
        std::fs::write(temp.path().join("build").join("keep.js"), "x").unwrap();
        assert_ne!(before, content_tag(&spec(temp.path())).unwrap());
    }
}
