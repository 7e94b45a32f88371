use crate::core::interfaces::VirtualSystem;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Probe order favors TypeScript sources over their emitted siblings.
const EXTENSIONS: [&str; 8] = [".ts", ".tsx", ".d.ts", ".js", ".jsx", ".json", ".mjs", ".cjs"];
const INDEX_FILES: [&str; 6] = [
    "index.ts",
    "index.tsx",
    "index.d.ts",
    "index.js",
    "index.jsx",
    "index.json",
];

/// The package.json fields resolution looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageJson {
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub browser: Option<BrowserField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BrowserField {
    Entry(String),
    Replacements(HashMap<String, serde_json::Value>),
}

/// A successful resolution; `package` is set when the file lives under
/// `node_modules`.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub path: PathBuf,
    pub package: Option<String>,
}

/// Node.js-style module resolution over the virtual filesystem.
pub struct NodeModuleResolver {
    system: Arc<dyn VirtualSystem>,
    browser: bool,
    package_cache: Mutex<HashMap<PathBuf, Option<PackageJson>>>,
}

impl NodeModuleResolver {
    pub fn new(system: Arc<dyn VirtualSystem>, browser: bool) -> Self {
        Self {
            system,
            browser,
            package_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_bare(specifier: &str) -> bool {
        !specifier.starts_with("./") && !specifier.starts_with("../") && !specifier.starts_with('/')
    }

    pub async fn resolve(&self, specifier: &str, importer: &Path) -> Option<Resolution> {
        if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = importer.parent()?;
            let joined = self.system.resolve_path(&dir.join(specifier));
            return self
                .resolve_file_or_directory(&joined)
                .await
                .map(|path| Resolution {
                    path,
                    package: None,
                });
        }

        if specifier.starts_with('/') {
            return self
                .resolve_file_or_directory(Path::new(specifier))
                .await
                .map(|path| Resolution {
                    path,
                    package: None,
                });
        }

        self.resolve_node_module(specifier, importer).await
    }

    /// Walks `node_modules` directories upward from the importer.
    async fn resolve_node_module(&self, specifier: &str, importer: &Path) -> Option<Resolution> {
        let (package, subpath) = parse_package_specifier(specifier);
        let mut dir = importer.parent()?;

        loop {
            let package_dir = dir.join("node_modules").join(&package);
            if self.system.is_dir(&package_dir).await {
                if let Some(path) = self
                    .resolve_package_entry(&package_dir, subpath.as_deref())
                    .await
                {
                    return Some(Resolution {
                        path,
                        package: Some(package),
                    });
                }
            }
            dir = dir.parent()?;
        }
    }

    async fn resolve_package_entry(
        &self,
        package_dir: &Path,
        subpath: Option<&str>,
    ) -> Option<PathBuf> {
        if let Some(subpath) = subpath {
            return self
                .resolve_file_or_directory(&package_dir.join(subpath))
                .await;
        }

        let package_json = self.read_package_json(&package_dir.join("package.json")).await;
        if let Some(pkg) = package_json {
            if self.browser {
                if let Some(BrowserField::Entry(entry)) = &pkg.browser {
                    if let Some(found) = self.resolve_as_file(&package_dir.join(entry)).await {
                        return Some(found);
                    }
                }
            }
            for field in [&pkg.types, &pkg.module, &pkg.main].into_iter().flatten() {
                if let Some(found) = self
                    .resolve_file_or_directory(&package_dir.join(field))
                    .await
                {
                    return Some(found);
                }
            }
        }
        self.resolve_index(package_dir).await
    }

    async fn resolve_file_or_directory(&self, path: &Path) -> Option<PathBuf> {
        if let Some(file) = self.resolve_as_file(path).await {
            return Some(file);
        }
        if !self.system.is_dir(path).await {
            return None;
        }
        if let Some(pkg) = self.read_package_json(&path.join("package.json")).await {
            for field in [&pkg.types, &pkg.module, &pkg.main].into_iter().flatten() {
                if let Some(found) = self.resolve_as_file(&path.join(field)).await {
                    return Some(found);
                }
            }
        }
        self.resolve_index(path).await
    }

    async fn resolve_index(&self, dir: &Path) -> Option<PathBuf> {
        for index in INDEX_FILES {
            let candidate = dir.join(index);
            if self.system.is_file(&candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    async fn resolve_as_file(&self, path: &Path) -> Option<PathBuf> {
        if self.system.is_file(path).await {
            return Some(path.to_path_buf());
        }
        let raw = path.to_str()?;
        for ext in EXTENSIONS {
            let candidate = PathBuf::from(format!("{}{}", raw, ext));
            if self.system.is_file(&candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    async fn read_package_json(&self, path: &Path) -> Option<PackageJson> {
        if let Some(cached) = self.package_cache.lock().get(path) {
            return cached.clone();
        }
        let parsed = match self.system.read(path).await {
            Ok(text) => serde_json::from_str::<PackageJson>(&text).ok(),
            Err(_) => None,
        };
        self.package_cache
            .lock()
            .insert(path.to_path_buf(), parsed.clone());
        parsed
    }
}

/// Splits `@scope/pkg/sub/path` into the package name and the subpath.
fn parse_package_specifier(specifier: &str) -> (String, Option<String>) {
    let segments: Vec<&str> = specifier.splitn(3, '/').collect();
    if specifier.starts_with('@') {
        match segments.as_slice() {
            [scope, name] => (format!("{}/{}", scope, name), None),
            [scope, name, rest] => (format!("{}/{}", scope, name), Some(rest.to_string())),
            _ => (specifier.to_string(), None),
        }
    } else {
        match specifier.split_once('/') {
            Some((name, rest)) => (name.to_string(), Some(rest.to_string())),
            None => (specifier.to_string(), None),
        }
    }
}
