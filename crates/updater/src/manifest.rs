use crate::error::{Result, UpdaterError};
use crate::hash::sha256_file;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// File name of the master manifest, both as a release asset and inside a session directory.
pub const MASTER_MANIFEST_FILE: &str = "manifest.json";
/// File name of the per-package manifest stored inside every package archive.
pub const PACKAGE_MANIFEST_FILE: &str = "package-manifest.json";

/// Relative install path (forward slashes) to lowercase hex SHA-256.
pub type FileManifest = BTreeMap<String, String>;

/// Every published version's file list plus the packages leading into each version.
///
/// The manifest only grows: each release adds one `versions` entry and one
/// `packages` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterManifest {
    pub versions: BTreeMap<String, FileManifest>,
    /// Keyed by the version the packages lead *to*.
    pub packages: BTreeMap<String, Vec<Package>>,
}

/// One downloadable edge of the version graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    /// Archive file name, also the release asset name.
    pub file: String,
    /// Archive size in bytes; the edge weight.
    pub size: u64,
    pub from_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchInfo>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PackageKind>,
}

/// Whether a package spans one release or several.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Direct,
    Cumulative,
}

/// Binary delta carried by a package for a single file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchInfo {
    /// Installed file the delta applies to.
    pub file: String,
    /// Delta file inside the package archive.
    pub patch_file: String,
    /// SHA-256 the installed file must have before patching.
    pub old_sha256: String,
}

/// Contents of `package-manifest.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    #[serde(default)]
    pub patch: Option<PatchInfo>,
}

/// One file-level effect of a package on the install directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// A whole file shipped in the archive that replaces (or adds) `path`.
    Replace { path: String },
    /// The target is rebuilt from the installed copy and a delta.
    Patch {
        target: String,
        delta_file: String,
        old_hash: String,
    },
}

impl PackageManifest {
    /// Changes carried by a package whose archive holds `entries`.
    ///
    /// The patch, if any, comes first. The package manifest itself, the
    /// delta file and any whole copy of the patch target are not replacements.
    pub fn changes<I>(&self, entries: I) -> Vec<FileChange>
    where
        I: IntoIterator<Item = String>,
    {
        let mut changes = Vec::new();
        if let Some(info) = &self.patch {
            changes.push(FileChange::Patch {
                target: info.file.clone(),
                delta_file: info.patch_file.clone(),
                old_hash: info.old_sha256.clone(),
            });
        }
        changes.extend(
            entries
                .into_iter()
                .filter(|entry| entry != PACKAGE_MANIFEST_FILE)
                .filter(|entry| {
                    self.patch
                        .as_ref()
                        .map_or(true, |info| *entry != info.patch_file && *entry != info.file)
                })
                .map(|path| FileChange::Replace { path }),
        );
        changes
    }
}

impl MasterManifest {
    /// Read and validate a manifest from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                UpdaterError::manifest(format!("{} not found", path.display()))
            }
            _ => UpdaterError::Io(err),
        })?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: MasterManifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the manifest atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let mut temp = NamedTempFile::new_in(&parent)?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        temp.flush()?;
        temp.persist(path).map_err(|err| UpdaterError::Io(err.error))?;
        Ok(())
    }

    /// Every version referenced by a package must be known, and every path a
    /// package names must stay inside the directory it is joined onto.
    pub fn validate(&self) -> Result<()> {
        for (to_version, packages) in &self.packages {
            if !self.versions.contains_key(to_version) {
                return Err(UpdaterError::manifest(format!(
                    "packages listed for unknown version {to_version}"
                )));
            }
            for package in packages {
                if !is_plain_file_name(&package.file) {
                    return Err(UpdaterError::manifest(format!(
                        "package file {:?} is not a plain file name",
                        package.file
                    )));
                }
                if let Some(patch) = &package.patch {
                    if !is_plain_file_name(&patch.patch_file)
                        || safe_join(Path::new(""), &patch.file).is_none()
                    {
                        return Err(UpdaterError::manifest(format!(
                            "package {} carries an unsafe patch path",
                            package.file
                        )));
                    }
                }
                if !self.versions.contains_key(&package.from_version) {
                    return Err(UpdaterError::manifest(format!(
                        "package {} starts from unknown version {}",
                        package.file, package.from_version
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn version(&self, version: &str) -> Option<&FileManifest> {
        self.versions.get(version)
    }

    /// Package leading from `from` into `to`, if one was published.
    pub fn package(&self, from: &str, to: &str) -> Option<&Package> {
        self.packages
            .get(to)?
            .iter()
            .find(|package| package.from_version == from)
    }
}

/// Hash every file under `root`, skipping paths that start with `exclude_prefix`.
pub fn build_file_manifest(root: &Path, exclude_prefix: Option<&str>) -> Result<FileManifest> {
    let mut manifest = FileManifest::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| {
            UpdaterError::Io(
                err.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| UpdaterError::validation("walked outside of the build directory"))?;
        let key = relative_key(relative);
        if exclude_prefix.is_some_and(|prefix| !prefix.is_empty() && key.starts_with(prefix)) {
            continue;
        }
        manifest.insert(key, sha256_file(entry.path())?);
    }
    Ok(manifest)
}

/// Forward-slash form of a relative path, used as a manifest key.
pub fn relative_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files that are new in `to` or whose hash differs from `from`.
pub fn changed_files(from: &FileManifest, to: &FileManifest) -> Vec<String> {
    to.iter()
        .filter(|(path, hash)| from.get(*path) != Some(*hash))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Files present in `from` but absent from `to`.
pub fn removed_files(from: &FileManifest, to: &FileManifest) -> Vec<String> {
    from.keys()
        .filter(|path| !to.contains_key(*path))
        .cloned()
        .collect()
}

/// Whether `name` is a single normal path component, such as `update-v1-to-v2.zip`.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Join a manifest key onto `root`, refusing anything that would escape it.
pub fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty() {
        return None;
    }
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MANIFEST_JSON: &str = r#"{
        "versions": {
            "v1": { "a.bin": "h1" },
            "v2": { "a.bin": "h2", "b.txt": "h3" }
        },
        "packages": {
            "v1": [],
            "v2": [
                {
                    "file": "update-v1-to-v2.zip",
                    "size": 42,
                    "from_version": "v1",
                    "patch": { "file": "a.bin", "patch_file": "a.bin-v1-to-v2.patch", "old_sha256": "h1" },
                    "type": "direct"
                }
            ]
        }
    }"#;

    #[test]
    fn parses_published_format() {
        let manifest = MasterManifest::from_slice(MANIFEST_JSON.as_bytes()).unwrap();
        let package = manifest.package("v1", "v2").expect("edge v1->v2");
        assert_eq!(package.size, 42);
        assert_eq!(package.kind, Some(PackageKind::Direct));
        assert_eq!(package.patch.as_ref().unwrap().old_sha256, "h1");
        assert!(manifest.package("v2", "v1").is_none());
    }

    #[test]
    fn rejects_edges_to_unknown_versions() {
        let json = r#"{
            "versions": { "v2": {} },
            "packages": { "v2": [ { "file": "x.zip", "size": 1, "from_version": "v1" } ] }
        }"#;
        let err = MasterManifest::from_slice(json.as_bytes()).unwrap_err();
        assert!(matches!(err, UpdaterError::Manifest(_)));
    }

    #[test]
    fn package_manifest_accepts_null_and_missing_patch() {
        let null: PackageManifest = serde_json::from_str(r#"{"patch": null}"#).unwrap();
        let empty: PackageManifest = serde_json::from_str("{}").unwrap();
        assert_eq!(null, PackageManifest::default());
        assert_eq!(empty, PackageManifest::default());
        assert_eq!(
            empty.changes(vec![PACKAGE_MANIFEST_FILE.to_string(), "b.txt".to_string()]),
            vec![FileChange::Replace {
                path: "b.txt".into()
            }]
        );
    }

    #[test]
    fn patched_package_lists_the_patch_first() {
        let patched: PackageManifest = serde_json::from_str(
            r#"{"patch": {"file": "main.exe", "patch_file": "p", "old_sha256": "abc"}}"#,
        )
        .unwrap();
        let entries = ["docs/readme.txt", "p", "main.exe", PACKAGE_MANIFEST_FILE]
            .into_iter()
            .map(String::from);
        assert_eq!(
            patched.changes(entries),
            vec![
                FileChange::Patch {
                    target: "main.exe".into(),
                    delta_file: "p".into(),
                    old_hash: "abc".into(),
                },
                FileChange::Replace {
                    path: "docs/readme.txt".into()
                },
            ]
        );
    }

    #[test]
    fn rejects_package_names_that_leave_the_session() {
        for file in ["../escaped.zip", "/tmp/escaped.zip", "nested/update.zip", ".."] {
            let json = format!(
                r#"{{
                    "versions": {{ "v1": {{}}, "v2": {{}} }},
                    "packages": {{ "v2": [ {{ "file": {file:?}, "size": 5, "from_version": "v1" }} ] }}
                }}"#
            );
            let err = MasterManifest::from_slice(json.as_bytes()).unwrap_err();
            assert!(matches!(err, UpdaterError::Manifest(_)), "{file} accepted");
        }
    }

    #[test]
    fn rejects_unsafe_patch_paths() {
        let json = r#"{
            "versions": { "v1": {}, "v2": {} },
            "packages": { "v2": [ {
                "file": "update-v1-to-v2.zip", "size": 5, "from_version": "v1",
                "patch": { "file": "bin/app", "patch_file": "../app.patch", "old_sha256": "h" }
            } ] }
        }"#;
        assert!(MasterManifest::from_slice(json.as_bytes()).is_err());

        let nested_target = json.replace("../app.patch", "app.patch");
        assert!(MasterManifest::from_slice(nested_target.as_bytes()).is_ok());
        let escaping_target = nested_target.replace("bin/app", "../bin/app");
        assert!(MasterManifest::from_slice(escaping_target.as_bytes()).is_err());
    }

    #[test]
    fn file_manifest_excludes_vendor_prefix() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("torch/lib")).unwrap();
        fs::create_dir_all(dir.path().join("app/ui")).unwrap();
        fs::write(dir.path().join("torch/lib/big.dll"), b"vendor").unwrap();
        fs::write(dir.path().join("app/ui/style.qss"), b"style").unwrap();
        fs::write(dir.path().join("main.exe"), b"exe").unwrap();

        let manifest = build_file_manifest(dir.path(), Some("torch/")).unwrap();
        let keys: Vec<_> = manifest.keys().cloned().collect();
        assert_eq!(keys, vec!["app/ui/style.qss", "main.exe"]);
        assert_eq!(manifest["main.exe"], crate::hash::sha256_bytes(b"exe"));
    }

    #[test]
    fn diffing_file_manifests() {
        let from: FileManifest = [("a", "1"), ("b", "2"), ("c", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let to: FileManifest = [("a", "1"), ("b", "9"), ("d", "4")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert_eq!(changed_files(&from, &to), vec!["b", "d"]);
        assert_eq!(removed_files(&from, &to), vec!["c"]);
    }

    #[test]
    fn safe_join_refuses_escapes() {
        let root = Path::new("/install");
        assert_eq!(safe_join(root, "a/b.txt"), Some(PathBuf::from("/install/a/b.txt")));
        assert_eq!(safe_join(root, "../etc/passwd"), None);
        assert_eq!(safe_join(root, "/etc/passwd"), None);
        assert_eq!(safe_join(root, ""), None);
    }

    #[test]
    fn save_then_load_keeps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = MasterManifest::from_slice(MANIFEST_JSON.as_bytes()).unwrap();
        manifest.save(&path).unwrap();
        assert_eq!(MasterManifest::load(&path).unwrap(), manifest);
    }
}
