//! Filesystem requests served directly on the control channel: `list_tree`,
//! `fstat`, `create_symlink`, `mkdir`.
//!
//! Entries report the full mode bits, size, mtime, and symlink targets;
//! symlinks are never followed and always report `is_dir = false`. Relative
//! paths resolve against the home directory, except `fstat`, which rejects
//! them outright.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Value};

use crate::wire::{Request, Response, Status};

/// One filesystem entry as reported to the server.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_symlink: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

/// `lstat` one path into an [`Entry`]. Requires an absolute path.
pub fn fstat(path: &Path) -> Result<Entry> {
    if !path.is_absolute() {
        bail!("absolute path required: {}", path.display());
    }

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return Ok(Entry {
            exists: false,
            path: None,
            perm: None,
            size: None,
            mtime: None,
            is_dir: None,
            is_symlink: None,
            link_target: None,
        });
    };

    let is_symlink = meta.file_type().is_symlink();
    let (is_dir, link_target) = if is_symlink {
        let target = std::fs::read_link(path)
            .ok()
            .map(|t| t.to_string_lossy().into_owned());
        (false, target)
    } else {
        (meta.is_dir(), None)
    };

    Ok(Entry {
        exists: true,
        path: Some(path.to_string_lossy().into_owned()),
        perm: Some(meta.permissions().mode()),
        size: Some(meta.len()),
        mtime: Some(meta.mtime()),
        is_dir: Some(is_dir),
        is_symlink: Some(is_symlink),
        link_target,
    })
}

/// Recursively list `path`: the root entry first, then per directory its
/// files, then its subdirectories, descending depth-first. Symlinked
/// directories are reported but not descended into.
pub fn list_tree(path: &Path) -> Result<Vec<Entry>> {
    if !path.exists() {
        bail!("no such file or directory: {}", path.display());
    }
    let mut entries = vec![fstat(path)?];
    if path.is_dir() && !std::fs::symlink_metadata(path)?.file_type().is_symlink() {
        walk(path, &mut entries);
    }
    Ok(entries)
}

fn walk(dir: &Path, entries: &mut Vec<Entry>) {
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in read.flatten() {
        let path = entry.path();
        let is_real_dir = std::fs::symlink_metadata(&path)
            .map(|m| m.is_dir() && !m.file_type().is_symlink())
            .unwrap_or(false);
        if is_real_dir {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }
    files.sort();
    dirs.sort();

    for file in &files {
        match fstat(file) {
            Ok(entry) => entries.push(entry),
            Err(err) => log::warn!("list_tree: {err}"),
        }
    }
    for sub in &dirs {
        match fstat(sub) {
            Ok(entry) => entries.push(entry),
            Err(err) => log::warn!("list_tree: {err}"),
        }
    }
    for sub in &dirs {
        walk(sub, entries);
    }
}

/// Resolve a request path against the home directory, expanding `~`.
fn resolve(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path).into_owned();
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(path)
    }
}

pub fn handle_list_tree(request: &Request) -> Response {
    let Some(path) = request.payload.get("path").and_then(Value::as_str) else {
        return Response::error(request, "missing path");
    };
    match list_tree(&resolve(path)) {
        Ok(entries) => Response::to(
            request,
            Status::Success,
            serde_json::to_value(entries).unwrap_or(Value::Null),
        ),
        Err(err) => Response::error(request, err.to_string()),
    }
}

pub fn handle_fstat(request: &Request) -> Response {
    let Some(path) = request.payload.get("path").and_then(Value::as_str) else {
        return Response::error(request, "missing path");
    };
    match fstat(Path::new(path)) {
        Ok(entry) => Response::to(
            request,
            Status::Success,
            serde_json::to_value(entry).unwrap_or(Value::Null),
        ),
        Err(err) => Response::error(request, err.to_string()),
    }
}

pub fn handle_create_symlink(request: &Request) -> Response {
    let (Some(target), Some(dest)) = (
        request.payload.get("target").and_then(Value::as_str),
        request.payload.get("dest").and_then(Value::as_str),
    ) else {
        return Response::error(request, "missing target or dest");
    };
    match create_symlink(target, &resolve(dest)) {
        Ok(()) => Response::to(request, Status::Success, Value::Null),
        Err(err) => Response::error(request, err.to_string()),
    }
}

fn create_symlink(target: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if dest.exists() || std::fs::symlink_metadata(dest).is_ok() {
        std::fs::remove_file(dest)?;
    }
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

pub fn handle_mkdir(request: &Request) -> Response {
    let Some(path) = request.payload.get("path").and_then(Value::as_str) else {
        return Response::error(request, "missing path");
    };
    let Some(perm) = request.payload.get("perm").and_then(Value::as_u64) else {
        return Response::error(request, "missing perm");
    };
    match mkdir(&resolve(path), perm as u32) {
        Ok(()) => Response::to(request, Status::Success, Value::Null),
        Err(err) => Response::error(request, err.to_string()),
    }
}

fn mkdir(path: &Path, perm: u32) -> Result<()> {
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, payload: Value) -> Request {
        Request {
            rid: "r".into(),
            timeout: 60,
            name: name.into(),
            payload,
        }
    }

    #[test]
    fn fstat_rejects_relative_path() {
        assert!(fstat(Path::new("relative/path")).is_err());
        let resp = handle_fstat(&request("fstat", json!({"path": "relative/path"})));
        assert_eq!(resp.status, Status::Failed);
    }

    #[test]
    fn fstat_missing_path_reports_not_exists() {
        let entry = fstat(Path::new("/definitely/not/here/xyz")).unwrap();
        assert!(!entry.exists);
        assert!(entry.perm.is_none());
    }

    #[test]
    fn fstat_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let entry = fstat(&path).unwrap();
        assert!(entry.exists);
        assert_eq!(entry.size, Some(5));
        assert_eq!(entry.is_dir, Some(false));
        assert_eq!(entry.is_symlink, Some(false));
        assert!(entry.mtime.unwrap() > 0);
    }

    #[test]
    fn fstat_symlink_reports_target_and_not_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&sub, &link).unwrap();

        let entry = fstat(&link).unwrap();
        assert_eq!(entry.is_symlink, Some(true));
        assert_eq!(entry.is_dir, Some(false));
        assert_eq!(
            entry.link_target.as_deref(),
            Some(sub.to_str().unwrap())
        );
    }

    #[test]
    fn list_tree_covers_root_and_descendants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b.txt"), b"b").unwrap();

        let entries = list_tree(dir.path()).unwrap();
        let paths: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.path.as_deref())
            .collect();
        // Root first, then files before dirs, then descent.
        assert_eq!(paths[0], dir.path().to_str().unwrap());
        assert!(paths.contains(&dir.path().join("a.txt").to_str().unwrap()));
        assert!(paths.contains(&sub.to_str().unwrap()));
        assert!(paths.contains(&sub.join("b.txt").to_str().unwrap()));
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn list_tree_missing_root_fails() {
        let resp = handle_list_tree(&request("list_tree", json!({"path": "/nope/nothing"})));
        assert_eq!(resp.status, Status::Failed);
    }

    #[test]
    fn create_symlink_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("deep/nested/link");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let resp = handle_create_symlink(&request(
            "create_symlink",
            json!({"target": "/etc/hostname", "dest": dest.to_str().unwrap()}),
        ));
        assert_eq!(resp.status, Status::Success);
        let meta = std::fs::symlink_metadata(&dest).unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn mkdir_applies_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("made/here");
        let resp = handle_mkdir(&request(
            "mkdir",
            json!({"path": path.to_str().unwrap(), "perm": 0o750}),
        ));
        assert_eq!(resp.status, Status::Success);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
