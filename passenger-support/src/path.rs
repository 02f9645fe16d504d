// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Path manipulation helpers working on strings rather than `Path`, so that the results can be
//! sent to the core verbatim.

use nix::errno::Errno;
use std::fmt::{Display, Formatter};
use std::io;

/// Error produced when a path cannot be made absolute
#[derive(Debug)]
pub struct PathResolutionError {
    path: String,
    source: io::Error,
}

impl PathResolutionError {
    /// The path that failed to resolve
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Display for PathResolutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cannot resolve path '{}': unable to determine the current working directory: {}",
            self.path, self.source
        )
    }
}

impl std::error::Error for PathResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Turns `path` into an absolute path, resolving it relative to `working_dir` if necessary.
///
/// An empty `working_dir` stands for the current working directory. Duplicate slashes, `.` and
/// `..` segments are collapsed, `..` never leaves the root directory. The result has no trailing
/// slash unless it is the root directory.
pub fn absolutize_path(path: &str, working_dir: &str) -> Result<String, PathResolutionError> {
    let base = if path.starts_with('/') {
        String::new()
    } else if working_dir.is_empty() {
        let cwd = std::env::current_dir().map_err(|source| PathResolutionError {
            path: path.to_owned(),
            source,
        })?;
        cwd.to_string_lossy().into_owned()
    } else if working_dir.starts_with('/') {
        working_dir.to_owned()
    } else {
        absolutize_path(working_dir, "")?
    };

    let mut segments = Vec::new();
    for segment in base.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    if segments.is_empty() {
        Ok("/".to_owned())
    } else {
        let mut result = String::with_capacity(base.len() + path.len() + 1);
        for segment in segments {
            result.push('/');
            result.push_str(segment);
        }
        Ok(result)
    }
}

/// Resolves a symlink by one level.
///
/// Paths that aren’t symlinks are returned unchanged. A relative symlink target is resolved
/// against the directory containing the symlink, no normalization is applied to it.
pub fn resolve_symlink(path: &str) -> io::Result<String> {
    match std::fs::read_link(path) {
        Ok(target) => {
            let target = target.to_string_lossy();
            if target.starts_with('/') {
                Ok(target.into_owned())
            } else {
                let dir = extract_dir_name_static(path);
                if dir == "/" {
                    Ok(format!("/{target}"))
                } else {
                    Ok(format!("{dir}/{target}"))
                }
            }
        }
        Err(err) if err.raw_os_error() == Some(Errno::EINVAL as i32) => Ok(path.to_owned()),
        Err(err) => Err(err),
    }
}

/// Returns the directory part of `path` without allocating.
///
/// Follows `dirname()` semantics: trailing slashes are ignored, `"."` is returned for paths without
/// a slash and `"/"` for paths directly below the root directory.
pub fn extract_dir_name_static(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }

    match trimmed.rfind('/') {
        None => ".",
        Some(pos) => {
            let dir = trimmed[..pos].trim_end_matches('/');
            if dir.is_empty() {
                "/"
            } else {
                dir
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn absolutize() {
        assert_eq!(absolutize_path("/a/b/c", "/ignored").unwrap(), "/a/b/c");
        assert_eq!(absolutize_path("b/c", "/a").unwrap(), "/a/b/c");
        assert_eq!(absolutize_path("b//c/./d/", "/a/").unwrap(), "/a/b/c/d");
        assert_eq!(absolutize_path("../../x", "/a/b/c").unwrap(), "/a/x");
        assert_eq!(absolutize_path("../../../../x", "/a").unwrap(), "/x");
        assert_eq!(absolutize_path("..", "/").unwrap(), "/");
        assert_eq!(absolutize_path("/", "").unwrap(), "/");

        let cwd = std::env::current_dir().unwrap();
        let expected = cwd.join("file");
        assert_eq!(
            absolutize_path("file", "").unwrap(),
            expected.to_string_lossy()
        );
        assert_eq!(
            absolutize_path("file", ".").unwrap(),
            expected.to_string_lossy()
        );
    }

    #[test]
    fn dir_name() {
        assert_eq!(extract_dir_name_static(""), ".");
        assert_eq!(extract_dir_name_static("file"), ".");
        assert_eq!(extract_dir_name_static("/"), "/");
        assert_eq!(extract_dir_name_static("///"), "/");
        assert_eq!(extract_dir_name_static("/file"), "/");
        assert_eq!(extract_dir_name_static("/srv/app/public"), "/srv/app");
        assert_eq!(extract_dir_name_static("/srv/app/public/"), "/srv/app");
        assert_eq!(extract_dir_name_static("/srv//app"), "/srv");
        assert_eq!(extract_dir_name_static("a/b"), "a");
    }

    #[test]
    fn symlinks() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path().to_string_lossy().into_owned();

        let target = format!("{dir}/target");
        std::fs::create_dir(&target).unwrap();
        assert_eq!(resolve_symlink(&target).unwrap(), target);

        let absolute = format!("{dir}/absolute");
        symlink(&target, &absolute).unwrap();
        assert_eq!(resolve_symlink(&absolute).unwrap(), target);

        let relative = format!("{dir}/relative");
        symlink("target", &relative).unwrap();
        assert_eq!(resolve_symlink(&relative).unwrap(), target);

        let missing = format!("{dir}/missing");
        assert!(resolve_symlink(&missing).is_err());
    }
}
