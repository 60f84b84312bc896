//! Client path handling for the federated namespace
//!
//! Every path entering the router is normalized once; the mount table and
//! the order strategies only ever see canonical absolute paths.

use fedns_common::{FedNsError, Result, MAX_PATH_LEN, PATH_SEPARATOR, ROOT_PATH};

/// Normalize a client path: absolute, no empty segments, no trailing slash
/// except for the root. `.` and `..` segments are rejected rather than
/// resolved, since the router never touches subcluster directory state.
pub fn normalize(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(FedNsError::InvalidPath("empty path".into()));
    }
    if !path.starts_with(PATH_SEPARATOR) {
        return Err(FedNsError::InvalidPath(format!("{} is not absolute", path)));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(FedNsError::InvalidPath(format!(
            "path exceeds {} bytes", MAX_PATH_LEN
        )));
    }

    let mut normalized = String::with_capacity(path.len());
    for segment in path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(FedNsError::InvalidPath(format!(
                "{} contains relative segment {}", path, segment
            )));
        }
        normalized.push(PATH_SEPARATOR);
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push_str(ROOT_PATH);
    }
    Ok(normalized)
}

/// Whether `prefix` covers `path` on whole segments (`/a/b` covers `/a/b/c`, not `/a/bc`)
pub fn is_segment_prefix(prefix: &str, path: &str) -> bool {
    if prefix == ROOT_PATH {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(PATH_SEPARATOR),
        None => false,
    }
}

/// The part of `path` below `mount`, either empty or starting with `/`
pub fn relative<'a>(mount: &str, path: &'a str) -> &'a str {
    if mount == ROOT_PATH {
        if path == ROOT_PATH { "" } else { path }
    } else {
        path.get(mount.len()..).unwrap_or("")
    }
}

/// Replace the `mount` prefix of `path` with `dest_root`
pub fn substitute(mount: &str, dest_root: &str, path: &str) -> String {
    let rest = relative(mount, path);
    if dest_root == ROOT_PATH {
        if rest.is_empty() {
            ROOT_PATH.to_string()
        } else {
            rest.to_string()
        }
    } else {
        format!("{}{}", dest_root, rest)
    }
}

/// First segment of `path` below `mount`, if `path` is deeper than the mount
pub fn first_component_under<'a>(mount: &str, path: &'a str) -> Option<&'a str> {
    relative(mount, path)
        .split(PATH_SEPARATOR)
        .find(|s| !s.is_empty())
}

/// `path` followed by each of its ancestors up to and including the root
pub fn ancestors<'a>(path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current == ROOT_PATH {
            None
        } else {
            match current.rfind(PATH_SEPARATOR) {
                Some(0) => Some(ROOT_PATH),
                Some(idx) => Some(&current[..idx]),
                None => None,
            }
        };
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("//").unwrap(), "/");
        assert_eq!(normalize("/tmp/").unwrap(), "/tmp");
        assert_eq!(normalize("/tmp//a///b").unwrap(), "/tmp/a/b");
        assert!(normalize("").is_err());
        assert!(normalize("tmp/file").is_err());
        assert!(normalize("/tmp/../etc").is_err());
        assert!(normalize("/tmp/./file").is_err());
    }

    #[test]
    fn test_segment_prefix() {
        assert!(is_segment_prefix("/a/b", "/a/b"));
        assert!(is_segment_prefix("/a/b", "/a/b/c"));
        assert!(!is_segment_prefix("/a/b", "/a/bc"));
        assert!(!is_segment_prefix("/tmp", "/tmp-ns1/file"));
        assert!(is_segment_prefix("/", "/anything"));
    }

    #[test]
    fn test_substitute() {
        assert_eq!(substitute("/a", "/x", "/a"), "/x");
        assert_eq!(substitute("/a", "/x", "/a/b/c"), "/x/b/c");
        assert_eq!(substitute("/a", "/", "/a/b"), "/b");
        assert_eq!(substitute("/a", "/", "/a"), "/");
        assert_eq!(substitute("/", "/", "/tmp/file"), "/tmp/file");
        assert_eq!(substitute("/", "/data", "/tmp/file"), "/data/tmp/file");
        assert_eq!(substitute("/", "/data", "/"), "/data");
    }

    #[test]
    fn test_first_component_under() {
        assert_eq!(first_component_under("/m", "/m/dir/file"), Some("dir"));
        assert_eq!(first_component_under("/m", "/m"), None);
        assert_eq!(first_component_under("/", "/top/x"), Some("top"));
    }

    #[test]
    fn test_ancestors() {
        let all: Vec<&str> = ancestors("/a/b/c").collect();
        assert_eq!(all, vec!["/a/b/c", "/a/b", "/a", "/"]);
        let root: Vec<&str> = ancestors("/").collect();
        assert_eq!(root, vec!["/"]);
    }
}
