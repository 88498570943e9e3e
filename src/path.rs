//! Helpers for the canonical path form used inside the tree.
//!
//! Canonical paths are absolute, `/`-separated and carry no trailing slash, except the root
//! which is `/` itself.

/// Turn an archive path name into its canonical form.
///
/// One leading `./` is dropped, a leading `/` is added if missing and a single trailing `/`
/// is removed.
pub fn canonicalize(name: &str) -> String {
    let name = name.strip_prefix("./").unwrap_or(name);
    let mut path = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

/// The archive's spelling of a canonical path.
pub fn archive_name(path: &str, absolute: bool) -> String {
    if absolute {
        path.to_string()
    } else {
        path.trim_start_matches('/').to_string()
    }
}

/// Last component of a canonical path. Empty for the root.
pub fn leaf(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Parent directory of a canonical path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Replace the `from` prefix of `path` (which must be `from` itself or lie below it) by `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let rest = if from == "/" {
        &path[1..]
    } else {
        &path[from.len() + 1..]
    };
    join(to, rest)
}

/// Lexically normalize an absolute path, resolving `.` and `..` components and repeated
/// slashes. `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolve the target of the symlink at `link` to a canonical path. Relative targets are
/// taken relative to the directory containing the link.
pub fn resolve_link(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        normalize(target)
    } else {
        normalize(&join(parent(link), target))
    }
}
