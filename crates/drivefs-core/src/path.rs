//! Drive-relative path helpers.
//!
//! Drive paths are `/`-separated and always absolute within the drive.
//! [`normalize`] is the single entry point that turns caller input into the
//! canonical form used as map keys (`/` for the root, no trailing slash, no
//! empty or `.` components).

use crate::error::{DriveError, DriveResult};

/// Canonicalizes a drive path.
///
/// `..` components are rejected rather than resolved; the kernel never
/// hands them to a filesystem and nothing else should either.
pub fn normalize(path: &str) -> DriveResult<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(DriveError::InvalidPath(path.to_string())),
            name => {
                out.push('/');
                out.push_str(name);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Splits a canonical path into its parent and final component.
///
/// Returns `None` for the root.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// Joins a canonical directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Iterates the components of a canonical path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
