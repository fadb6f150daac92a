//! Path normalization onto the backend's two namespaces.
//!
//! Callers may pass `/Foo`, `Foo`, `ff/resources/Foo` or a full locator such as
//! `/ff/resources/Foo/abc`; all of them end up relative to the base URL with no
//! leading slash.

const RESOURCES: &str = "ff/resources";
const EXTENSION: &str = "ff/ext";

/// Which namespace a caller-supplied path should land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Persisted collections (`ff/resources/...`).
    Resources,
    /// Server-side extension calls (`ff/ext/...`).
    Extension,
    /// Keep an explicit `ff/ext/` or `ff/resources/` prefix, otherwise resources.
    Auto,
}

/// Rewrite `path` so that it sits in `namespace`, relative to the base URL.
pub fn normalize(path: &str, namespace: Namespace) -> String {
    match namespace {
        Namespace::Extension => place(path, EXTENSION),
        Namespace::Resources => place(path, RESOURCES),
        Namespace::Auto => {
            let relative = path.strip_prefix('/').unwrap_or(path);
            if relative.starts_with("ff/ext/") {
                relative.to_string()
            } else {
                place(path, RESOURCES)
            }
        }
    }
}

fn place(path: &str, prefix: &str) -> String {
    match path.strip_prefix('/') {
        Some(rest) if rest.starts_with(prefix) && rest[prefix.len()..].starts_with('/') => {
            rest.to_string()
        }
        Some(_) => format!("{prefix}{path}"),
        None if path.starts_with(prefix) && path[prefix.len()..].starts_with('/') => {
            path.to_string()
        }
        None => format!("{prefix}/{path}"),
    }
}

/// Ensure a base URL ends with exactly one `/`.
pub fn normalize_base(base: &str) -> String {
    format!("{}/", base.trim_end_matches('/'))
}
