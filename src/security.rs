#![forbid(unsafe_code)]

//! Process and input hardening shared by the backend and the converters.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Component, Path};

/// Fallback base name when an upload carries no usable name at all.
pub const DEFAULT_UPLOAD_STEM: &str = "font";

/// Refuses to start the service as root. The backend writes into several
/// directories on behalf of anonymous clients and should never do that with
/// full privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from a dedicated service account");
    }
    Ok(())
}

/// True when `name` is exactly one normal path component, i.e. it cannot
/// point outside the directory it is joined onto.
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Reduces a client supplied upload name to a safe base name: directory
/// segments (either separator style) and the extension are dropped, anything
/// outside `[A-Za-z0-9._-]` becomes `_` and leading dots are removed.
pub fn sanitize_upload_stem(original: &str) -> String {
    let last = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let stem = match last.rfind('.') {
        Some(idx) if idx > 0 => &last[..idx],
        _ => last,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        DEFAULT_UPLOAD_STEM.to_string()
    } else {
        cleaned.to_string()
    }
}
