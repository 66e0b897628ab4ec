//! Process and path safety checks shared by the binaries.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The service spawns yt-dlp and
/// ffmpeg on untrusted input, so it must run under an unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// True when `value` is exactly one normal path component, so joining it onto
/// a base directory can never escape that directory.
pub fn is_safe_path_segment(value: &str) -> bool {
    if value.is_empty() || value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
