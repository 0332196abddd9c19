//! User information changes (home directory and login shell).
//!
//! The request authenticates with either the user's own password or the
//! administrator DN, then issues an LDAP modify replacing the mapped
//! attributes. Rejected fields are reported individually; the client
//! applies whatever the directory accepted.

use std::sync::Arc;

use ldap3::Mod;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::{MapSelector, MapValue};
use crate::proto::{usermod_field, Action, LIMIT_NAME, LIMIT_PASSWORD};
use crate::result::Result;
use crate::session::Session;

use super::{uid2entry, RequestCtx};

/// Check a proposed home directory: an absolute path naming an existing
/// directory.
fn is_valid_homedir(homedir: &str) -> bool {
    if !homedir.starts_with('/') {
        return false;
    }
    match std::fs::metadata(homedir) {
        Ok(meta) => meta.is_dir(),
        Err(e) => {
            debug!("cannot stat() {}: {}", homedir, e);
            false
        }
    }
}

/// Check a proposed shell against the system shell list.
fn is_valid_shell(shell: &str) -> bool {
    match std::fs::read_to_string("/etc/shells") {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .any(|l| l == shell),
        Err(e) => {
            debug!("cannot read /etc/shells: {}", e);
            false
        }
    }
}

pub async fn usermod<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let username = ctx.stream.read_string(LIMIT_NAME).await?;
    let asroot = ctx.stream.read_i32().await? != 0;
    let mut password = ctx.stream.read_string(LIMIT_PASSWORD).await?;
    let mut homedir: Option<String> = None;
    let mut shell: Option<String> = None;
    loop {
        let param = ctx.stream.read_i32().await?;
        if param == usermod_field::END {
            break;
        }
        let value = ctx.stream.read_string(4096).await?;
        match param {
            usermod_field::HOMEDIR => homedir = Some(value),
            usermod_field::SHELL => shell = Some(value),
            usermod_field::FULLNAME
            | usermod_field::ROOMNUMBER
            | usermod_field::WORKPHONE
            | usermod_field::HOMEPHONE
            | usermod_field::OTHER => {
                debug!("usermod=\"{}\": ignoring finger information change", username);
            }
            other => {
                debug!("usermod=\"{}\": ignoring unknown parameter {}", username, other);
            }
        }
    }
    debug!(
        "usermod=\"{}\" ({})",
        username,
        if asroot { "asroot" } else { "asuser" }
    );
    ctx.stream.write_response_header(Action::UserMod).await?;
    let cfg = ctx.cfg.clone();
    if !cfg.valid_name(&username) {
        warn!("usermod=\"{}\": request denied by validnames option", username);
        return ctx.stream.end_results().await;
    }
    let entry = match uid2entry(ctx.session, &cfg, &username).await? {
        Some(entry) => entry,
        None => {
            debug!("usermod=\"{}\": user not found", username);
            return ctx.stream.end_results().await;
        }
    };
    let isroot = ctx.caller.is_root() && asroot;
    let binddn = if asroot {
        match &cfg.rootpwmoddn {
            Some(dn) => {
                if password.is_empty() && isroot {
                    if let Some(pw) = &cfg.rootpwmodpw {
                        password = pw.clone();
                    }
                }
                dn.clone()
            }
            None => {
                warn!("usermod=\"{}\": rootpwmoddn not configured", username);
                return Err(crate::result::NsdError::proto("usermod as root not enabled"));
            }
        }
    } else {
        entry.dn().to_string()
    };
    ctx.stream.begin_record().await?;
    // non-root callers only get values that pass local validation
    if let Some(dir) = &homedir {
        if !isroot && !is_valid_homedir(dir) {
            warn!("usermod=\"{}\": invalid directory: {}", username, dir);
            ctx.stream.write_i32(usermod_field::HOMEDIR).await?;
            ctx.stream.write_string("invalid directory").await?;
            homedir = None;
        }
    }
    if let Some(sh) = &shell {
        if !isroot && !is_valid_shell(sh) {
            warn!("usermod=\"{}\": invalid shell: {}", username, sh);
            ctx.stream.write_i32(usermod_field::SHELL).await?;
            ctx.stream.write_string("invalid shell").await?;
            shell = None;
        }
    }
    match apply_change(&cfg, &binddn, &password, entry.dn(), homedir, shell).await {
        Ok(()) => {
            debug!("usermod=\"{}\": changed information for {}", username, entry.dn());
            ctx.invalidate(MapSelector::Passwd);
        }
        Err(msg) => {
            warn!("{}: modification failed: {}", entry.dn(), msg);
            ctx.stream.write_i32(usermod_field::RESULT).await?;
            ctx.stream
                .write_string(&format!("change failed: {}", msg))
                .await?;
        }
    }
    ctx.stream.write_i32(usermod_field::END).await?;
    ctx.stream.end_results().await
}

/// Bind a fresh session with the supplied credentials and replace the
/// mapped attributes. Expression-mapped attributes cannot be written and
/// are skipped.
async fn apply_change(
    cfg: &Arc<crate::config::Config>,
    binddn: &str,
    password: &str,
    userdn: &str,
    homedir: Option<String>,
    shell: Option<String>,
) -> std::result::Result<(), String> {
    let mut mods: Vec<Mod<String>> = Vec::new();
    if let Some(dir) = homedir {
        if let MapValue::Attribute(attr) =
            cfg.attmap.resolve(MapSelector::Passwd, "homeDirectory")
        {
            mods.push(Mod::Replace(attr.clone(), vec![dir].into_iter().collect()));
        }
    }
    if let Some(sh) = shell {
        if let MapValue::Attribute(attr) = cfg.attmap.resolve(MapSelector::Passwd, "loginShell") {
            mods.push(Mod::Replace(attr.clone(), vec![sh].into_iter().collect()));
        }
    }
    if mods.is_empty() {
        return Ok(());
    }
    let mut session = Session::new(cfg.clone());
    let (rc, text) = session.user_bind(binddn, password).await.map_err(|e| e.to_string())?;
    if rc != 0 {
        session.close().await;
        return Err(if text.is_empty() {
            "authentication failed".to_string()
        } else {
            text
        });
    }
    let outcome = session.modify(userdn, mods).await.map_err(|e| e.to_string());
    session.close().await;
    outcome
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn homedir_must_be_absolute() {
        assert!(!is_valid_homedir("relative/path"));
        assert!(!is_valid_homedir(""));
    }

    #[test]
    fn existing_directory_is_valid() {
        assert!(is_valid_homedir("/"));
    }

    #[test]
    fn regular_file_is_not_a_homedir() {
        assert!(!is_valid_homedir("/proc/version"));
    }
}
