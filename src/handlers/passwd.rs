//! Password database lookups.
//!
//! Record layout: name, password, uid, gid, gecos, home directory, shell.
//! The password field is `x` for entries that also carry the shadow
//! objectclass, and `*` for unprivileged callers.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, ProtoStream, LIMIT_NAME};
use crate::result::Result;
use crate::search::{Entry, Search};

use super::{numeric_value, user_password, Caller, RequestCtx};

const MAP: MapSelector = MapSelector::Passwd;

/// Logical attributes a passwd search requests.
const ATTRS: [&str; 8] = [
    "uid",
    "userPassword",
    "uidNumber",
    "gidNumber",
    "gecos",
    "cn",
    "homeDirectory",
    "loginShell",
];

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("passwd=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::PasswdByName).await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("passwd=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "uid"), &name);
    write_results(ctx, &flt, Some(&name)).await
}

pub async fn byuid<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let uid = ctx.stream.read_i32().await?;
    debug!("passwd={}: looking up by uid", uid);
    ctx.stream.write_response_header(Action::PasswdByUid).await?;
    if uid < 0 || (uid as u32) < ctx.cfg.nss_min_uid {
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let flt = filter::and_num(
        cfg.map_filter(MAP),
        cfg.attmap.attr(MAP, "uidNumber"),
        uid as i64,
    );
    write_results(ctx, &flt, None).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("passwd(all): enumeration request");
    ctx.stream.write_response_header(Action::PasswdAll).await?;
    if ctx.cfg.nss_disable_enumeration {
        return ctx.stream.end_results().await;
    }
    let flt = ctx.cfg.map_filter(MAP).to_string();
    write_results(ctx, &flt, None).await
}

async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
    requser: Option<&str>,
) -> Result<()> {
    let cfg = ctx.cfg.clone();
    let caller = ctx.caller;
    let attrs = cfg.attmap.search_attrs(MAP, &ATTRS);
    let mut search = Search::open(
        &mut *ctx.session,
        cfg.search_bases(MAP),
        flt,
        attrs,
        caller.is_root(),
    )
    .await?;
    while let Some(entry) = search.next_entry().await? {
        write_entry(ctx.stream, &cfg, caller, &entry, requser).await?;
    }
    search.close().await;
    ctx.stream.end_results().await
}

/// Write the records for one directory entry. An entry with several login
/// names produces one record per name.
pub async fn write_entry<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut ProtoStream<S>,
    cfg: &crate::config::Config,
    caller: Caller,
    entry: &Entry,
    requser: Option<&str>,
) -> Result<()> {
    let uid_attr = cfg.attmap.attr(MAP, "uid");
    let usernames = entry.attrs(uid_attr);
    if usernames.is_empty() {
        warn!("{}: {}: missing", entry.dn(), uid_attr);
        return Ok(());
    }
    let uid = match numeric_value(entry, "uidNumber", cfg.attmap.value(MAP, "uidNumber", entry)) {
        Some(n) => n,
        None => {
            warn!("{}: uidNumber: missing", entry.dn());
            return Ok(());
        }
    };
    if uid < cfg.nss_min_uid as i64 {
        return Ok(());
    }
    let gid = match numeric_value(entry, "gidNumber", cfg.attmap.value(MAP, "gidNumber", entry)) {
        Some(n) => n,
        None => {
            warn!("{}: gidNumber: missing", entry.dn());
            return Ok(());
        }
    };
    let passwd = if entry.has_objectclass("shadowAccount") {
        // the real password data lives in the shadow map
        "x".to_string()
    } else {
        user_password(cfg, MAP, entry, caller)
    };
    let gecos = cfg.attmap.value(MAP, "gecos", entry).unwrap_or_default();
    let homedir = cfg
        .attmap
        .value(MAP, "homeDirectory", entry)
        .unwrap_or_default();
    let shell = cfg.attmap.value(MAP, "loginShell", entry).unwrap_or_default();
    for username in usernames {
        if let Some(requser) = requser {
            if !cfg.name_eq(requser, username) {
                continue;
            }
        }
        if !cfg.valid_name(username) {
            warn!(
                "{}: {}: denied by validnames option",
                entry.dn(),
                uid_attr
            );
            continue;
        }
        stream.begin_record().await?;
        stream.write_string(username).await?;
        stream.write_string(&passwd).await?;
        stream.write_i32(uid as i32).await?;
        stream.write_i32(gid as i32).await?;
        stream.write_string(&gecos).await?;
        stream.write_string(&homedir).await?;
        stream.write_string(&shell).await?;
    }
    Ok(())
}
