//! Automounter map lookups.
//!
//! A map name resolves to one or more map container entries; the entries
//! below a container each contribute a `(key, information)` pair. The
//! container DN list is resolved once per request and reused for the
//! entry searches.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::config::SearchBase;
use crate::filter;
use crate::proto::{Action, LIMIT_NAME};
use crate::result::Result;
use crate::search::Search;

use super::RequestCtx;

const MAP: MapSelector = MapSelector::Automount;

/// Object class of map container entries.
const MAP_CLASS_FILTER: &str = "(objectClass=automountMap)";

/// Find the DNs of the containers for a map name.
async fn resolve_containers<S>(
    ctx: &mut RequestCtx<'_, S>,
    mapname: &str,
) -> Result<Vec<String>> {
    let cfg = ctx.cfg.clone();
    let flt = filter::and(
        MAP_CLASS_FILTER,
        cfg.attmap.attr(MAP, "automountMapName"),
        mapname,
    );
    let mut dns = Vec::new();
    let mut search = Search::open(
        &mut *ctx.session,
        cfg.search_bases(MAP),
        &flt,
        vec!["objectClass".to_string()],
        ctx.caller.is_root(),
    )
    .await?;
    while let Some(entry) = search.next_entry().await? {
        dns.push(entry.dn().to_string());
    }
    search.close().await;
    Ok(dns)
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let mapname = ctx.stream.read_string(LIMIT_NAME).await?;
    let key = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("automount=\"{}\"/\"{}\": looking up key", mapname, key);
    ctx.stream
        .write_response_header(Action::AutomountByName)
        .await?;
    let cfg = ctx.cfg.clone();
    let containers = resolve_containers(ctx, &mapname).await?;
    if containers.is_empty() {
        debug!("automount=\"{}\": no such map", mapname);
        return ctx.stream.end_results().await;
    }
    let flt = filter::and(
        cfg.map_filter(MAP),
        cfg.attmap.attr(MAP, "automountKey"),
        &key,
    );
    write_entries(ctx, &containers, &flt).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let mapname = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("automount=\"{}\": enumeration request", mapname);
    ctx.stream.write_response_header(Action::AutomountAll).await?;
    let cfg = ctx.cfg.clone();
    let containers = resolve_containers(ctx, &mapname).await?;
    if containers.is_empty() {
        debug!("automount=\"{}\": no such map", mapname);
        return ctx.stream.end_results().await;
    }
    let flt = cfg.map_filter(MAP).to_string();
    write_entries(ctx, &containers, &flt).await
}

async fn write_entries<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    containers: &[String],
    flt: &str,
) -> Result<()> {
    let cfg = ctx.cfg.clone();
    let key_attr = cfg.attmap.attr(MAP, "automountKey");
    let info_attr = cfg.attmap.attr(MAP, "automountInformation");
    let attrs = cfg
        .attmap
        .search_attrs(MAP, &["automountKey", "automountInformation"]);
    let bases: Vec<SearchBase> = containers
        .iter()
        .map(|dn| SearchBase {
            base: dn.clone(),
            scope: ldap3::Scope::OneLevel,
            filter: None,
        })
        .collect();
    let mut search = Search::open(
        &mut *ctx.session,
        &bases,
        flt,
        attrs,
        ctx.caller.is_root(),
    )
    .await?;
    while let Some(entry) = search.next_entry().await? {
        let key = match entry.attr(key_attr) {
            Some(k) => k.to_string(),
            None => {
                warn!("{}: {}: missing", entry.dn(), key_attr);
                continue;
            }
        };
        let info = match entry.attr(info_attr) {
            Some(v) => v.to_string(),
            None => {
                warn!("{}: {}: missing", entry.dn(), info_attr);
                continue;
            }
        };
        ctx.stream.begin_record().await?;
        ctx.stream.write_string(&key).await?;
        ctx.stream.write_string(&info).await?;
    }
    search.close().await;
    ctx.stream.end_results().await
}
