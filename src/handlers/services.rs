//! Service database lookups.
//!
//! Record layout: name, aliases, port, protocol. An entry carrying
//! several `ipServiceProtocol` values produces one record per protocol,
//! unless the request named a specific protocol.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, LIMIT_NAME};
use crate::result::Result;
use crate::search::Search;

use super::{name_and_aliases, numeric_value, RequestCtx};

const MAP: MapSelector = MapSelector::Service;

const ATTRS: [&str; 3] = ["cn", "ipServicePort", "ipServiceProtocol"];

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    let protocol = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("service=\"{}\"/\"{}\": looking up by name", name, protocol);
    ctx.stream
        .write_response_header(Action::ServiceByName)
        .await?;
    let cfg = ctx.cfg.clone();
    let name_attr = cfg.attmap.attr(MAP, "cn");
    let flt = if protocol.is_empty() {
        filter::and(cfg.map_filter(MAP), name_attr, &name)
    } else {
        filter::and2(
            cfg.map_filter(MAP),
            name_attr,
            &name,
            cfg.attmap.attr(MAP, "ipServiceProtocol"),
            &protocol,
        )
    };
    write_results(ctx, &flt, &protocol).await
}

pub async fn bynumber<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let port = ctx.stream.read_i32().await?;
    let protocol = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("service={}/\"{}\": looking up by number", port, protocol);
    ctx.stream
        .write_response_header(Action::ServiceByNumber)
        .await?;
    let cfg = ctx.cfg.clone();
    let port_attr = cfg.attmap.attr(MAP, "ipServicePort");
    let flt = if protocol.is_empty() {
        filter::and_num(cfg.map_filter(MAP), port_attr, port as i64)
    } else {
        format!(
            "(&{}({}={})({}={}))",
            cfg.map_filter(MAP),
            port_attr,
            port,
            cfg.attmap.attr(MAP, "ipServiceProtocol"),
            filter::escape(protocol.as_str())
        )
    };
    write_results(ctx, &flt, &protocol).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("service(all): enumeration request");
    ctx.stream.write_response_header(Action::ServiceAll).await?;
    let flt = ctx.cfg.map_filter(MAP).to_string();
    write_results(ctx, &flt, "").await
}

async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
    req_protocol: &str,
) -> Result<()> {
    let cfg = ctx.cfg.clone();
    let attrs = cfg.attmap.search_attrs(MAP, &ATTRS);
    let mut search = Search::open(
        &mut *ctx.session,
        cfg.search_bases(MAP),
        flt,
        attrs,
        ctx.caller.is_root(),
    )
    .await?;
    let cn_attr = cfg.attmap.attr(MAP, "cn");
    let proto_attr = cfg.attmap.attr(MAP, "ipServiceProtocol");
    while let Some(entry) = search.next_entry().await? {
        let (name, aliases) = match name_and_aliases(&entry, cn_attr) {
            Some(pair) => pair,
            None => continue,
        };
        let port = match numeric_value(
            &entry,
            "ipServicePort",
            cfg.attmap.value(MAP, "ipServicePort", &entry),
        ) {
            Some(n) => n,
            None => {
                warn!("{}: ipServicePort: missing", entry.dn());
                continue;
            }
        };
        let protocols = entry.attrs(proto_attr);
        if protocols.is_empty() {
            warn!("{}: {}: missing", entry.dn(), proto_attr);
            continue;
        }
        for protocol in protocols {
            if !req_protocol.is_empty() && !protocol.eq_ignore_ascii_case(req_protocol) {
                continue;
            }
            ctx.stream.begin_record().await?;
            ctx.stream.write_string(&name).await?;
            ctx.stream.write_stringlist_nullterm(&aliases).await?;
            ctx.stream.write_i32(port as i32).await?;
            ctx.stream.write_string(protocol).await?;
        }
    }
    search.close().await;
    ctx.stream.end_results().await
}
