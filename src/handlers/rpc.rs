//! RPC database lookups: name, aliases, ONC RPC program number.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, LIMIT_NAME};
use crate::result::Result;
use crate::search::Search;

use super::{name_and_aliases, numeric_value, RequestCtx};

const MAP: MapSelector = MapSelector::Rpc;

const ATTRS: [&str; 2] = ["cn", "oncRpcNumber"];

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("rpc=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::RpcByName).await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
    write_results(ctx, &flt).await
}

pub async fn bynumber<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let number = ctx.stream.read_i32().await?;
    debug!("rpc={}: looking up by number", number);
    ctx.stream.write_response_header(Action::RpcByNumber).await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and_num(
        cfg.map_filter(MAP),
        cfg.attmap.attr(MAP, "oncRpcNumber"),
        number as i64,
    );
    write_results(ctx, &flt).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("rpc(all): enumeration request");
    ctx.stream.write_response_header(Action::RpcAll).await?;
    let flt = ctx.cfg.map_filter(MAP).to_string();
    write_results(ctx, &flt).await
}

async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
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
    while let Some(entry) = search.next_entry().await? {
        let (name, aliases) = match name_and_aliases(&entry, cn_attr) {
            Some(pair) => pair,
            None => continue,
        };
        let number = match numeric_value(
            &entry,
            "oncRpcNumber",
            cfg.attmap.value(MAP, "oncRpcNumber", &entry),
        ) {
            Some(n) => n,
            None => {
                warn!("{}: oncRpcNumber: missing", entry.dn());
                continue;
            }
        };
        ctx.stream.begin_record().await?;
        ctx.stream.write_string(&name).await?;
        ctx.stream.write_stringlist_nullterm(&aliases).await?;
        ctx.stream.write_i32(number as i32).await?;
    }
    search.close().await;
    ctx.stream.end_results().await
}
