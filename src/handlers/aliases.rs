//! Mail alias lookups: alias name plus a counted member list.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, LIMIT_NAME};
use crate::result::Result;
use crate::search::Search;

use super::RequestCtx;

const MAP: MapSelector = MapSelector::Alias;

const ATTRS: [&str; 2] = ["cn", "rfc822MailMember"];

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("alias=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::AliasByName).await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("alias=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
    write_results(ctx, &flt, Some(&name)).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("alias(all): enumeration request");
    ctx.stream.write_response_header(Action::AliasAll).await?;
    let flt = ctx.cfg.map_filter(MAP).to_string();
    write_results(ctx, &flt, None).await
}

async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
    reqalias: Option<&str>,
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
    let member_attr = cfg.attmap.attr(MAP, "rfc822MailMember");
    while let Some(entry) = search.next_entry().await? {
        let names = entry.attrs(cn_attr);
        if names.is_empty() {
            warn!("{}: {}: missing", entry.dn(), cn_attr);
            continue;
        }
        let members: Vec<String> = entry
            .attrs(member_attr)
            .iter()
            .map(|v| v.to_string())
            .collect();
        for name in names {
            if let Some(reqalias) = reqalias {
                if !cfg.name_eq(reqalias, name) {
                    continue;
                }
            }
            ctx.stream.begin_record().await?;
            ctx.stream.write_string(name).await?;
            ctx.stream.write_stringlist(&members).await?;
        }
    }
    search.close().await;
    ctx.stream.end_results().await
}
