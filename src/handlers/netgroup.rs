//! Netgroup lookups.
//!
//! A by-name request streams the group's `(host, user, domain)` triples as
//! TRIPLE records, expanding `memberNisNetgroup` references recursively; a
//! visited list keyed on the (case-insensitively compared) netgroup names
//! breaks reference cycles. Enumeration lists the available netgroup
//! names, one per record.

use std::future::Future;
use std::pin::Pin;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::config::{Config, MAX_NESTING_DEPTH};
use crate::filter;
use crate::proto::{Action, ProtoStream, LIMIT_NAME, NETGROUP_TYPE_TRIPLE};
use crate::result::Result;
use crate::search::{Entry, Search};
use crate::session::Session;

use super::RequestCtx;

const MAP: MapSelector = MapSelector::Netgroup;

const ATTRS: [&str; 3] = ["cn", "nisNetgroupTriple", "memberNisNetgroup"];

/// Split a `(host,user,domain)` triple; empty components are allowed.
fn parse_triple(value: &str) -> Option<(String, String, String)> {
    let inner = value.trim().strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = inner.splitn(3, ',');
    let host = parts.next()?.trim().to_string();
    let user = parts.next()?.trim().to_string();
    let domain = parts.next()?.trim().to_string();
    Some((host, user, domain))
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin + Send>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("netgroup=\"{}\": looking up by name", name);
    ctx.stream
        .write_response_header(Action::NetgroupByName)
        .await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("netgroup=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let mut seen: Vec<String> = Vec::new();
    expand(ctx.session, ctx.stream, &cfg, name, &mut seen, 0).await?;
    ctx.stream.end_results().await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("netgroup(all): enumeration request");
    ctx.stream.write_response_header(Action::NetgroupAll).await?;
    let cfg = ctx.cfg.clone();
    let attrs = cfg.attmap.search_attrs(MAP, &["cn"]);
    let flt = cfg.map_filter(MAP).to_string();
    let mut search = Search::open(
        &mut *ctx.session,
        cfg.search_bases(MAP),
        &flt,
        attrs,
        ctx.caller.is_root(),
    )
    .await?;
    let cn_attr = cfg.attmap.attr(MAP, "cn");
    while let Some(entry) = search.next_entry().await? {
        for name in entry.attrs(cn_attr) {
            if !cfg.valid_name(name) {
                continue;
            }
            ctx.stream.begin_record().await?;
            ctx.stream.write_string(name).await?;
        }
    }
    search.close().await;
    ctx.stream.end_results().await
}

/// Write the triples of one netgroup, recursing into member netgroups.
fn expand<'a, S: AsyncRead + AsyncWrite + Unpin + Send>(
    session: &'a mut Session,
    stream: &'a mut ProtoStream<S>,
    cfg: &'a Config,
    name: String,
    seen: &'a mut Vec<String>,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if seen.iter().any(|s| s.eq_ignore_ascii_case(&name)) {
            debug!("netgroup \"{}\" already seen, skipping", name);
            return Ok(());
        }
        seen.push(name.clone());
        if depth >= MAX_NESTING_DEPTH {
            warn!("netgroup \"{}\": maximum nesting depth reached", name);
            return Ok(());
        }
        let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
        let attrs = cfg.attmap.search_attrs(MAP, &ATTRS);
        // collect first: the recursion below reuses the session
        let mut entries: Vec<Entry> = Vec::new();
        let mut search =
            Search::open(session, cfg.search_bases(MAP), &flt, attrs, false).await?;
        while let Some(entry) = search.next_entry().await? {
            entries.push(entry);
        }
        search.close().await;
        let triple_attr = cfg.attmap.attr(MAP, "nisNetgroupTriple");
        let member_attr = cfg.attmap.attr(MAP, "memberNisNetgroup");
        for entry in &entries {
            for value in entry.attrs(triple_attr) {
                match parse_triple(value) {
                    Some((host, user, domain)) => {
                        stream.begin_record().await?;
                        stream.write_i32(NETGROUP_TYPE_TRIPLE).await?;
                        stream.write_string(&host).await?;
                        stream.write_string(&user).await?;
                        stream.write_string(&domain).await?;
                    }
                    None => {
                        warn!("{}: {}: malformed triple \"{}\"", entry.dn(), triple_attr, value);
                    }
                }
            }
        }
        for entry in &entries {
            let members: Vec<String> = entry
                .attrs(member_attr)
                .iter()
                .map(|v| v.to_string())
                .collect();
            for member in members {
                expand(session, stream, cfg, member, seen, depth + 1).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_triple() {
        assert_eq!(
            parse_triple("(host1,user1,example.com)"),
            Some(("host1".into(), "user1".into(), "example.com".into()))
        );
    }

    #[test]
    fn empty_components() {
        assert_eq!(
            parse_triple("(,alice,)"),
            Some(("".into(), "alice".into(), "".into()))
        );
        assert_eq!(parse_triple("(,,)"), Some(("".into(), "".into(), "".into())));
    }

    #[test]
    fn whitespace_tolerated() {
        assert_eq!(
            parse_triple(" ( host , user , dom ) "),
            Some(("host".into(), "user".into(), "dom".into()))
        );
    }

    #[test]
    fn malformed_triples_rejected() {
        assert_eq!(parse_triple("host,user,dom"), None);
        assert_eq!(parse_triple("(host,user)"), None);
        assert_eq!(parse_triple("()"), None);
    }
}
