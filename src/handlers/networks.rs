//! Network database lookups.
//!
//! Same record layout as hosts: name, aliases, counted address list.
//! Address lookups retry with trailing `.0` components stripped, since
//! directories commonly store network numbers in their shortened form
//! (`10.20` rather than `10.20.0.0`).

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, LIMIT_HOSTNAME};
use crate::result::Result;
use crate::search::Search;

use super::hosts::format_address;
use super::{name_and_aliases, push_address, write_name_addresses, RequestCtx};

const MAP: MapSelector = MapSelector::Network;

const ATTRS: [&str; 2] = ["cn", "ipNetworkNumber"];

/// Strip one trailing `.0` component, if present.
fn strip_zero_suffix(addr: &str) -> Option<&str> {
    addr.strip_suffix(".0")
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_HOSTNAME).await?;
    debug!("network=\"{}\": looking up by name", name);
    ctx.stream
        .write_response_header(Action::NetworkByName)
        .await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
    write_results(ctx, &flt).await?;
    ctx.stream.end_results().await
}

pub async fn byaddr<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let (family, bytes) = ctx.stream.read_address().await?;
    let mut addr = format_address(family, &bytes)?;
    debug!("network={}: looking up by address", addr);
    ctx.stream
        .write_response_header(Action::NetworkByAddr)
        .await?;
    let cfg = ctx.cfg.clone();
    let addr_attr = cfg.attmap.attr(MAP, "ipNetworkNumber").to_string();
    loop {
        let flt = filter::and(cfg.map_filter(MAP), &addr_attr, &addr);
        if write_results(ctx, &flt).await? > 0 {
            break;
        }
        match strip_zero_suffix(&addr) {
            Some(shorter) => {
                debug!("network={}: retrying as {}", addr, shorter);
                addr = shorter.to_string();
            }
            None => break,
        }
    }
    ctx.stream.end_results().await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("network(all): enumeration request");
    ctx.stream.write_response_header(Action::NetworkAll).await?;
    let flt = ctx.cfg.map_filter(MAP).to_string();
    write_results(ctx, &flt).await?;
    ctx.stream.end_results().await
}

/// Stream matching records; returns how many were written so the address
/// retry loop can tell a miss from a hit.
async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
) -> Result<usize> {
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
    let addr_attr = cfg.attmap.attr(MAP, "ipNetworkNumber");
    let mut written = 0;
    while let Some(entry) = search.next_entry().await? {
        let (name, aliases) = match name_and_aliases(&entry, cn_attr) {
            Some(pair) => pair,
            None => continue,
        };
        let mut addresses = Vec::new();
        for value in entry.attrs(addr_attr) {
            // network numbers may be stored shortened; pad for parsing
            push_address(&mut addresses, entry.dn(), &pad_network_number(value));
        }
        write_name_addresses(ctx.stream, &name, &aliases, &addresses).await?;
        written += 1;
    }
    search.close().await;
    Ok(written)
}

/// Expand a shortened IPv4 network number (`10.20`) to four components
/// so it parses as an address. Values that are not shortened v4 forms
/// pass through untouched.
fn pad_network_number(value: &str) -> String {
    let dots = value.bytes().filter(|b| *b == b'.').count();
    if value.contains(':') || dots >= 3 || !value.bytes().all(|b| b.is_ascii_digit() || b == b'.')
    {
        return value.to_string();
    }
    let mut out = value.to_string();
    for _ in dots..3 {
        out.push_str(".0");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_suffix_stripping() {
        assert_eq!(strip_zero_suffix("10.20.30.0"), Some("10.20.30"));
        assert_eq!(strip_zero_suffix("10.20.30"), Some("10.20"));
        assert_eq!(strip_zero_suffix("10.20.30.1"), None);
    }

    #[test]
    fn network_number_padding() {
        assert_eq!(pad_network_number("10.20"), "10.20.0.0");
        assert_eq!(pad_network_number("10.20.30.0"), "10.20.30.0");
        assert_eq!(pad_network_number("2001:db8::"), "2001:db8::");
        assert_eq!(pad_network_number("not-a-number"), "not-a-number");
    }
}
