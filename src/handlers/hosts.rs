//! Host database lookups.
//!
//! Record layout: name, aliases, then a counted list of typed addresses.

use std::net::{Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, AF_INET, AF_INET6, LIMIT_HOSTNAME};
use crate::result::{NsdError, Result};
use crate::search::Search;

use super::{name_and_aliases, push_address, write_name_addresses, RequestCtx};

const MAP: MapSelector = MapSelector::Host;

const ATTRS: [&str; 2] = ["cn", "ipHostNumber"];

/// Render a wire address as the string form stored in the directory. A
/// v4-mapped IPv6 address is folded to its dotted-quad form so lookups
/// from v6-aware resolvers still match v4-only directory data.
pub fn format_address(family: i32, bytes: &[u8]) -> Result<String> {
    match family {
        AF_INET => {
            let octets: [u8; 4] = bytes
                .try_into()
                .map_err(|_| NsdError::proto("bad IPv4 address length"))?;
            Ok(Ipv4Addr::from(octets).to_string())
        }
        AF_INET6 => {
            let octets: [u8; 16] = bytes
                .try_into()
                .map_err(|_| NsdError::proto("bad IPv6 address length"))?;
            let addr = Ipv6Addr::from(octets);
            match addr.to_ipv4_mapped() {
                Some(v4) => Ok(v4.to_string()),
                None => Ok(addr.to_string()),
            }
        }
        other => Err(NsdError::proto(format!("unknown address family {}", other))),
    }
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_HOSTNAME).await?;
    debug!("host=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::HostByName).await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
    write_results(ctx, &flt).await
}

pub async fn byaddr<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let (family, bytes) = ctx.stream.read_address().await?;
    let addr = format_address(family, &bytes)?;
    debug!("host={}: looking up by address", addr);
    ctx.stream.write_response_header(Action::HostByAddr).await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and(
        cfg.map_filter(MAP),
        cfg.attmap.attr(MAP, "ipHostNumber"),
        &addr,
    );
    write_results(ctx, &flt).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("host(all): enumeration request");
    ctx.stream.write_response_header(Action::HostAll).await?;
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
    let addr_attr = cfg.attmap.attr(MAP, "ipHostNumber");
    while let Some(entry) = search.next_entry().await? {
        let (name, aliases) = match name_and_aliases(&entry, cn_attr) {
            Some(pair) => pair,
            None => continue,
        };
        let mut addresses = Vec::new();
        for value in entry.attrs(addr_attr) {
            push_address(&mut addresses, entry.dn(), value);
        }
        if addresses.is_empty() {
            warn!("{}: {}: missing", entry.dn(), addr_attr);
            continue;
        }
        write_name_addresses(ctx.stream, &name, &aliases, &addresses).await?;
    }
    search.close().await;
    ctx.stream.end_results().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v4_address_formats() {
        assert_eq!(format_address(AF_INET, &[10, 0, 0, 1]).unwrap(), "10.0.0.1");
    }

    #[test]
    fn v6_address_formats() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x20;
        bytes[1] = 0x01;
        bytes[2] = 0x0d;
        bytes[3] = 0xb8;
        bytes[15] = 1;
        assert_eq!(
            format_address(AF_INET6, &bytes).unwrap(),
            "2001:db8::1"
        );
    }

    #[test]
    fn v4_mapped_v6_is_folded() {
        let v4 = Ipv4Addr::new(192, 0, 2, 7);
        let mapped = v4.to_ipv6_mapped();
        assert_eq!(
            format_address(AF_INET6, &mapped.octets()).unwrap(),
            "192.0.2.7"
        );
    }

    #[test]
    fn bad_lengths_are_protocol_errors() {
        assert!(format_address(AF_INET, &[1, 2, 3]).is_err());
        assert!(format_address(AF_INET6, &[1, 2, 3, 4]).is_err());
        assert!(format_address(99, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn ip_addr_parse_matches_wire_families() {
        use std::net::IpAddr;
        // the directory stores textual forms; both parse back
        assert!(matches!("10.0.0.1".parse::<IpAddr>(), Ok(IpAddr::V4(_))));
        assert!(matches!("2001:db8::1".parse::<IpAddr>(), Ok(IpAddr::V6(_))));
    }
}
