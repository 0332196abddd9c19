//! Ethernet address lookups: host name plus a raw 6-byte address.
//!
//! Addresses are normalized to the canonical colon-separated hex form
//! without leading zeros before being used in filters, matching the form
//! `ether_ntoa` produces and directories conventionally store.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::filter;
use crate::proto::{Action, LIMIT_NAME};
use crate::result::Result;
use crate::search::Search;

use super::{name_and_aliases, RequestCtx};

const MAP: MapSelector = MapSelector::Ether;

const ATTRS: [&str; 2] = ["cn", "macAddress"];

/// Canonical textual form of an ethernet address.
pub fn format_ether(bytes: &[u8; 6]) -> String {
    format!(
        "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Parse a colon-separated ethernet address, accepting one or two hex
/// digits per octet.
pub fn parse_ether(s: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = s.split(':');
    for byte in bytes.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("ether=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::EtherByName).await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("ether=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
    write_results(ctx, &flt).await
}

pub async fn byether<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let raw = ctx.stream.read_bytes(6).await?;
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&raw);
    let text = format_ether(&addr);
    debug!("ether={}: looking up by address", text);
    ctx.stream
        .write_response_header(Action::EtherByEther)
        .await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "macAddress"), &text);
    write_results(ctx, &flt).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("ether(all): enumeration request");
    ctx.stream.write_response_header(Action::EtherAll).await?;
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
    let mac_attr = cfg.attmap.attr(MAP, "macAddress");
    while let Some(entry) = search.next_entry().await? {
        let (name, _aliases) = match name_and_aliases(&entry, cn_attr) {
            Some(pair) => pair,
            None => continue,
        };
        for value in entry.attrs(mac_attr) {
            match parse_ether(value) {
                Some(bytes) => {
                    ctx.stream.begin_record().await?;
                    ctx.stream.write_string(&name).await?;
                    ctx.stream.write_bytes(&bytes).await?;
                }
                None => {
                    warn!("{}: {}: unparseable address \"{}\"", entry.dn(), mac_attr, value);
                }
            }
        }
    }
    search.close().await;
    ctx.stream.end_results().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formatting_drops_leading_zeros() {
        assert_eq!(format_ether(&[0x01, 0x00, 0x0e, 0xaa, 0xbb, 0xcc]), "1:0:e:aa:bb:cc");
        assert_eq!(format_ether(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]), "de:ad:be:ef:0:1");
    }

    #[test]
    fn parsing_accepts_both_widths() {
        assert_eq!(
            parse_ether("01:00:0e:aa:bb:cc"),
            Some([0x01, 0x00, 0x0e, 0xaa, 0xbb, 0xcc])
        );
        assert_eq!(
            parse_ether("1:0:e:aa:bb:cc"),
            Some([0x01, 0x00, 0x0e, 0xaa, 0xbb, 0xcc])
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(parse_ether("1:2:3:4:5"), None);
        assert_eq!(parse_ether("1:2:3:4:5:6:7"), None);
        assert_eq!(parse_ether("zz:00:00:00:00:00"), None);
        assert_eq!(parse_ether("100:00:00:00:00:00"), None);
        assert_eq!(parse_ether(""), None);
    }

    #[test]
    fn normalization_roundtrip() {
        let addr = [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e];
        assert_eq!(parse_ether(&format_ether(&addr)), Some(addr));
    }
}
