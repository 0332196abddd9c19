//! Per-database request handlers.
//!
//! Every handler follows the same shape: decode the request arguments,
//! validate names against the `validnames` rule, write the response
//! header, search each configured base in priority order and stream the
//! matching entries as `BEGIN … END` framed records. A lookup that finds
//! nothing produces an empty, successful response; a directory failure
//! aborts the response without a final `END` so the client sees the
//! service as unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::config::Config;
use crate::filter;
use crate::invalidator::Invalidator;
use crate::proto::ProtoStream;
use crate::result::Result;
use crate::search::{Entry, Search};
use crate::session::Session;

pub mod aliases;
pub mod automount;
pub mod config;
pub mod ethers;
pub mod group;
pub mod hosts;
pub mod netgroup;
pub mod networks;
pub mod passwd;
pub mod protocols;
pub mod rpc;
pub mod services;
pub mod shadow;
pub mod usermod;

/// Credentials of the requesting process, from the peer-cred probe.
#[derive(Clone, Copy, Debug)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl Caller {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Everything a handler needs to serve one request.
pub struct RequestCtx<'a, S> {
    pub stream: &'a mut ProtoStream<S>,
    pub session: &'a mut Session,
    pub cfg: Arc<Config>,
    pub caller: Caller,
    pub invalidator: Option<Arc<Invalidator>>,
}

impl<S> RequestCtx<'_, S> {
    /// Ask the invalidator to flush the external cache for a map, after a
    /// successful modification.
    pub fn invalidate(&self, map: MapSelector) {
        if let Some(inv) = &self.invalidator {
            inv.signal(map);
        }
    }
}

/// Extract a usable password hash from a directory password value.
///
/// Values in `{crypt}` scheme lose their prefix (the result is the format
/// `/etc/shadow` stores); values in any other scheme are unusable for NSS
/// and yield `None`.
pub fn password_hash(value: &str) -> Option<&str> {
    if let Some(rest) = strip_prefix_ci(value, "{crypt}") {
        Some(rest)
    } else if let Some(rest) = strip_prefix_ci(value, "crypt$") {
        Some(rest)
    } else if value.starts_with('{') {
        None
    } else {
        Some(value)
    }
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

/// The password field for a passwd or shadow record, honoring the caller's
/// privileges. Unprivileged callers always see the unmatchable `*`.
pub fn user_password(cfg: &Config, map: MapSelector, entry: &Entry, caller: Caller) -> String {
    if !caller.is_root() {
        return "*".to_string();
    }
    cfg.attmap
        .value(map, "userPassword", entry)
        .as_deref()
        .and_then(password_hash)
        .unwrap_or("*")
        .to_string()
}

/// Parse an integer attribute value, logging non-numeric data.
pub fn numeric_value(entry: &Entry, attr: &str, value: Option<String>) -> Option<i64> {
    match value {
        Some(v) => match v.trim().parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!("{}: {}: non-numeric value", entry.dn(), attr);
                None
            }
        },
        None => None,
    }
}

/// Per-request cache for DN-to-username resolution during group member
/// expansion.
#[derive(Default)]
pub struct DnCache {
    map: HashMap<String, Option<String>>,
}

/// Resolve a member DN to a login name.
///
/// When the DN's RDN already uses the mapped login attribute the value is
/// taken from the DN itself; otherwise the entry is read from the
/// directory. Results, including misses, are cached for the duration of
/// the request.
pub async fn dn2uid(
    session: &mut Session,
    cfg: &Config,
    dn: &str,
    cache: &mut DnCache,
) -> Result<Option<String>> {
    if let Some(hit) = cache.map.get(dn) {
        return Ok(hit.clone());
    }
    let uid_attr = cfg.attmap.attr(MapSelector::Passwd, "uid").to_string();
    let fake = Entry::new(dn, &[]);
    if let Some(value) = fake.rdn_value(&uid_attr) {
        let value = value.to_string();
        cache.map.insert(dn.to_string(), Some(value.clone()));
        return Ok(Some(value));
    }
    let bases = [crate::config::SearchBase {
        base: dn.to_string(),
        scope: ldap3::Scope::Base,
        filter: None,
    }];
    let attrs = cfg.attmap.search_attrs(MapSelector::Passwd, &["uid"]);
    let found = Search::find_first(
        session,
        &bases,
        cfg.map_filter(MapSelector::Passwd),
        attrs,
        false,
    )
    .await?;
    let uid = found.and_then(|e| e.attr(&uid_attr).map(|v| v.to_string()));
    cache.map.insert(dn.to_string(), uid.clone());
    Ok(uid)
}

/// Look up the passwd entry for a login name across the configured bases.
pub async fn uid2entry(
    session: &mut Session,
    cfg: &Config,
    uid: &str,
) -> Result<Option<Entry>> {
    if !cfg.valid_name(uid) {
        return Ok(None);
    }
    let uid_attr = cfg.attmap.attr(MapSelector::Passwd, "uid").to_string();
    let flt = filter::and(cfg.map_filter(MapSelector::Passwd), &uid_attr, uid);
    let attrs = cfg.attmap.search_attrs(MapSelector::Passwd, &["uid"]);
    Search::find_first(
        session,
        cfg.search_bases(MapSelector::Passwd),
        &flt,
        attrs,
        false,
    )
    .await
}

/// Collect one typed address value, parsing the directory representation.
/// Unparseable values are skipped with a warning.
pub fn push_address(out: &mut Vec<(i32, Vec<u8>)>, dn: &str, value: &str) {
    match value.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => out.push((crate::proto::AF_INET, v4.octets().to_vec())),
        Ok(std::net::IpAddr::V6(v6)) => out.push((crate::proto::AF_INET6, v6.octets().to_vec())),
        Err(_) => warn!("{}: unparseable address \"{}\"", dn, value),
    }
}

/// Shared tail of the host and network handlers, which use the same
/// record layout: name, aliases, then a counted list of typed addresses.
pub async fn write_name_addresses<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut ProtoStream<S>,
    name: &str,
    aliases: &[String],
    addresses: &[(i32, Vec<u8>)],
) -> Result<()> {
    stream.begin_record().await?;
    stream.write_string(name).await?;
    stream.write_stringlist_nullterm(aliases).await?;
    stream.write_i32(addresses.len() as i32).await?;
    for (family, addr) in addresses {
        stream.write_address(*family, addr).await?;
    }
    Ok(())
}

/// Canonical name and alias split: the first value of the naming
/// attribute is the canonical name (preferring the RDN value when
/// present); every other value is an alias.
pub fn name_and_aliases(entry: &Entry, attr: &str) -> Option<(String, Vec<String>)> {
    let values = entry.attrs(attr);
    if values.is_empty() {
        debug!("{}: {}: missing", entry.dn(), attr);
        return None;
    }
    let canonical = entry
        .rdn_value(attr)
        .and_then(|rdn| values.iter().find(|v| v.eq_ignore_ascii_case(rdn)))
        .copied()
        .unwrap_or(values[0]);
    let aliases = values
        .iter()
        .filter(|&&v| v != canonical)
        .map(|v| v.to_string())
        .collect();
    Some((canonical.to_string(), aliases))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crypt_prefix_stripping() {
        assert_eq!(password_hash("{CRYPT}$6$salt$hash"), Some("$6$salt$hash"));
        assert_eq!(password_hash("{crypt}abc"), Some("abc"));
        assert_eq!(password_hash("CRYPT$abc"), Some("abc"));
        assert_eq!(password_hash("plain"), Some("plain"));
        assert_eq!(password_hash("{SSHA}xyz"), None);
        assert_eq!(password_hash("{MD5}xyz"), None);
    }

    #[test]
    fn canonical_name_prefers_rdn() {
        let e = Entry::new(
            "cn=www,ou=Hosts,dc=x",
            &[("cn", &["webserver", "www", "web"])],
        );
        let (name, aliases) = name_and_aliases(&e, "cn").unwrap();
        assert_eq!(name, "www");
        assert_eq!(aliases, vec!["webserver", "web"]);
    }

    #[test]
    fn canonical_name_falls_back_to_first_value() {
        let e = Entry::new("cn=db,ou=Hosts,dc=x", &[("cn", &["alpha", "beta"])]);
        // RDN value "db" does not appear among the attribute values
        let (name, aliases) = name_and_aliases(&e, "cn").unwrap();
        assert_eq!(name, "alpha");
        assert_eq!(aliases, vec!["beta"]);
    }

    #[test]
    fn missing_name_attribute() {
        let e = Entry::new("cn=x,dc=x", &[]);
        assert!(name_and_aliases(&e, "cn").is_none());
    }
}
