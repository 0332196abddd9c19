//! Group database lookups.
//!
//! Record layout: name, password, gid, member list (count-prefixed).
//! Flat `memberUid` values are combined with DN-valued `member`
//! attributes, which are resolved to login names. Nested groups are
//! expanded when `nss_nested_groups` is enabled, with a visited list
//! breaking membership cycles and a fixed depth cap. Servers that chunk
//! large member sets with `;range=` attribute options are drained
//! transparently.
//!
//! By-member lookups answer the initgroups question and return records
//! with only the gid field populated.

use std::future::Future;
use std::pin::Pin;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::MapSelector;
use crate::config::{Config, SearchBase, MAX_NESTING_DEPTH};
use crate::filter;
use crate::proto::{Action, ProtoStream, LIMIT_NAME};
use crate::result::Result;
use crate::search::{Entry, Search};
use crate::session::Session;

use super::{dn2uid, numeric_value, uid2entry, user_password, Caller, DnCache, RequestCtx};

const MAP: MapSelector = MapSelector::Group;

const ATTRS: [&str; 5] = ["cn", "userPassword", "gidNumber", "memberUid", "member"];

/// Case-insensitive visited list for nested group traversal.
#[derive(Default)]
struct NameList {
    seen: Vec<String>,
}

impl NameList {
    /// Record a name; returns false when it was already present.
    fn insert(&mut self, name: &str) -> bool {
        if self.seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            return false;
        }
        self.seen.push(name.to_string());
        true
    }
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("group=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::GroupByName).await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("group=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "cn"), &name);
    write_results(ctx, &flt, true).await
}

pub async fn bygid<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let gid = ctx.stream.read_i32().await?;
    debug!("group={}: looking up by gid", gid);
    ctx.stream.write_response_header(Action::GroupByGid).await?;
    let cfg = ctx.cfg.clone();
    let flt = filter::and_num(
        cfg.map_filter(MAP),
        cfg.attmap.attr(MAP, "gidNumber"),
        gid as i64,
    );
    write_results(ctx, &flt, true).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("group(all): enumeration request");
    ctx.stream.write_response_header(Action::GroupAll).await?;
    if ctx.cfg.nss_disable_enumeration {
        return ctx.stream.end_results().await;
    }
    let flt = ctx.cfg.map_filter(MAP).to_string();
    let with_members = !ctx.cfg.nss_getgrent_skipmembers;
    write_results(ctx, &flt, with_members).await
}

/// Answer the initgroups question: all groups the named user belongs to.
pub async fn bymember<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("group/member=\"{}\": looking up groups", name);
    ctx.stream
        .write_response_header(Action::GroupByMember)
        .await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("group/member=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    if ctx.cfg.nss_initgroups_ignoreusers.contains(&name) {
        debug!("group/member=\"{}\": ignored by configuration", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let user = match uid2entry(ctx.session, &cfg, &name).await? {
        Some(entry) => entry,
        None => return ctx.stream.end_results().await,
    };
    let gids = if cfg.nss_initgroups_backlink {
        gids_from_backlink(ctx.session, &cfg, &user).await?
    } else {
        gids_from_search(ctx.session, &cfg, &name, user.dn()).await?
    };
    for gid in gids {
        // only the gid is meaningful here; the other fields stay empty
        ctx.stream.begin_record().await?;
        ctx.stream.write_string("").await?;
        ctx.stream.write_string("").await?;
        ctx.stream.write_i32(gid as i32).await?;
        ctx.stream.write_stringlist(&[]).await?;
    }
    ctx.stream.end_results().await
}

/// Reverse search: groups listing the user by name or by DN.
async fn gids_from_search(
    session: &mut Session,
    cfg: &Config,
    name: &str,
    dn: &str,
) -> Result<Vec<i64>> {
    let member_uid = cfg.attmap.attr(MAP, "memberUid");
    let member = cfg.attmap.attr(MAP, "member");
    let flt = format!(
        "(&{}(|({}={})({}={})))",
        cfg.map_filter(MAP),
        member_uid,
        filter::escape(name),
        member,
        filter::escape(dn)
    );
    let attrs = cfg.attmap.search_attrs(MAP, &["gidNumber"]);
    let mut gids = Vec::new();
    let mut search = Search::open(session, cfg.search_bases(MAP), &flt, attrs, false).await?;
    while let Some(entry) = search.next_entry().await? {
        if let Some(gid) =
            numeric_value(&entry, "gidNumber", cfg.attmap.value(MAP, "gidNumber", &entry))
        {
            if !gids.contains(&gid) {
                gids.push(gid);
            }
        }
    }
    search.close().await;
    Ok(gids)
}

/// Backlink mode: the user entry's `memberOf` values name the groups
/// directly, no reverse search needed.
async fn gids_from_backlink(
    session: &mut Session,
    cfg: &Config,
    user: &Entry,
) -> Result<Vec<i64>> {
    let user_bases = [SearchBase {
        base: user.dn().to_string(),
        scope: ldap3::Scope::Base,
        filter: None,
    }];
    let with_links = Search::find_first(
        session,
        &user_bases,
        "(objectClass=*)",
        vec!["memberOf".to_string()],
        false,
    )
    .await?;
    let group_dns: Vec<String> = with_links
        .as_ref()
        .map(|e| e.attrs("memberOf").into_iter().map(|v| v.to_string()).collect())
        .unwrap_or_default();
    let attrs = cfg.attmap.search_attrs(MAP, &["gidNumber"]);
    let mut gids = Vec::new();
    for dn in group_dns {
        let bases = [SearchBase {
            base: dn,
            scope: ldap3::Scope::Base,
            filter: None,
        }];
        let found = Search::find_first(
            session,
            &bases,
            cfg.map_filter(MAP),
            attrs.clone(),
            false,
        )
        .await?;
        if let Some(entry) = found {
            if let Some(gid) =
                numeric_value(&entry, "gidNumber", cfg.attmap.value(MAP, "gidNumber", &entry))
            {
                if !gids.contains(&gid) {
                    gids.push(gid);
                }
            }
        }
    }
    Ok(gids)
}

async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
    with_members: bool,
) -> Result<()> {
    let cfg = ctx.cfg.clone();
    let caller = ctx.caller;
    let attrs = cfg.attmap.search_attrs(MAP, &ATTRS);
    // entries are collected first: member resolution below runs its own
    // searches on the same session
    let mut entries = Vec::new();
    let mut search = Search::open(
        &mut *ctx.session,
        cfg.search_bases(MAP),
        flt,
        attrs,
        caller.is_root(),
    )
    .await?;
    while let Some(entry) = search.next_entry().await? {
        entries.push(entry);
    }
    search.close().await;
    let mut cache = DnCache::default();
    for entry in entries {
        let members = if with_members {
            collect_members(ctx.session, &cfg, &entry, &mut cache).await?
        } else {
            Vec::new()
        };
        write_entry(ctx.stream, &cfg, caller, &entry, members).await?;
    }
    ctx.stream.end_results().await
}

async fn write_entry<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut ProtoStream<S>,
    cfg: &Config,
    caller: Caller,
    entry: &Entry,
    members: Vec<String>,
) -> Result<()> {
    let cn_attr = cfg.attmap.attr(MAP, "cn");
    let names = entry.attrs(cn_attr);
    if names.is_empty() {
        warn!("{}: {}: missing", entry.dn(), cn_attr);
        return Ok(());
    }
    let gid = match numeric_value(entry, "gidNumber", cfg.attmap.value(MAP, "gidNumber", entry)) {
        Some(n) => n,
        None => {
            warn!("{}: gidNumber: missing", entry.dn());
            return Ok(());
        }
    };
    let passwd = user_password(cfg, MAP, entry, caller);
    for name in names {
        if !cfg.valid_name(name) {
            warn!("{}: {}: denied by validnames option", entry.dn(), cn_attr);
            continue;
        }
        stream.begin_record().await?;
        stream.write_string(name).await?;
        stream.write_string(&passwd).await?;
        stream.write_i32(gid as i32).await?;
        stream.write_stringlist(&members).await?;
    }
    Ok(())
}

/// Gather a group's member names: flat values, DN values, and nested
/// groups when enabled.
async fn collect_members(
    session: &mut Session,
    cfg: &Config,
    entry: &Entry,
    cache: &mut DnCache,
) -> Result<Vec<String>> {
    let mut members = Vec::new();
    let mut seen = NameList::default();
    seen.insert(entry.dn());
    let member_uid = cfg.attmap.attr(MAP, "memberUid");
    for name in entry.attrs(member_uid) {
        push_member(cfg, &mut members, name);
    }
    let member_attr = cfg.attmap.attr(MAP, "member").to_string();
    let dns = ranged_values(session, cfg, entry, &member_attr).await?;
    for dn in dns {
        chase_member(session, cfg, dn, &mut members, &mut seen, 0, cache).await?;
    }
    Ok(members)
}

fn push_member(cfg: &Config, members: &mut Vec<String>, name: &str) {
    if !cfg.valid_name(name) {
        debug!("member \"{}\" denied by validnames option", name);
        return;
    }
    if !members.iter().any(|m| cfg.name_eq(m, name)) {
        members.push(name.to_string());
    }
}

/// Resolve one member DN: a user contributes its login name, a nested
/// group (when enabled) contributes its own members, recursively.
fn chase_member<'a>(
    session: &'a mut Session,
    cfg: &'a Config,
    dn: String,
    members: &'a mut Vec<String>,
    seen: &'a mut NameList,
    depth: usize,
    cache: &'a mut DnCache,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if !seen.insert(&dn) {
            debug!("{}: skipping duplicate member", dn);
            return Ok(());
        }
        if let Some(uid) = dn2uid(session, cfg, &dn, cache).await? {
            push_member(cfg, members, &uid);
            return Ok(());
        }
        if !cfg.nss_nested_groups {
            return Ok(());
        }
        if depth >= MAX_NESTING_DEPTH {
            warn!("{}: maximum group nesting depth reached", dn);
            return Ok(());
        }
        let bases = [SearchBase {
            base: dn.clone(),
            scope: ldap3::Scope::Base,
            filter: None,
        }];
        let attrs = cfg.attmap.search_attrs(MAP, &["memberUid", "member"]);
        let nested =
            Search::find_first(session, &bases, cfg.map_filter(MAP), attrs, false).await?;
        let nested = match nested {
            Some(e) => e,
            None => {
                debug!("{}: not a user and not a group, ignored", dn);
                return Ok(());
            }
        };
        let member_uid = cfg.attmap.attr(MAP, "memberUid");
        for name in nested.attrs(member_uid) {
            push_member(cfg, members, name);
        }
        let member_attr = cfg.attmap.attr(MAP, "member").to_string();
        let dns = ranged_values(session, cfg, &nested, &member_attr).await?;
        for sub in dns {
            chase_member(session, cfg, sub, members, seen, depth + 1, cache).await?;
        }
        Ok(())
    })
}

/// A `;range=START-END` attribute option, as produced by servers that
/// chunk large multi-valued attributes. Both the attribute name and the
/// option keyword match case-insensitively, like everything else in
/// attribute descriptions.
fn parse_range_option(key: &str, attr: &str) -> Option<Option<u64>> {
    let rest = key
        .get(..attr.len())
        .filter(|head| head.eq_ignore_ascii_case(attr))
        .and_then(|_| key.get(attr.len()..))?;
    const MARKER: &str = ";range=";
    let spec = match rest.get(..MARKER.len()) {
        Some(head) if head.eq_ignore_ascii_case(MARKER) => rest.get(MARKER.len()..)?,
        _ => return None,
    };
    let (_, end) = spec.split_once('-')?;
    if end == "*" {
        Some(None)
    } else {
        end.parse::<u64>().ok().map(Some)
    }
}

/// Collect all values of `attr`, following range-retrieval continuations.
async fn ranged_values(
    session: &mut Session,
    cfg: &Config,
    entry: &Entry,
    attr: &str,
) -> Result<Vec<String>> {
    let mut values: Vec<String> = entry.attrs(attr).iter().map(|v| v.to_string()).collect();
    let mut current = entry.clone();
    // a server that keeps handing out ranges gets cut off eventually
    for _ in 0..64 {
        let mut next_start = None;
        for key in current.attr_names() {
            match parse_range_option(key, attr) {
                Some(end) => {
                    let key = key.to_string();
                    values.extend(current.attrs(&key).iter().map(|v| v.to_string()));
                    match end {
                        Some(end) => next_start = Some(end + 1),
                        None => return Ok(values),
                    }
                }
                None => continue,
            }
        }
        let start = match next_start {
            Some(s) => s,
            None => return Ok(values),
        };
        let bases = [SearchBase {
            base: entry.dn().to_string(),
            scope: ldap3::Scope::Base,
            filter: None,
        }];
        let range_attr = format!("{};range={}-*", attr, start);
        let found = Search::find_first(
            session,
            &bases,
            "(objectClass=*)",
            vec![range_attr],
            false,
        )
        .await?;
        match found {
            Some(e) => current = e,
            None => break,
        }
    }
    Ok(values)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_option_parsing() {
        assert_eq!(parse_range_option("member;range=0-1499", "member"), Some(Some(1499)));
        assert_eq!(parse_range_option("member;range=1500-*", "member"), Some(None));
        // attribute descriptions are case-insensitive throughout
        assert_eq!(parse_range_option("Member;Range=0-9", "member"), Some(Some(9)));
        assert_eq!(parse_range_option("member", "member"), None);
        assert_eq!(parse_range_option("uniqueMember;range=0-10", "member"), None);
    }

    #[test]
    fn name_list_is_case_insensitive() {
        let mut list = NameList::default();
        assert!(list.insert("cn=Admins,dc=x"));
        assert!(!list.insert("CN=ADMINS,DC=X"));
        assert!(list.insert("cn=ops,dc=x"));
    }
}
