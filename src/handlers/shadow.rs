//! Shadow database lookups.
//!
//! Record layout: name, password, last-change, min, max, warning,
//! inactive, expire, flag. The expiry fields are usually mapped through
//! value expressions with `-1` defaults; Active Directory deployments map
//! the last-change date to `pwdLastSet`, which uses 100-nanosecond
//! intervals since 1601 and is converted to days since the epoch here.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::{MapSelector, MapValue};
use crate::config::Config;
use crate::filter;
use crate::proto::{Action, ProtoStream, LIMIT_NAME};
use crate::result::Result;
use crate::search::{Entry, Search};
use crate::session::Session;

use super::{user_password, Caller, RequestCtx};

const MAP: MapSelector = MapSelector::Shadow;

const ATTRS: [&str; 9] = [
    "uid",
    "userPassword",
    "shadowLastChange",
    "shadowMin",
    "shadowMax",
    "shadowWarning",
    "shadowInactive",
    "shadowExpire",
    "shadowFlag",
];

/// Account flag bit meaning "password never expires" on Active Directory.
const UF_DONT_EXPIRE_PASSWD: i64 = 0x10000;

/// Parsed shadow expiry fields of one entry. Missing or unparseable
/// values take the conventional "not set" values (-1, or 0 for the flag).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowProps {
    pub lastchange: i64,
    pub mindays: i64,
    pub maxdays: i64,
    pub warndays: i64,
    pub inactdays: i64,
    pub expiredate: i64,
    pub flag: i64,
}

/// True when the last-change date is mapped to the AD `pwdLastSet`
/// attribute, which changes both the date format and the flag handling.
fn uses_pwdlastset(cfg: &Config) -> bool {
    matches!(
        cfg.attmap.resolve(MAP, "shadowLastChange"),
        MapValue::Attribute(name) if name.eq_ignore_ascii_case("pwdLastSet")
    )
}

/// Convert a date attribute value to days since the epoch.
///
/// `pwdLastSet` values count 100-nanosecond intervals since 1601; the
/// conversion divides by 864e9 and rebases, dropping the last nine digits
/// first so the arithmetic stays well inside 64 bits.
fn to_date(dn: &str, value: &str, ad_format: bool) -> i64 {
    if ad_format {
        let len = value.len().saturating_sub(9);
        if len == 0 || !value.chars().all(|c| c.is_ascii_digit()) {
            warn!("{}: pwdLastSet: non-numeric value", dn);
            return -1;
        }
        match value[..len].parse::<i64>() {
            Ok(n) => n / 864 - 134774,
            Err(_) => {
                warn!("{}: pwdLastSet: out of range", dn);
                -1
            }
        }
    } else {
        match value.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                warn!("{}: non-numeric date value \"{}\"", dn, value);
                -1
            }
        }
    }
}

fn numeric_field(cfg: &Config, entry: &Entry, logical: &str, fallback: i64) -> i64 {
    match cfg.attmap.value(MAP, logical, entry) {
        Some(v) => match v.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                warn!("{}: {}: non-numeric value", entry.dn(), logical);
                fallback
            }
        },
        None => fallback,
    }
}

/// Extract the shadow expiry properties from an entry.
pub fn shadow_properties(cfg: &Config, entry: &Entry) -> ShadowProps {
    let ad = uses_pwdlastset(cfg);
    let lastchange = match cfg.attmap.value(MAP, "shadowLastChange", entry) {
        Some(v) => to_date(entry.dn(), &v, ad),
        None => -1,
    };
    let mut props = ShadowProps {
        lastchange,
        mindays: numeric_field(cfg, entry, "shadowMin", -1),
        maxdays: numeric_field(cfg, entry, "shadowMax", -1),
        warndays: numeric_field(cfg, entry, "shadowWarning", -1),
        inactdays: numeric_field(cfg, entry, "shadowInactive", -1),
        expiredate: numeric_field(cfg, entry, "shadowExpire", -1),
        flag: numeric_field(cfg, entry, "shadowFlag", 0),
    };
    if ad {
        if props.flag & UF_DONT_EXPIRE_PASSWD != 0 {
            props.maxdays = -1;
        }
        props.flag = 0;
    }
    props
}

/// Look up the shadow entry for a user, for the PAM policy checks.
pub async fn shadow_uid2entry(
    session: &mut Session,
    cfg: &Config,
    username: &str,
) -> Result<Option<Entry>> {
    if !cfg.valid_name(username) {
        return Ok(None);
    }
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "uid"), username);
    let attrs = cfg.attmap.search_attrs(MAP, &ATTRS);
    Search::find_first(session, cfg.search_bases(MAP), &flt, attrs, false).await
}

pub async fn byname<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let name = ctx.stream.read_string(LIMIT_NAME).await?;
    debug!("shadow=\"{}\": looking up by name", name);
    ctx.stream.write_response_header(Action::ShadowByName).await?;
    if !ctx.cfg.valid_name(&name) {
        warn!("shadow=\"{}\": request denied by validnames option", name);
        return ctx.stream.end_results().await;
    }
    let cfg = ctx.cfg.clone();
    let flt = filter::and(cfg.map_filter(MAP), cfg.attmap.attr(MAP, "uid"), &name);
    write_results(ctx, &flt, Some(&name)).await
}

pub async fn all<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    debug!("shadow(all): enumeration request");
    ctx.stream.write_response_header(Action::ShadowAll).await?;
    if ctx.cfg.nss_disable_enumeration {
        return ctx.stream.end_results().await;
    }
    let flt = ctx.cfg.map_filter(MAP).to_string();
    write_results(ctx, &flt, None).await
}

async fn write_results<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
    flt: &str,
    requser: Option<&str>,
) -> Result<()> {
    let cfg = ctx.cfg.clone();
    let caller = ctx.caller;
    let attrs = cfg.attmap.search_attrs(MAP, &ATTRS);
    let mut search = Search::open(
        &mut *ctx.session,
        cfg.search_bases(MAP),
        flt,
        attrs,
        caller.is_root(),
    )
    .await?;
    while let Some(entry) = search.next_entry().await? {
        write_entry(ctx.stream, &cfg, caller, &entry, requser).await?;
    }
    search.close().await;
    ctx.stream.end_results().await
}

async fn write_entry<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut ProtoStream<S>,
    cfg: &Config,
    caller: Caller,
    entry: &Entry,
    requser: Option<&str>,
) -> Result<()> {
    let uid_attr = cfg.attmap.attr(MAP, "uid");
    let usernames = entry.attrs(uid_attr);
    if usernames.is_empty() {
        warn!("{}: {}: missing", entry.dn(), uid_attr);
        return Ok(());
    }
    let passwd = user_password(cfg, MAP, entry, caller);
    let props = shadow_properties(cfg, entry);
    for username in usernames {
        if let Some(requser) = requser {
            if !cfg.name_eq(requser, username) {
                continue;
            }
        }
        if !cfg.valid_name(username) {
            warn!("{}: {}: denied by validnames option", entry.dn(), uid_attr);
            continue;
        }
        stream.begin_record().await?;
        stream.write_string(username).await?;
        stream.write_string(&passwd).await?;
        stream.write_i32(props.lastchange as i32).await?;
        stream.write_i32(props.mindays as i32).await?;
        stream.write_i32(props.maxdays as i32).await?;
        stream.write_i32(props.warndays as i32).await?;
        stream.write_i32(props.inactdays as i32).await?;
        stream.write_i32(props.expiredate as i32).await?;
        stream.write_i32(props.flag as i32).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn base_cfg(extra: &str) -> Config {
        Config::parse(&format!("uri ldap://dir/\nbase dc=x\n{}", extra)).unwrap()
    }

    fn shadow_entry(attrs: &[(&str, &[&str])]) -> Entry {
        Entry::new("uid=carol,ou=People,dc=x", attrs)
    }

    #[test]
    fn defaults_when_attributes_absent() {
        let cfg = base_cfg("");
        let props = shadow_properties(&cfg, &shadow_entry(&[]));
        assert_eq!(
            props,
            ShadowProps {
                lastchange: -1,
                mindays: -1,
                maxdays: -1,
                warndays: -1,
                inactdays: -1,
                expiredate: -1,
                flag: 0,
            }
        );
    }

    #[test]
    fn plain_values_parse() {
        let cfg = base_cfg("");
        let props = shadow_properties(
            &cfg,
            &shadow_entry(&[
                ("shadowLastChange", &["19000"]),
                ("shadowMax", &["90"]),
                ("shadowExpire", &["10000"]),
            ]),
        );
        assert_eq!(props.lastchange, 19000);
        assert_eq!(props.maxdays, 90);
        assert_eq!(props.expiredate, 10000);
    }

    #[test]
    fn non_numeric_values_fall_back() {
        let cfg = base_cfg("");
        let props = shadow_properties(
            &cfg,
            &shadow_entry(&[("shadowMax", &["ninety"]), ("shadowLastChange", &["soon"])]),
        );
        assert_eq!(props.maxdays, -1);
        assert_eq!(props.lastchange, -1);
    }

    #[test]
    fn pwdlastset_conversion() {
        let cfg = base_cfg("map shadow shadowLastChange pwdLastSet\n");
        // 2021-09-01 00:00:00 UTC in 100ns-since-1601:
        // days-since-epoch 18871 -> (18871 + 134774) * 864 * 1e9
        let val = ((18871i64 + 134774) * 864).to_string() + "000000000";
        let props = shadow_properties(&cfg, &shadow_entry(&[("pwdLastSet", &[val.as_str()])]));
        assert_eq!(props.lastchange, 18871);
    }

    #[test]
    fn pwdlastset_dont_expire_flag() {
        let cfg = base_cfg(
            "map shadow shadowLastChange pwdLastSet\nmap shadow shadowFlag userAccountControl\n",
        );
        let props = shadow_properties(
            &cfg,
            &shadow_entry(&[
                ("pwdLastSet", &["133668000000000000"]),
                ("shadowMax", &["90"]),
                ("userAccountControl", &["66048"]), // 0x10200: NORMAL | DONT_EXPIRE
            ]),
        );
        assert_eq!(props.maxdays, -1);
        assert_eq!(props.flag, 0);
    }

    #[test]
    fn bad_pwdlastset_is_unset() {
        let cfg = base_cfg("map shadow shadowLastChange pwdLastSet\n");
        let props = shadow_properties(&cfg, &shadow_entry(&[("pwdLastSet", &["bogus"])]));
        assert_eq!(props.lastchange, -1);
    }
}
