//! Daemon configuration.
//!
//! The configuration file uses the traditional one-directive-per-line
//! format with `#` comments. Parsing produces an immutable [`Config`];
//! reloading requires a daemon restart. All option validation (URIs,
//! expressions, regexes, numeric ranges) happens here so later stages can
//! rely on well-formed values.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use ldap3::Scope;
use regex::Regex;
use url::Url;

use crate::attmap::{AttrMap, MapSelector};
use crate::expr::Expr;
use crate::result::{NsdError, Result};

/// Default socket path clients connect to.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/ldapnsd/socket";

/// Upper bound on configured `pam_authz_search` templates.
pub const MAX_AUTHZ_SEARCHES: usize = 8;

/// Maximum nesting depth for group and netgroup expansion.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Connection security for the directory link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SslMode {
    Off,
    /// TLS from the first byte (ldaps).
    On,
    StartTls,
}

/// Peer certificate checking policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsReqCert {
    Never,
    Allow,
    Try,
    Demand,
}

/// What to do when no directory server is reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Keep retrying the full URI list with back-off.
    HardOpen,
    HardInit,
    /// Give up after one full sweep of the URI list.
    Soft,
}

/// Identity used when binding to the directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindCreds {
    Anonymous,
    Simple { dn: String, password: String },
    SaslExternal { authzid: Option<String> },
}

/// One search descriptor: where and how to look for a map's entries.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchBase {
    pub base: String,
    pub scope: Scope,
    /// Extra filter term to AND into every search under this base.
    pub filter: Option<String>,
}

/// The `pam_authc_search` post-bind check.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthcSearch {
    /// BASE-scope read of the bound DN.
    Base,
    /// No check after the bind.
    None,
    /// Expand the template and search every base.
    Filter(Expr),
}

/// Immutable resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub uris: Vec<String>,
    pub ldap_version: i32,
    pub bind: BindCreds,
    pub rootbinddn: Option<String>,
    pub rootbindpw: Option<String>,
    pub rootsaslid: Option<String>,
    pub rootpwmoddn: Option<String>,
    pub rootpwmodpw: Option<String>,
    /// Global search bases, in priority order; maps without their own
    /// descriptors search these.
    pub bases_global: Vec<String>,
    pub scope: Scope,
    pub deref: i32,
    pub referrals: bool,
    pub timelimit: Option<Duration>,
    pub bind_timelimit: Duration,
    pub idle_timelimit: Option<Duration>,
    pub reconnect_sleeptime: Duration,
    pub reconnect_maxsleeptime: Duration,
    pub reconnect_maxconntries: u32,
    pub reconnect_tries: u32,
    pub bind_policy: ReconnectPolicy,
    pub connect_policy_oneshot: bool,
    pub ssl: SslMode,
    pub tls_reqcert: TlsReqCert,
    pub tls_cacertfile: Option<PathBuf>,
    pub tls_cacertdir: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub pagesize: i32,
    pub threads: usize,
    pub socket_path: PathBuf,
    pub run_uid: Option<u32>,
    pub run_gid: Option<u32>,
    pub ignorecase: bool,
    pub validnames: Regex,
    pub attmap: AttrMap,
    pub pam_authc_ppolicy: bool,
    pub pam_authc_search: AuthcSearch,
    pub pam_authz_searches: Vec<Expr>,
    pub pam_password_prohibit_message: Option<String>,
    pub nss_initgroups_ignoreusers: HashSet<String>,
    pub nss_min_uid: u32,
    pub nss_nested_groups: bool,
    pub nss_initgroups_backlink: bool,
    pub nss_getgrent_skipmembers: bool,
    pub nss_disable_enumeration: bool,
    pub reconnect_invalidate: HashSet<MapSelector>,
    bases: HashMap<MapSelector, Vec<SearchBase>>,
    filters: HashMap<MapSelector, String>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &std::path::Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NsdError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Config::parse(&text)
    }

    /// Parse configuration text. Exposed for tests.
    pub fn parse(text: &str) -> Result<Config> {
        let mut b = Builder::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            b.directive(line)
                .map_err(|e| NsdError::Config(format!("line {}: {}", lineno + 1, e)))?;
        }
        b.finish()
    }

    /// The ordered search descriptors for a map. Maps without specific
    /// descriptors fall back to the global base.
    pub fn search_bases(&self, map: MapSelector) -> &[SearchBase] {
        &self.bases[&map]
    }

    /// The base (objectClass) filter for a map, with `nss_map_objectclass`
    /// rewrites applied.
    pub fn map_filter(&self, map: MapSelector) -> &str {
        &self.filters[&map]
    }

    /// Check a user or group name against the `validnames` rule.
    pub fn valid_name(&self, name: &str) -> bool {
        !name.is_empty() && name.len() < 256 && self.validnames.is_match(name)
    }

    /// Case handling for name comparisons.
    pub fn name_eq(&self, a: &str, b: &str) -> bool {
        if self.ignorecase {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    }
}

/// The default (objectClass) filter for each map, before objectclass
/// rewrites.
fn default_class(map: MapSelector) -> &'static str {
    match map {
        MapSelector::Alias => "nisMailAlias",
        MapSelector::Ether => "ieee802Device",
        MapSelector::Group => "posixGroup",
        MapSelector::Host => "ipHost",
        MapSelector::Netgroup => "nisNetgroup",
        MapSelector::Network => "ipNetwork",
        MapSelector::Passwd => "posixAccount",
        MapSelector::Protocol => "ipProtocol",
        MapSelector::Rpc => "oncRpc",
        MapSelector::Service => "ipService",
        MapSelector::Shadow => "shadowAccount",
        MapSelector::Automount => "automount",
        MapSelector::NfsIdmap => "posixAccount",
    }
}

fn parse_scope(word: &str) -> std::result::Result<Scope, String> {
    match word.to_ascii_lowercase().as_str() {
        "base" => Ok(Scope::Base),
        "one" | "onelevel" => Ok(Scope::OneLevel),
        "sub" | "subtree" => Ok(Scope::Subtree),
        other => Err(format!("unknown scope \"{}\"", other)),
    }
}

fn parse_bool(word: &str) -> std::result::Result<bool, String> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "1" => Ok(true),
        "off" | "no" | "false" | "0" => Ok(false),
        other => Err(format!("not a boolean: \"{}\"", other)),
    }
}

fn parse_secs(word: &str) -> std::result::Result<Duration, String> {
    word.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("not a number of seconds: \"{}\"", word))
}

/// Split `base?scope?filter` search descriptor syntax. The boolean in the
/// result records whether the descriptor named its own scope.
fn parse_descriptor(raw: &str) -> std::result::Result<(SearchBase, bool), String> {
    let mut parts = raw.splitn(3, '?');
    let base = parts.next().unwrap_or("").to_string();
    if base.is_empty() {
        return Err("empty search base".to_string());
    }
    let (scope, explicit) = match parts.next() {
        Some("") | None => (Scope::Subtree, false),
        Some(word) => (parse_scope(word)?, true),
    };
    let filter = match parts.next() {
        Some("") | None => None,
        Some(f) => Some(f.to_string()),
    };
    Ok((SearchBase { base, scope, filter }, explicit))
}

#[derive(Default)]
struct Builder {
    uris: Vec<String>,
    ldap_version: Option<i32>,
    binddn: Option<String>,
    bindpw: Option<String>,
    sasl_mech: Option<String>,
    sasl_authzid: Option<String>,
    rootbinddn: Option<String>,
    rootbindpw: Option<String>,
    rootsaslid: Option<String>,
    rootpwmoddn: Option<String>,
    rootpwmodpw: Option<String>,
    base: Vec<String>,
    scope: Option<Scope>,
    deref: Option<i32>,
    referrals: Option<bool>,
    timelimit: Option<Duration>,
    bind_timelimit: Option<Duration>,
    idle_timelimit: Option<Duration>,
    reconnect_sleeptime: Option<Duration>,
    reconnect_maxsleeptime: Option<Duration>,
    reconnect_maxconntries: Option<u32>,
    reconnect_tries: Option<u32>,
    bind_policy: Option<ReconnectPolicy>,
    connect_policy_oneshot: bool,
    ssl: Option<SslMode>,
    tls_reqcert: Option<TlsReqCert>,
    tls_cacertfile: Option<PathBuf>,
    tls_cacertdir: Option<PathBuf>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    pagesize: Option<i32>,
    threads: Option<usize>,
    socket_path: Option<PathBuf>,
    run_uid: Option<u32>,
    run_gid: Option<u32>,
    ignorecase: bool,
    validnames: Option<Regex>,
    attmap: AttrMap,
    pam_authc_ppolicy: bool,
    pam_authc_search: Option<AuthcSearch>,
    pam_authz_searches: Vec<Expr>,
    pam_password_prohibit_message: Option<String>,
    nss_initgroups_ignoreusers: HashSet<String>,
    nss_min_uid: Option<u32>,
    nss_nested_groups: bool,
    nss_initgroups_backlink: bool,
    nss_getgrent_skipmembers: bool,
    nss_disable_enumeration: bool,
    reconnect_invalidate: HashSet<MapSelector>,
    map_bases: HashMap<MapSelector, Vec<(SearchBase, bool)>>,
    map_scopes: HashMap<MapSelector, Scope>,
    map_filters: HashMap<MapSelector, String>,
    objectclass_map: HashMap<String, String>,
}

impl Builder {
    fn directive(&mut self, line: &str) -> std::result::Result<(), String> {
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };
        let arg = || -> std::result::Result<&str, String> {
            if rest.is_empty() {
                Err(format!("{} requires an argument", keyword))
            } else {
                Ok(rest)
            }
        };
        match keyword.to_ascii_lowercase().as_str() {
            "uri" => {
                if rest.is_empty() {
                    return Err("uri requires an argument".to_string());
                }
                for word in rest.split_whitespace() {
                    let url = Url::parse(word).map_err(|e| format!("bad uri \"{}\": {}", word, e))?;
                    match url.scheme() {
                        "ldap" | "ldaps" | "ldapi" => {}
                        s => return Err(format!("unsupported URI scheme \"{}\"", s)),
                    }
                    self.uris.push(word.to_string());
                }
            }
            "ldap_version" => {
                let v: i32 = arg()?.parse().map_err(|_| "bad ldap_version".to_string())?;
                if v != 2 && v != 3 {
                    return Err(format!("unsupported ldap_version {}", v));
                }
                self.ldap_version = Some(v);
            }
            "binddn" => self.binddn = Some(arg()?.to_string()),
            "bindpw" => self.bindpw = Some(arg()?.to_string()),
            "sasl_mech" => self.sasl_mech = Some(arg()?.to_ascii_uppercase()),
            "sasl_authzid" => self.sasl_authzid = Some(arg()?.to_string()),
            "rootbinddn" => self.rootbinddn = Some(arg()?.to_string()),
            "rootbindpw" => self.rootbindpw = Some(arg()?.to_string()),
            "rootsaslid" => self.rootsaslid = Some(arg()?.to_string()),
            "rootpwmoddn" => self.rootpwmoddn = Some(arg()?.to_string()),
            "rootpwmodpw" => self.rootpwmodpw = Some(arg()?.to_string()),
            "base" => {
                if rest.is_empty() {
                    return Err("base requires an argument".to_string());
                }
                let mut words = rest.splitn(2, char::is_whitespace);
                let first = words.next().unwrap_or("");
                match (MapSelector::from_name(first), words.next()) {
                    (Some(map), Some(desc)) => {
                        self.map_bases
                            .entry(map)
                            .or_default()
                            .push(parse_descriptor(desc.trim())?);
                    }
                    (_, None) => self.base.push(first.to_string()),
                    (None, Some(_)) => return Err(format!("unknown map \"{}\"", first)),
                }
            }
            "scope" => {
                let mut words = rest.split_whitespace();
                let first = words.next().ok_or("scope requires an argument")?;
                match (MapSelector::from_name(first), words.next()) {
                    (Some(map), Some(word)) => {
                        self.map_scopes.insert(map, parse_scope(word)?);
                    }
                    (_, None) => self.scope = Some(parse_scope(first)?),
                    (None, Some(_)) => return Err(format!("unknown map \"{}\"", first)),
                }
            }
            "filter" => {
                let (map, filter) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("filter requires a map and a filter")?;
                let map =
                    MapSelector::from_name(map).ok_or(format!("unknown map \"{}\"", map))?;
                self.map_filters.insert(map, filter.trim().to_string());
            }
            "map" => {
                let mut words = rest.splitn(3, char::is_whitespace);
                let map = words.next().ok_or("map requires arguments")?;
                let logical = words.next().ok_or("map requires a logical attribute")?;
                let value = words.next().ok_or("map requires a value")?.trim();
                let map =
                    MapSelector::from_name(map).ok_or(format!("unknown map \"{}\"", map))?;
                self.attmap
                    .set(map, logical, value)
                    .map_err(|e| e.to_string())?;
            }
            "nss_map_attribute" => {
                let (logical, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("nss_map_attribute requires two arguments")?;
                self.map_all(logical, value.trim())?;
            }
            "nss_map_objectclass" => {
                let (from, to) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("nss_map_objectclass requires two arguments")?;
                self.objectclass_map
                    .insert(from.to_string(), to.trim().to_string());
            }
            "nss_override_attribute_value" => {
                let (logical, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("nss_override_attribute_value requires two arguments")?;
                self.map_all(logical, &format!("\"{}\"", value.trim()))?;
            }
            "nss_default_attribute_value" => {
                let (logical, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("nss_default_attribute_value requires two arguments")?;
                self.map_all(logical, &format!("\"${{{}:-{}}}\"", logical, value.trim()))?;
            }
            "deref" => {
                self.deref = Some(match arg()?.to_ascii_lowercase().as_str() {
                    "never" => 0,
                    "searching" => 1,
                    "finding" => 2,
                    "always" => 3,
                    other => return Err(format!("unknown deref policy \"{}\"", other)),
                });
            }
            "referrals" => self.referrals = Some(parse_bool(arg()?)?),
            "timelimit" => {
                let d = parse_secs(arg()?)?;
                self.timelimit = if d.is_zero() { None } else { Some(d) };
            }
            "bind_timelimit" => self.bind_timelimit = Some(parse_secs(arg()?)?),
            "idle_timelimit" => {
                let d = parse_secs(arg()?)?;
                self.idle_timelimit = if d.is_zero() { None } else { Some(d) };
            }
            "reconnect_sleeptime" => self.reconnect_sleeptime = Some(parse_secs(arg()?)?),
            "reconnect_maxsleeptime" | "reconnect_retrytime" => {
                self.reconnect_maxsleeptime = Some(parse_secs(arg()?)?)
            }
            "reconnect_maxconntries" => {
                self.reconnect_maxconntries =
                    Some(arg()?.parse().map_err(|_| "bad try count".to_string())?)
            }
            "reconnect_tries" => {
                self.reconnect_tries =
                    Some(arg()?.parse().map_err(|_| "bad try count".to_string())?)
            }
            "bind_policy" => {
                self.bind_policy = Some(match arg()?.to_ascii_lowercase().as_str() {
                    "hard" | "hard_open" => ReconnectPolicy::HardOpen,
                    "hard_init" => ReconnectPolicy::HardInit,
                    "soft" => ReconnectPolicy::Soft,
                    other => return Err(format!("unknown bind_policy \"{}\"", other)),
                });
            }
            "connect_policy" => match arg()?.to_ascii_lowercase().as_str() {
                "oneshot" => self.connect_policy_oneshot = true,
                "persist" => self.connect_policy_oneshot = false,
                other => return Err(format!("unknown connect_policy \"{}\"", other)),
            },
            "ssl" => {
                self.ssl = Some(match arg()?.to_ascii_lowercase().as_str() {
                    "off" | "no" => SslMode::Off,
                    "on" | "yes" => SslMode::On,
                    "start_tls" | "starttls" => SslMode::StartTls,
                    other => return Err(format!("unknown ssl mode \"{}\"", other)),
                });
            }
            "tls_reqcert" => {
                self.tls_reqcert = Some(match arg()?.to_ascii_lowercase().as_str() {
                    "never" | "no" => TlsReqCert::Never,
                    "allow" => TlsReqCert::Allow,
                    "try" => TlsReqCert::Try,
                    "demand" | "yes" | "hard" => TlsReqCert::Demand,
                    other => return Err(format!("unknown tls_reqcert \"{}\"", other)),
                });
            }
            "tls_cacertfile" => self.tls_cacertfile = Some(PathBuf::from(arg()?)),
            "tls_cacertdir" => self.tls_cacertdir = Some(PathBuf::from(arg()?)),
            "tls_cert" => self.tls_cert = Some(PathBuf::from(arg()?)),
            "tls_key" => self.tls_key = Some(PathBuf::from(arg()?)),
            "pagesize" => {
                self.pagesize = Some(arg()?.parse().map_err(|_| "bad pagesize".to_string())?)
            }
            "threads" => {
                let n: usize = arg()?.parse().map_err(|_| "bad thread count".to_string())?;
                if n == 0 || n > 64 {
                    return Err(format!("thread count {} out of range", n));
                }
                self.threads = Some(n);
            }
            "socket" => self.socket_path = Some(PathBuf::from(arg()?)),
            "uid" => {
                self.run_uid = Some(
                    arg()?
                        .parse()
                        .map_err(|_| "uid must be numeric".to_string())?,
                )
            }
            "gid" => {
                self.run_gid = Some(
                    arg()?
                        .parse()
                        .map_err(|_| "gid must be numeric".to_string())?,
                )
            }
            "ignorecase" => self.ignorecase = parse_bool(arg()?)?,
            "validnames" => {
                let raw = arg()?;
                // the rule is written /regex/ or /regex/i
                let (pattern, nocase) = match raw.strip_prefix('/') {
                    Some(tail) => match tail.rsplit_once('/') {
                        Some((pat, "i")) => (pat, true),
                        Some((pat, "")) => (pat, false),
                        _ => return Err(format!("bad validnames \"{}\"", raw)),
                    },
                    None => (raw, false),
                };
                let pattern = if nocase {
                    format!("(?i){}", pattern)
                } else {
                    pattern.to_string()
                };
                self.validnames =
                    Some(Regex::new(&pattern).map_err(|e| format!("bad validnames: {}", e))?);
            }
            "pam_authc_ppolicy" => self.pam_authc_ppolicy = parse_bool(arg()?)?,
            "pam_authc_search" => {
                self.pam_authc_search = Some(match arg()? {
                    s if s.eq_ignore_ascii_case("base") => AuthcSearch::Base,
                    s if s.eq_ignore_ascii_case("none") => AuthcSearch::None,
                    template => {
                        AuthcSearch::Filter(Expr::parse(template).map_err(|e| e.to_string())?)
                    }
                });
            }
            "pam_authz_search" => {
                if self.pam_authz_searches.len() >= MAX_AUTHZ_SEARCHES {
                    return Err(format!(
                        "at most {} pam_authz_search options allowed",
                        MAX_AUTHZ_SEARCHES
                    ));
                }
                self.pam_authz_searches
                    .push(Expr::parse(arg()?).map_err(|e| e.to_string())?);
            }
            "pam_password_prohibit_message" => {
                self.pam_password_prohibit_message =
                    Some(arg()?.trim_matches('"').to_string());
            }
            "nss_initgroups_ignoreusers" => {
                for user in rest.split(|c: char| c == ',' || c.is_whitespace()) {
                    if !user.is_empty() {
                        self.nss_initgroups_ignoreusers.insert(user.to_string());
                    }
                }
            }
            "nss_min_uid" => {
                self.nss_min_uid = Some(arg()?.parse().map_err(|_| "bad nss_min_uid".to_string())?)
            }
            "nss_nested_groups" => self.nss_nested_groups = parse_bool(arg()?)?,
            "nss_initgroups_backlink" => self.nss_initgroups_backlink = parse_bool(arg()?)?,
            "nss_getgrent_skipmembers" => self.nss_getgrent_skipmembers = parse_bool(arg()?)?,
            "nss_disable_enumeration" => self.nss_disable_enumeration = parse_bool(arg()?)?,
            "reconnect_invalidate" => {
                for name in rest.split(|c: char| c == ',' || c.is_whitespace()) {
                    if name.is_empty() {
                        continue;
                    }
                    let map = MapSelector::from_name(name)
                        .ok_or(format!("unknown map \"{}\"", name))?;
                    self.reconnect_invalidate.insert(map);
                }
            }
            other if other.starts_with("nss_base_") => {
                let map = MapSelector::from_name(&keyword["nss_base_".len()..])
                    .ok_or(format!("unknown map in \"{}\"", keyword))?;
                self.map_bases
                    .entry(map)
                    .or_default()
                    .push(parse_descriptor(arg()?)?);
            }
            other => return Err(format!("unknown directive \"{}\"", other)),
        }
        Ok(())
    }

    /// Apply a mapping to every map that knows the logical name.
    fn map_all(&mut self, logical: &str, value: &str) -> std::result::Result<(), String> {
        let mut applied = false;
        for map in MapSelector::ALL {
            if self.attmap.set(map, logical, value).is_ok() {
                applied = true;
            }
        }
        if applied {
            Ok(())
        } else {
            Err(format!("unknown attribute \"{}\"", logical))
        }
    }

    fn finish(mut self) -> Result<Config> {
        if self.uris.is_empty() {
            return Err(NsdError::Config("no uri configured".to_string()));
        }
        if self.base.is_empty() {
            return Err(NsdError::Config("no search base configured".to_string()));
        }
        let bases_global = self.base.clone();
        let scope = self.scope.unwrap_or(Scope::Subtree);
        let bind = match (&self.sasl_mech, &self.binddn) {
            (Some(mech), _) if mech == "EXTERNAL" => BindCreds::SaslExternal {
                authzid: self.sasl_authzid.clone(),
            },
            (Some(mech), _) => {
                return Err(NsdError::Config(format!(
                    "unsupported sasl_mech \"{}\" (only EXTERNAL is available)",
                    mech
                )))
            }
            (None, Some(dn)) => BindCreds::Simple {
                dn: dn.clone(),
                password: self.bindpw.clone().unwrap_or_default(),
            },
            (None, None) => BindCreds::Anonymous,
        };
        // resolve per-map search bases; maps without descriptors use the
        // global base with the map scope
        let mut bases = HashMap::new();
        let mut filters = HashMap::new();
        for map in MapSelector::ALL {
            let scope_for_map = self
                .map_scopes
                .get(&map)
                .copied()
                .unwrap_or(scope);
            let list = match self.map_bases.remove(&map) {
                Some(list) => list
                    .into_iter()
                    .map(|(mut sb, explicit)| {
                        if !explicit {
                            sb.scope = scope_for_map;
                        }
                        sb
                    })
                    .collect(),
                None => bases_global
                    .iter()
                    .map(|base| SearchBase {
                        base: base.clone(),
                        scope: scope_for_map,
                        filter: None,
                    })
                    .collect(),
            };
            bases.insert(map, list);
            let filter = match self.map_filters.get(&map) {
                Some(f) => f.clone(),
                None => {
                    let class = default_class(map);
                    let class = self
                        .objectclass_map
                        .get(class)
                        .map(String::as_str)
                        .unwrap_or(class);
                    format!("(objectClass={})", class)
                }
            };
            filters.insert(map, filter);
        }
        let validnames = match self.validnames {
            Some(re) => re,
            // the compiled-in default accepts typical POSIX names and
            // rejects filter metacharacters
            None => Regex::new(
                r"(?i)^[a-z0-9._@$()]([a-z0-9._@$() \\~-]*[a-z0-9._@$()~-])?$",
            )
            .expect("default validnames"),
        };
        Ok(Config {
            uris: self.uris,
            ldap_version: self.ldap_version.unwrap_or(3),
            bind,
            rootbinddn: self.rootbinddn,
            rootbindpw: self.rootbindpw,
            rootsaslid: self.rootsaslid,
            rootpwmoddn: self.rootpwmoddn,
            rootpwmodpw: self.rootpwmodpw,
            bases_global,
            scope,
            deref: self.deref.unwrap_or(0),
            referrals: self.referrals.unwrap_or(true),
            timelimit: self.timelimit,
            bind_timelimit: self.bind_timelimit.unwrap_or(Duration::from_secs(10)),
            idle_timelimit: self.idle_timelimit,
            reconnect_sleeptime: self.reconnect_sleeptime.unwrap_or(Duration::from_secs(1)),
            reconnect_maxsleeptime: self
                .reconnect_maxsleeptime
                .unwrap_or(Duration::from_secs(30)),
            reconnect_maxconntries: self.reconnect_maxconntries.unwrap_or(2),
            reconnect_tries: self.reconnect_tries.unwrap_or(4),
            bind_policy: self.bind_policy.unwrap_or(ReconnectPolicy::HardOpen),
            connect_policy_oneshot: self.connect_policy_oneshot,
            ssl: self.ssl.unwrap_or(SslMode::Off),
            tls_reqcert: self.tls_reqcert.unwrap_or(TlsReqCert::Demand),
            tls_cacertfile: self.tls_cacertfile,
            tls_cacertdir: self.tls_cacertdir,
            tls_cert: self.tls_cert,
            tls_key: self.tls_key,
            pagesize: self.pagesize.unwrap_or(0),
            threads: self.threads.unwrap_or(5),
            socket_path: self
                .socket_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            run_uid: self.run_uid,
            run_gid: self.run_gid,
            ignorecase: self.ignorecase,
            validnames,
            attmap: self.attmap,
            pam_authc_ppolicy: self.pam_authc_ppolicy,
            pam_authc_search: self.pam_authc_search.unwrap_or(AuthcSearch::Base),
            pam_authz_searches: self.pam_authz_searches,
            pam_password_prohibit_message: self.pam_password_prohibit_message,
            nss_initgroups_ignoreusers: self.nss_initgroups_ignoreusers,
            nss_min_uid: self.nss_min_uid.unwrap_or(0),
            nss_nested_groups: self.nss_nested_groups,
            nss_initgroups_backlink: self.nss_initgroups_backlink,
            nss_getgrent_skipmembers: self.nss_getgrent_skipmembers,
            nss_disable_enumeration: self.nss_disable_enumeration,
            reconnect_invalidate: self.reconnect_invalidate,
            bases,
            filters,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = "uri ldap://dir.example/\nbase dc=example,dc=com\n";

    #[test]
    fn minimal_config() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.uris, vec!["ldap://dir.example/"]);
        assert_eq!(cfg.bases_global, vec!["dc=example,dc=com"]);
        assert_eq!(cfg.threads, 5);
        assert_eq!(cfg.bind, BindCreds::Anonymous);
        assert_eq!(cfg.scope, Scope::Subtree);
        let bases = cfg.search_bases(MapSelector::Passwd);
        assert_eq!(bases.len(), 1);
        assert_eq!(bases[0].base, "dc=example,dc=com");
    }

    #[test]
    fn missing_base_is_an_error() {
        assert!(Config::parse("uri ldap://dir.example/\n").is_err());
    }

    #[test]
    fn missing_uri_is_an_error() {
        assert!(Config::parse("base dc=example,dc=com\n").is_err());
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let text = format!("{}frobnicate on\n", MINIMAL);
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let text = "# a comment\n\nuri ldap://dir.example/\n  # indented comment\nbase dc=x\n";
        assert!(Config::parse(text).is_ok());
    }

    #[test]
    fn multiple_uris_keep_order() {
        let text = "uri ldap://a/ ldap://b/\nuri ldaps://c/\nbase dc=x\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.uris, vec!["ldap://a/", "ldap://b/", "ldaps://c/"]);
    }

    #[test]
    fn bad_uri_scheme_rejected() {
        assert!(Config::parse("uri http://dir/\nbase dc=x\n").is_err());
    }

    #[test]
    fn per_map_search_descriptor() {
        let text = "uri ldap://dir/\nbase dc=x\n\
                    base passwd ou=People,dc=x?one?(ou=staff)\n\
                    base passwd ou=Admins,dc=x\n";
        let cfg = Config::parse(text).unwrap();
        let bases = cfg.search_bases(MapSelector::Passwd);
        assert_eq!(bases.len(), 2);
        assert_eq!(bases[0].base, "ou=People,dc=x");
        assert_eq!(bases[0].scope, Scope::OneLevel);
        assert_eq!(bases[0].filter.as_deref(), Some("(ou=staff)"));
        assert_eq!(bases[1].base, "ou=Admins,dc=x");
        assert_eq!(bases[1].scope, Scope::Subtree);
        // other maps still use the global base
        assert_eq!(cfg.search_bases(MapSelector::Group)[0].base, "dc=x");
    }

    #[test]
    fn nss_base_syntax() {
        let text = "uri ldap://dir/\nbase dc=x\nnss_base_group ou=Groups,dc=x?sub?\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.search_bases(MapSelector::Group)[0].base, "ou=Groups,dc=x");
    }

    #[test]
    fn simple_bind_credentials() {
        let text = "uri ldap://dir/\nbase dc=x\nbinddn cn=proxy,dc=x\nbindpw hunter2\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(
            cfg.bind,
            BindCreds::Simple {
                dn: "cn=proxy,dc=x".to_string(),
                password: "hunter2".to_string()
            }
        );
    }

    #[test]
    fn sasl_external() {
        let text = "uri ldapi:///\nbase dc=x\nsasl_mech EXTERNAL\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.bind, BindCreds::SaslExternal { authzid: None });
    }

    #[test]
    fn unsupported_sasl_mech_rejected() {
        let text = "uri ldap://dir/\nbase dc=x\nsasl_mech DIGEST-MD5\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn objectclass_rewrite_lands_in_filter() {
        let text = "uri ldap://dir/\nbase dc=x\nnss_map_objectclass posixAccount user\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.map_filter(MapSelector::Passwd), "(objectClass=user)");
        assert_eq!(cfg.map_filter(MapSelector::Group), "(objectClass=posixGroup)");
    }

    #[test]
    fn filter_override_is_verbatim() {
        let text = "uri ldap://dir/\nbase dc=x\nfilter passwd (&(objectClass=user)(!(lockout=TRUE)))\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(
            cfg.map_filter(MapSelector::Passwd),
            "(&(objectClass=user)(!(lockout=TRUE)))"
        );
    }

    #[test]
    fn attribute_mapping_directives() {
        let text = "uri ldap://dir/\nbase dc=x\n\
                    map passwd homeDirectory unixHomeDirectory\n\
                    nss_override_attribute_value loginShell /bin/bash\n\
                    nss_default_attribute_value gidNumber 100\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(
            cfg.attmap.attr(MapSelector::Passwd, "homeDirectory"),
            "unixHomeDirectory"
        );
    }

    #[test]
    fn timers_and_retry_policy() {
        let text = "uri ldap://dir/\nbase dc=x\n\
                    timelimit 0\nbind_timelimit 5\nidle_timelimit 60\n\
                    reconnect_sleeptime 2\nreconnect_maxsleeptime 16\nbind_policy soft\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.timelimit, None);
        assert_eq!(cfg.bind_timelimit, Duration::from_secs(5));
        assert_eq!(cfg.idle_timelimit, Some(Duration::from_secs(60)));
        assert_eq!(cfg.reconnect_sleeptime, Duration::from_secs(2));
        assert_eq!(cfg.reconnect_maxsleeptime, Duration::from_secs(16));
        assert_eq!(cfg.bind_policy, ReconnectPolicy::Soft);
    }

    #[test]
    fn pam_directives() {
        let text = "uri ldap://dir/\nbase dc=x\n\
                    pam_authc_search NONE\n\
                    pam_authz_search (&(objectClass=posixAccount)(uid=$username)(host=$hostname))\n\
                    pam_password_prohibit_message \"use the portal\"\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.pam_authc_search, AuthcSearch::None);
        assert_eq!(cfg.pam_authz_searches.len(), 1);
        assert_eq!(
            cfg.pam_password_prohibit_message.as_deref(),
            Some("use the portal")
        );
    }

    #[test]
    fn authz_search_cap_enforced() {
        let mut text = String::from("uri ldap://dir/\nbase dc=x\n");
        for _ in 0..=MAX_AUTHZ_SEARCHES {
            text.push_str("pam_authz_search (uid=$username)\n");
        }
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn default_validnames() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert!(cfg.valid_name("alice"));
        assert!(cfg.valid_name("svc$account"));
        assert!(cfg.valid_name("First.Last@example.com"));
        assert!(!cfg.valid_name(""));
        assert!(!cfg.valid_name("a*b"));
        assert!(!cfg.valid_name(" leading"));
    }

    #[test]
    fn custom_validnames() {
        let text = format!("{}validnames /^[a-z]+$/\n", MINIMAL);
        let cfg = Config::parse(&text).unwrap();
        assert!(cfg.valid_name("alice"));
        assert!(!cfg.valid_name("Alice"));
    }

    #[test]
    fn reconnect_invalidate_maps() {
        let text = format!("{}reconnect_invalidate passwd,group nfsidmap\n", MINIMAL);
        let cfg = Config::parse(&text).unwrap();
        assert!(cfg.reconnect_invalidate.contains(&MapSelector::Passwd));
        assert!(cfg.reconnect_invalidate.contains(&MapSelector::Group));
        assert!(cfg.reconnect_invalidate.contains(&MapSelector::NfsIdmap));
    }

    #[test]
    fn initgroups_ignoreusers() {
        let text = format!("{}nss_initgroups_ignoreusers root,daemon backup\n", MINIMAL);
        let cfg = Config::parse(&text).unwrap();
        assert!(cfg.nss_initgroups_ignoreusers.contains("root"));
        assert!(cfg.nss_initgroups_ignoreusers.contains("daemon"));
        assert!(cfg.nss_initgroups_ignoreusers.contains("backup"));
    }
}
