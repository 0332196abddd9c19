//! Schema mapping between logical attribute names and directory attributes.
//!
//! Every database has a compiled-in default mapping which configuration
//! directives may override per map. Mapping values are either plain
//! directory attribute names or quoted expressions in the template language
//! of [`crate::expr`]; expressions are compiled when the override is
//! installed so bad ones fail configuration loading.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

use crate::expr::Expr;
use crate::result::{NsdError, Result};
use crate::search::Entry;

/// Database selector, used for attribute maps, search descriptors and
/// cache invalidation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapSelector {
    Alias,
    Ether,
    Group,
    Host,
    Netgroup,
    Network,
    Passwd,
    Protocol,
    Rpc,
    Service,
    Shadow,
    Automount,
    NfsIdmap,
}

impl MapSelector {
    pub const ALL: [MapSelector; 13] = [
        MapSelector::Alias,
        MapSelector::Ether,
        MapSelector::Group,
        MapSelector::Host,
        MapSelector::Netgroup,
        MapSelector::Network,
        MapSelector::Passwd,
        MapSelector::Protocol,
        MapSelector::Rpc,
        MapSelector::Service,
        MapSelector::Shadow,
        MapSelector::Automount,
        MapSelector::NfsIdmap,
    ];

    /// Configuration file name of the map.
    pub fn name(self) -> &'static str {
        match self {
            MapSelector::Alias => "aliases",
            MapSelector::Ether => "ethers",
            MapSelector::Group => "group",
            MapSelector::Host => "hosts",
            MapSelector::Netgroup => "netgroup",
            MapSelector::Network => "networks",
            MapSelector::Passwd => "passwd",
            MapSelector::Protocol => "protocols",
            MapSelector::Rpc => "rpc",
            MapSelector::Service => "services",
            MapSelector::Shadow => "shadow",
            MapSelector::Automount => "automount",
            MapSelector::NfsIdmap => "nfsidmap",
        }
    }

    pub fn from_name(name: &str) -> Option<MapSelector> {
        MapSelector::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    /// One-byte invalidation code; 0 is reserved for "all configured maps".
    pub fn code(self) -> u8 {
        match self {
            MapSelector::Alias => 1,
            MapSelector::Ether => 2,
            MapSelector::Group => 3,
            MapSelector::Host => 4,
            MapSelector::Netgroup => 5,
            MapSelector::Network => 6,
            MapSelector::Passwd => 7,
            MapSelector::Protocol => 8,
            MapSelector::Rpc => 9,
            MapSelector::Service => 10,
            MapSelector::Shadow => 11,
            MapSelector::Automount => 12,
            MapSelector::NfsIdmap => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<MapSelector> {
        MapSelector::ALL.iter().copied().find(|m| m.code() == code)
    }
}

impl fmt::Display for MapSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A mapping target: a directory attribute or a value expression.
#[derive(Clone, Debug, PartialEq)]
pub enum MapValue {
    Attribute(String),
    Expression(Expr),
}

impl MapValue {
    /// Parse a mapping value as written in the configuration file. Quoted
    /// values are expressions; everything else is an attribute name.
    pub fn parse(raw: &str) -> Result<MapValue> {
        if let Some(inner) = raw.strip_prefix('"') {
            let inner = inner
                .strip_suffix('"')
                .ok_or_else(|| NsdError::Config(format!("unterminated expression {}", raw)))?;
            Ok(MapValue::Expression(Expr::parse(inner)?))
        } else if raw.is_empty() {
            Err(NsdError::Config("empty attribute mapping".to_string()))
        } else {
            Ok(MapValue::Attribute(raw.to_string()))
        }
    }

    /// The directory attributes a search must request for this value.
    pub fn attr_names(&self) -> Vec<String> {
        match self {
            MapValue::Attribute(name) => vec![name.clone()],
            MapValue::Expression(expr) => expr.var_names(),
        }
    }
}

lazy_static! {
    static ref DEFAULTS: HashMap<(MapSelector, &'static str), MapValue> = {
        use MapSelector::*;
        let table: &[(MapSelector, &str, &str)] = &[
            (Alias, "cn", "cn"),
            (Alias, "rfc822MailMember", "rfc822MailMember"),
            (Ether, "cn", "cn"),
            (Ether, "macAddress", "macAddress"),
            (Group, "cn", "cn"),
            (Group, "userPassword", "\"*\""),
            (Group, "gidNumber", "gidNumber"),
            (Group, "memberUid", "memberUid"),
            (Group, "member", "member"),
            (Host, "cn", "cn"),
            (Host, "ipHostNumber", "ipHostNumber"),
            (Netgroup, "cn", "cn"),
            (Netgroup, "nisNetgroupTriple", "nisNetgroupTriple"),
            (Netgroup, "memberNisNetgroup", "memberNisNetgroup"),
            (Network, "cn", "cn"),
            (Network, "ipNetworkNumber", "ipNetworkNumber"),
            (Passwd, "uid", "uid"),
            (Passwd, "userPassword", "\"*\""),
            (Passwd, "uidNumber", "uidNumber"),
            (Passwd, "gidNumber", "gidNumber"),
            (Passwd, "gecos", "\"${gecos:-$cn}\""),
            (Passwd, "cn", "cn"),
            (Passwd, "homeDirectory", "homeDirectory"),
            (Passwd, "loginShell", "loginShell"),
            (Protocol, "cn", "cn"),
            (Protocol, "ipProtocolNumber", "ipProtocolNumber"),
            (Rpc, "cn", "cn"),
            (Rpc, "oncRpcNumber", "oncRpcNumber"),
            (Service, "cn", "cn"),
            (Service, "ipServicePort", "ipServicePort"),
            (Service, "ipServiceProtocol", "ipServiceProtocol"),
            (Shadow, "uid", "uid"),
            (Shadow, "userPassword", "\"*\""),
            (Shadow, "shadowLastChange", "\"${shadowLastChange:--1}\""),
            (Shadow, "shadowMin", "\"${shadowMin:--1}\""),
            (Shadow, "shadowMax", "\"${shadowMax:--1}\""),
            (Shadow, "shadowWarning", "\"${shadowWarning:--1}\""),
            (Shadow, "shadowInactive", "\"${shadowInactive:--1}\""),
            (Shadow, "shadowExpire", "\"${shadowExpire:--1}\""),
            (Shadow, "shadowFlag", "\"${shadowFlag:-0}\""),
            (Automount, "automountMapName", "automountMapName"),
            (Automount, "automountKey", "automountKey"),
            (Automount, "automountInformation", "automountInformation"),
        ];
        table
            .iter()
            .map(|(map, logical, value)| {
                ((*map, *logical), MapValue::parse(value).expect("default mapping"))
            })
            .collect()
    };
}

/// The attribute mapping table: compiled-in defaults overlaid with
/// configuration overrides. Immutable after configuration load.
#[derive(Clone, Debug, Default)]
pub struct AttrMap {
    overrides: HashMap<(MapSelector, String), MapValue>,
}

impl AttrMap {
    pub fn new() -> AttrMap {
        AttrMap::default()
    }

    /// Install an override for `(map, logical)`. The logical name must have
    /// a compiled-in default.
    pub fn set(&mut self, map: MapSelector, logical: &str, raw: &str) -> Result<()> {
        let key = default_key(map, logical).ok_or_else(|| {
            NsdError::Config(format!("unknown attribute {}.{}", map, logical))
        })?;
        let value = MapValue::parse(raw)?;
        self.overrides.insert((map, key.to_string()), value);
        Ok(())
    }

    /// Resolve a logical name to its mapping value.
    pub fn resolve(&self, map: MapSelector, logical: &str) -> &MapValue {
        if let Some(key) = default_key(map, logical) {
            if let Some(value) = self.overrides.get(&(map, key.to_string())) {
                return value;
            }
            return &DEFAULTS[&(map, key)];
        }
        panic!("no compiled-in mapping for {}.{}", map, logical);
    }

    /// Resolve a logical name to a directory attribute name for use in
    /// filters. Expression mappings fall back to the logical name itself
    /// since an expression cannot appear on the left side of a filter term.
    pub fn attr<'a>(&'a self, map: MapSelector, logical: &'a str) -> &'a str {
        match self.resolve(map, logical) {
            MapValue::Attribute(name) => name,
            MapValue::Expression(_) => logical,
        }
    }

    /// Reverse lookup: find the logical name a directory attribute is
    /// mapped from. An unmapped attribute maps to itself.
    pub fn reverse<'a>(&'a self, map: MapSelector, dir_name: &'a str) -> &'a str {
        for ((m, logical), value) in self.overrides.iter() {
            if *m == map {
                if let MapValue::Attribute(name) = value {
                    if name.eq_ignore_ascii_case(dir_name) {
                        return logical;
                    }
                }
            }
        }
        for ((m, logical), value) in DEFAULTS.iter() {
            if *m == map && !self.overrides.contains_key(&(map, logical.to_string())) {
                if let MapValue::Attribute(name) = value {
                    if name.eq_ignore_ascii_case(dir_name) {
                        return logical;
                    }
                }
            }
        }
        dir_name
    }

    /// Evaluate a logical attribute against an entry.
    pub fn value(&self, map: MapSelector, logical: &str, entry: &Entry) -> Option<String> {
        match self.resolve(map, logical) {
            MapValue::Attribute(name) => entry.attr(name).map(|v| v.to_string()),
            MapValue::Expression(expr) => expr.eval(&|name| entry.attr(name).map(|v| v.to_string())),
        }
    }

    /// Directory attributes to request for the given logical names, plus
    /// `objectClass` which several handlers inspect.
    pub fn search_attrs(&self, map: MapSelector, logicals: &[&str]) -> Vec<String> {
        let mut attrs: Vec<String> = vec!["objectClass".to_string()];
        for logical in logicals {
            for name in self.resolve(map, logical).attr_names() {
                if !attrs.iter().any(|a| a.eq_ignore_ascii_case(&name)) {
                    attrs.push(name);
                }
            }
        }
        attrs
    }
}

/// Canonical key for a logical name, case-insensitive.
fn default_key(map: MapSelector, logical: &str) -> Option<&'static str> {
    DEFAULTS
        .keys()
        .find(|(m, key)| *m == map && key.eq_ignore_ascii_case(logical))
        .map(|(_, key)| *key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let map = AttrMap::new();
        assert_eq!(map.attr(MapSelector::Passwd, "uidNumber"), "uidNumber");
        assert_eq!(map.attr(MapSelector::Group, "memberUid"), "memberUid");
    }

    #[test]
    fn override_wins() {
        let mut map = AttrMap::new();
        map.set(MapSelector::Passwd, "homeDirectory", "unixHomeDirectory")
            .unwrap();
        assert_eq!(
            map.attr(MapSelector::Passwd, "homeDirectory"),
            "unixHomeDirectory"
        );
        // other maps unaffected
        assert_eq!(map.attr(MapSelector::Passwd, "loginShell"), "loginShell");
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let map = AttrMap::new();
        assert_eq!(map.attr(MapSelector::Passwd, "uidnumber"), "uidNumber");
    }

    #[test]
    fn reverse_roundtrip() {
        let mut map = AttrMap::new();
        map.set(MapSelector::Passwd, "uid", "sAMAccountName").unwrap();
        for logical in ["uid", "uidNumber", "gidNumber", "homeDirectory"] {
            let dir = map.attr(MapSelector::Passwd, logical).to_string();
            assert!(map
                .reverse(MapSelector::Passwd, &dir)
                .eq_ignore_ascii_case(logical));
        }
    }

    #[test]
    fn reverse_of_unmapped_is_identity() {
        let map = AttrMap::new();
        assert_eq!(map.reverse(MapSelector::Passwd, "telephoneNumber"), "telephoneNumber");
    }

    #[test]
    fn unknown_logical_rejected() {
        let mut map = AttrMap::new();
        assert!(map.set(MapSelector::Passwd, "nonsense", "cn").is_err());
    }

    #[test]
    fn expression_override_compiles() {
        let mut map = AttrMap::new();
        map.set(MapSelector::Shadow, "shadowLastChange", "\"${pwdLastSet:--1}\"")
            .unwrap();
        assert!(matches!(
            map.resolve(MapSelector::Shadow, "shadowLastChange"),
            MapValue::Expression(_)
        ));
        assert!(map
            .set(MapSelector::Shadow, "shadowMax", "\"${broken")
            .is_err());
    }

    #[test]
    fn search_attrs_include_expression_variables() {
        let map = AttrMap::new();
        let attrs = map.search_attrs(
            MapSelector::Shadow,
            &["uid", "shadowLastChange", "shadowFlag"],
        );
        assert!(attrs.iter().any(|a| a == "objectClass"));
        assert!(attrs.iter().any(|a| a == "uid"));
        assert!(attrs.iter().any(|a| a == "shadowLastChange"));
        assert!(attrs.iter().any(|a| a == "shadowFlag"));
    }
}
