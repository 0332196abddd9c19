//! Directory searches with paging and search-base fall-through.
//!
//! A [`Search`] borrows its worker's [`Session`] mutably for its whole
//! lifetime, which statically enforces the one-outstanding-search-per-
//! session discipline. Handlers that need nested lookups while processing
//! results first collect the entries (they are owned values) and close the
//! search.
//!
//! Paging and reference skipping are delegated to the `EntriesOnly` and
//! `PagedResults` search adapters; this module adds the ordered walk over
//! a map's search-base descriptors and the error classification required
//! by the handlers.

use std::collections::HashMap;

use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{SearchEntry, SearchStream};
use log::{debug, warn};

use crate::config::SearchBase;
use crate::filter;
use crate::result::{status_of, status_of_rc, LookupStatus, NsdError, Result};
use crate::session::Session;

/// An owned view of one directory entry.
///
/// Values are copied out of the result message, so an `Entry` stays valid
/// after its search is closed; handlers are free to collect entries and
/// run further lookups afterwards.
#[derive(Clone, Debug, Default)]
pub struct Entry {
    dn: String,
    attrs: HashMap<String, Vec<String>>,
    bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    pub fn new(dn: &str, attrs: &[(&str, &[&str])]) -> Entry {
        Entry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    fn from_search_entry(se: SearchEntry) -> Entry {
        Entry {
            dn: se.dn,
            attrs: se.attrs,
            bin_attrs: se.bin_attrs,
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    fn find(&self, name: &str) -> Option<&Vec<String>> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First value of an attribute, case-insensitive on the name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.find(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of an attribute; empty when absent.
    pub fn attrs(&self, name: &str) -> Vec<&str> {
        self.find(name)
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Binary values of an attribute; the string map is consulted too
    /// since servers are free to return either form.
    pub fn attrs_bin(&self, name: &str) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = self
            .bin_attrs
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.iter().cloned())
            .collect();
        if out.is_empty() {
            out = self
                .attrs(name)
                .into_iter()
                .map(|v| v.as_bytes().to_vec())
                .collect();
        }
        out
    }

    /// Attribute names present on the entry (used for `;range=` scans).
    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(String::as_str)
    }

    pub fn has_objectclass(&self, objectclass: &str) -> bool {
        self.attrs("objectClass")
            .iter()
            .any(|oc| oc.eq_ignore_ascii_case(objectclass))
    }

    /// The value of the naming attribute if the entry's RDN uses `attr`.
    /// This is the most authoritative value for an attribute.
    pub fn rdn_value(&self, attr: &str) -> Option<&str> {
        let rdn = self.dn.split(',').next()?;
        let (name, value) = rdn.split_once('=')?;
        if name.trim().eq_ignore_ascii_case(attr) {
            Some(value.trim())
        } else {
            None
        }
    }
}

enum SearchState {
    Active,
    Finished,
}

/// One logical search: a filter applied over an ordered list of search
/// bases, transparently paged.
pub struct Search<'a> {
    session: &'a mut Session,
    stream: Option<SearchStream<'static, String, Vec<String>>>,
    bases: std::vec::IntoIter<SearchBase>,
    current_base: Option<SearchBase>,
    filter: String,
    attrs: Vec<String>,
    state: SearchState,
    /// One rebind-and-retry is allowed when the server goes away under
    /// an open search; a second failure is final.
    retried: bool,
}

impl<'a> Search<'a> {
    /// Open a search. The session is connected (and bound for the caller)
    /// on demand.
    pub async fn open(
        session: &'a mut Session,
        bases: &[SearchBase],
        filter: &str,
        attrs: Vec<String>,
        caller_root: bool,
    ) -> Result<Search<'a>> {
        session.ensure_open(caller_root).await?;
        debug!("searching {}", filter);
        Ok(Search {
            session,
            stream: None,
            bases: bases.to_vec().into_iter(),
            current_base: None,
            filter: filter.to_string(),
            attrs,
            state: SearchState::Active,
            retried: false,
        })
    }

    /// Yield the next entry, moving through result pages and search bases
    /// as needed. Size-limit and time-limit results terminate the
    /// enumeration as if it completed normally.
    pub async fn next_entry(&mut self) -> Result<Option<Entry>> {
        loop {
            if matches!(self.state, SearchState::Finished) {
                return Ok(None);
            }
            if self.stream.is_none() && !self.open_next_base().await? {
                self.state = SearchState::Finished;
                return Ok(None);
            }
            let stream = self.stream.as_mut().expect("open stream");
            match stream.next().await {
                Ok(Some(re)) => {
                    self.session.touch();
                    return Ok(Some(Entry::from_search_entry(SearchEntry::construct(re))));
                }
                Ok(None) => {
                    let res = stream.finish().await;
                    self.stream = None;
                    match status_of_rc(res.rc) {
                        // fall through to the next search base
                        LookupStatus::Success | LookupStatus::NotFound => continue,
                        _ => {
                            warn!("search failed: {}", res);
                            self.state = SearchState::Finished;
                            self.session.close().await;
                            return Err(NsdError::Ldap { source: res.into() });
                        }
                    }
                }
                Err(e) => {
                    self.stream = None;
                    match status_of(&e) {
                        LookupStatus::NotFound => {
                            debug!("search returned no data: {}", e);
                            continue;
                        }
                        _ if !self.retried => {
                            // the server went away under us; replay the
                            // bind and reissue the current search once
                            self.retried = true;
                            warn!("search interrupted, rebinding: {}", e);
                            self.session.rebind().await?;
                            if !self.reopen_current().await? {
                                continue;
                            }
                        }
                        _ => {
                            warn!("search failed: {}", e);
                            self.state = SearchState::Finished;
                            self.session.close().await;
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Start a search on the next remaining base descriptor. Returns false
    /// when the descriptor list is exhausted.
    async fn open_next_base(&mut self) -> Result<bool> {
        while let Some(sb) = self.bases.next() {
            if self.start_stream(&sb).await? {
                self.current_base = Some(sb);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reissue the search on the base that was interrupted.
    async fn reopen_current(&mut self) -> Result<bool> {
        match self.current_base.clone() {
            Some(sb) => self.start_stream(&sb).await,
            None => Ok(false),
        }
    }

    /// Open the stream for one base descriptor. `Ok(false)` means the
    /// base produced a schema-level miss and the caller should move on.
    async fn start_stream(&mut self, sb: &SearchBase) -> Result<bool> {
        let pagesize = self.session.config().pagesize;
        let timeout = self.session.op_timeout();
        let filter = match &sb.filter {
            Some(extra) => filter::with_extra(&self.filter, extra),
            None => self.filter.clone(),
        };
        let mut adapters: Vec<Box<dyn Adapter<String, Vec<String>>>> =
            vec![Box::new(EntriesOnly::new())];
        if pagesize > 0 {
            adapters.push(Box::new(PagedResults::new(pagesize)));
        }
        let ldap = self.session.handle()?;
        if let Some(t) = timeout {
            ldap.with_timeout(t);
        }
        match ldap
            .streaming_search_with(adapters, &sb.base, sb.scope, &filter, self.attrs.clone())
            .await
        {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(true)
            }
            Err(e) => match status_of(&e) {
                LookupStatus::NotFound => {
                    debug!("search under {} found nothing: {}", sb.base, e);
                    Ok(false)
                }
                _ => {
                    warn!("search under {} failed: {}", sb.base, e);
                    self.session.close().await;
                    Err(e.into())
                }
            },
        }
    }

    /// Abandon any outstanding operation and release the session for the
    /// next search. Safe to call after normal completion. Must be called
    /// before the search goes out of scope; the connection driver's id
    /// scrubbing is the only cleanup a skipped close gets.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let ldap = stream.ldap_handle();
            let msgid = ldap.last_id();
            if let Err(e) = ldap.abandon(msgid).await {
                debug!("abandon failed (ignored): {}", e);
            }
        }
        self.state = SearchState::Finished;
        if self.session.config().connect_policy_oneshot {
            self.session.close().await;
        }
    }

    /// Convenience: the first entry matching the search, abandoning the
    /// rest.
    pub async fn find_first(
        session: &'a mut Session,
        bases: &[SearchBase],
        filter: &str,
        attrs: Vec<String>,
        caller_root: bool,
    ) -> Result<Option<Entry>> {
        let mut search = Search::open(session, bases, filter, attrs, caller_root).await?;
        let entry = search.next_entry().await?;
        search.close().await;
        Ok(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_attr_is_case_insensitive() {
        let e = Entry::new("uid=alice,ou=People,dc=x", &[("uidNumber", &["1001"])]);
        assert_eq!(e.attr("uidnumber"), Some("1001"));
        assert_eq!(e.attr("UIDNUMBER"), Some("1001"));
        assert_eq!(e.attr("gidNumber"), None);
    }

    #[test]
    fn entry_multi_values() {
        let e = Entry::new("cn=grp,dc=x", &[("memberUid", &["alice", "bob"])]);
        assert_eq!(e.attrs("memberUid"), vec!["alice", "bob"]);
        assert!(e.attrs("member").is_empty());
    }

    #[test]
    fn objectclass_check() {
        let e = Entry::new(
            "uid=alice,dc=x",
            &[("objectClass", &["posixAccount", "shadowAccount"])],
        );
        assert!(e.has_objectclass("shadowaccount"));
        assert!(!e.has_objectclass("posixGroup"));
    }

    #[test]
    fn rdn_value_extraction() {
        let e = Entry::new("uid=alice,ou=People,dc=x", &[]);
        assert_eq!(e.rdn_value("uid"), Some("alice"));
        assert_eq!(e.rdn_value("cn"), None);
    }

    #[test]
    fn binary_values_fall_back_to_strings() {
        let e = Entry::new("cn=www,dc=x", &[("ipHostNumber", &["10.0.0.1"])]);
        assert_eq!(e.attrs_bin("ipHostNumber"), vec![b"10.0.0.1".to_vec()]);
    }
}
