//! Per-worker LDAP session management.
//!
//! Each worker owns one `Session`. The session opens its connection lazily,
//! fails over across the configured URI list with a sticky cursor, closes
//! itself after the configured idle time and rebinds with the proper
//! identity on demand. There is no cross-worker sharing, so no locking.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod};
use ldap3::exop::PasswordModify;
use log::{debug, info, warn};
use native_tls::{Certificate, Identity, TlsConnector};

use crate::config::{BindCreds, Config, ReconnectPolicy, SslMode, TlsReqCert};
use crate::result::{is_unavailable, NsdError, Result};

/// The identity a session is (or should be) bound with.
#[derive(Clone, Debug, PartialEq, Eq)]
enum BindIdentity {
    /// The configured service credentials.
    Service,
    /// The root bind DN, used when the caller's uid is 0.
    Root,
    /// An arbitrary DN with a caller-supplied password (PAM binds).
    User(String),
}

/// A single LDAP session with fail-over and idle-timeout handling.
pub struct Session {
    cfg: Arc<Config>,
    ldap: Option<Ldap>,
    cur_uri: usize,
    last_use: Instant,
    bound: BindIdentity,
    /// Set when the connection was re-established since the last
    /// successful use; the server loop uses it to trigger cache
    /// invalidation after reconnects.
    pub reconnected: bool,
}

impl Session {
    pub fn new(cfg: Arc<Config>) -> Session {
        Session {
            cfg,
            ldap: None,
            cur_uri: 0,
            last_use: Instant::now(),
            bound: BindIdentity::Service,
            reconnected: false,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    /// Current URI cursor position (exposed for logging and tests).
    pub fn uri_cursor(&self) -> usize {
        self.cur_uri
    }

    pub fn is_connected(&self) -> bool {
        self.ldap.is_some()
    }

    /// Record session activity, for the idle timer.
    pub fn touch(&mut self) {
        self.last_use = Instant::now();
    }

    /// Make sure the session is connected and bound with the identity
    /// appropriate for the caller. Root callers get the root bind DN when
    /// one is configured.
    pub async fn ensure_open(&mut self, caller_root: bool) -> Result<()> {
        let want = if caller_root && self.cfg.rootbinddn.is_some() {
            BindIdentity::Root
        } else {
            BindIdentity::Service
        };
        self.check_idle().await;
        if self.ldap.is_some() && self.bound == want {
            return Ok(());
        }
        if self.ldap.is_some() {
            // bound as somebody else; start over
            self.close().await;
        }
        self.open_with_retry(want).await
    }

    /// Close the connection if it has been idle longer than the configured
    /// limit. The next operation reopens on demand.
    async fn check_idle(&mut self) {
        if let (Some(limit), true) = (self.cfg.idle_timelimit, self.ldap.is_some()) {
            if self.last_use.elapsed() > limit {
                debug!("idle_timelimit reached, closing connection");
                self.close().await;
            }
        }
    }

    /// Drop the connection. Outstanding searches must have been abandoned
    /// by their owners before this is called.
    pub async fn close(&mut self) {
        if let Some(mut ldap) = self.ldap.take() {
            if let Err(e) = ldap.unbind().await {
                debug!("unbind failed (ignored): {}", e);
            }
        }
    }

    /// Replay the current credentials on a fresh connection. Used after
    /// the server drops the connection mid-operation; failure surfaces as
    /// unavailability.
    pub async fn rebind(&mut self) -> Result<()> {
        let identity = self.bound.clone();
        self.close().await;
        self.open_with_retry(identity).await
    }

    /// The reconnect loop: sweep the URI list starting at the sticky
    /// cursor, with back-off between sweeps, honoring the configured
    /// reconnect policy.
    async fn open_with_retry(&mut self, identity: BindIdentity) -> Result<()> {
        let maxtries = self.cfg.reconnect_maxconntries + self.cfg.reconnect_tries;
        let mut tries: u32 = 0;
        let mut backoff: Option<Duration> = None;
        let mut failed_over = false;
        loop {
            if tries >= self.cfg.reconnect_maxconntries {
                let sleep = next_backoff(backoff, &self.cfg);
                info!("reconnecting to LDAP server (sleeping {} seconds)", sleep.as_secs());
                tokio::time::sleep(sleep).await;
                backoff = Some(sleep);
            } else if tries > 0 {
                info!("reconnecting to LDAP server");
            }
            let start_uri = self.cur_uri;
            loop {
                let uri = self.cfg.uris[self.cur_uri].clone();
                match self.try_open(&uri, &identity).await {
                    Ok(()) => {
                        if tries > 0 || failed_over {
                            info!("connected to {} after {} failed attempts", uri, tries.max(1));
                            self.reconnected = true;
                        } else {
                            debug!("connected to {}", uri);
                        }
                        self.bound = identity;
                        self.last_use = Instant::now();
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("failed to bind to LDAP server {}: {}", uri, e);
                        self.close().await;
                        failed_over = true;
                        self.cur_uri = (self.cur_uri + 1) % self.cfg.uris.len();
                        if self.cur_uri == start_uri {
                            break;
                        }
                    }
                }
            }
            tries += 1;
            if self.cfg.bind_policy == ReconnectPolicy::Soft || tries >= maxtries {
                warn!("no available LDAP server found");
                return Err(NsdError::Unavailable);
            }
        }
    }

    /// One connection attempt against one URI: TLS bring-up, then bind.
    async fn try_open(&mut self, uri: &str, identity: &BindIdentity) -> Result<()> {
        let settings = self.conn_settings()?;
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, uri).await?;
        ldap3::drive!(conn);
        let res: Option<LdapResult> = match identity {
            BindIdentity::Root => {
                let dn = self.cfg.rootbinddn.clone().unwrap_or_default();
                Some(match (&self.cfg.rootbindpw, &self.cfg.rootsaslid) {
                    (Some(pw), _) => ldap.simple_bind(&dn, pw).await?,
                    (None, Some(_)) => ldap.sasl_external_bind().await?,
                    (None, None) => ldap.simple_bind(&dn, "").await?,
                })
            }
            BindIdentity::Service => Some(match &self.cfg.bind {
                BindCreds::Anonymous => ldap.simple_bind("", "").await?,
                BindCreds::Simple { dn, password } => ldap.simple_bind(dn, password).await?,
                BindCreds::SaslExternal { .. } => ldap.sasl_external_bind().await?,
            }),
            // user sessions bind later, with the caller's password
            BindIdentity::User(_) => None,
        };
        if let Some(res) = res {
            if res.rc != 0 {
                return Err(NsdError::Ldap {
                    source: ldap3::LdapError::from(res),
                });
            }
        }
        self.ldap = Some(ldap);
        Ok(())
    }

    fn conn_settings(&self) -> Result<LdapConnSettings> {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(self.cfg.bind_timelimit)
            .set_starttls(self.cfg.ssl == SslMode::StartTls);
        if self.cfg.ssl != SslMode::Off || uris_want_tls(&self.cfg) {
            settings = settings.set_connector(self.tls_connector()?);
            if matches!(self.cfg.tls_reqcert, TlsReqCert::Never | TlsReqCert::Allow) {
                settings = settings.set_no_tls_verify(true);
            }
        }
        Ok(settings)
    }

    fn tls_connector(&self) -> Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if matches!(self.cfg.tls_reqcert, TlsReqCert::Never | TlsReqCert::Allow) {
            builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = &self.cfg.tls_cacertfile {
            let pem = fs::read(path)?;
            builder.add_root_certificate(
                Certificate::from_pem(&pem).map_err(ldap3::LdapError::from)?,
            );
        }
        if let Some(dir) = &self.cfg.tls_cacertdir {
            for dent in fs::read_dir(dir)? {
                let dent = dent?;
                if dent.metadata()?.is_file() {
                    if let Ok(cert) = Certificate::from_pem(&fs::read(dent.path())?) {
                        builder.add_root_certificate(cert);
                    }
                }
            }
        }
        if let (Some(cert), Some(key)) = (&self.cfg.tls_cert, &self.cfg.tls_key) {
            let identity = Identity::from_pkcs8(&fs::read(cert)?, &fs::read(key)?)
                .map_err(ldap3::LdapError::from)?;
            builder.identity(identity);
        }
        builder.build().map_err(|e| ldap3::LdapError::from(e).into())
    }

    /// Open an unbound connection for a PAM user bind. The reconnect loop
    /// applies; only the bind step is deferred to [`Session::user_bind`].
    pub async fn open_unbound(&mut self) -> Result<()> {
        self.check_idle().await;
        if self.ldap.is_some() {
            return Ok(());
        }
        self.open_with_retry(BindIdentity::User(String::new())).await
    }

    /// Bind with caller-supplied credentials. Returns the server's result
    /// code and diagnostic text without mapping invalid credentials to an
    /// error, since PAM turns these into policy results.
    pub async fn user_bind(&mut self, dn: &str, password: &str) -> Result<(u32, String)> {
        self.open_unbound().await?;
        let ldap = self.ldap.as_mut().expect("open session");
        match ldap.simple_bind(dn, password).await {
            Ok(res) => {
                self.bound = BindIdentity::User(dn.to_string());
                self.touch();
                Ok((res.rc, res.text))
            }
            Err(e) if is_unavailable(&e) => {
                self.close().await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Access the raw handle for a new operation. The caller must have
    /// ensured the session is open.
    pub(crate) fn handle(&mut self) -> Result<&mut Ldap> {
        match self.ldap.as_mut() {
            Some(ldap) => Ok(ldap),
            None => Err(NsdError::Unavailable),
        }
    }

    pub(crate) fn op_timeout(&self) -> Option<Duration> {
        self.cfg.timelimit
    }

    /// Modify an entry.
    pub async fn modify(&mut self, dn: &str, mods: Vec<Mod<String>>) -> Result<()> {
        let timeout = self.op_timeout();
        let ldap = self.handle()?;
        if let Some(t) = timeout {
            ldap.with_timeout(t);
        }
        ldap.modify(dn, mods).await?.success()?;
        self.touch();
        Ok(())
    }

    /// RFC 3062 password modify extended operation. Returns the server's
    /// diagnostic text on failure so PAM can report it.
    pub async fn password_modify(
        &mut self,
        user_dn: &str,
        old_pass: Option<&str>,
        new_pass: &str,
    ) -> std::result::Result<(), String> {
        let timeout = self.op_timeout();
        let ldap = match self.handle() {
            Ok(l) => l,
            Err(e) => return Err(e.to_string()),
        };
        if let Some(t) = timeout {
            ldap.with_timeout(t);
        }
        let exop = PasswordModify {
            user_id: Some(user_dn),
            old_pass,
            new_pass: Some(new_pass),
        };
        match ldap.extended(exop).await {
            Ok(res) => match res.success() {
                Ok(_) => {
                    self.touch();
                    Ok(())
                }
                Err(e) => Err(describe_ldap_error(&e)),
            },
            Err(e) => Err(describe_ldap_error(&e)),
        }
    }
}

/// Double the previous back-off, bounded by `reconnect_maxsleeptime`.
fn next_backoff(prev: Option<Duration>, cfg: &Config) -> Duration {
    match prev {
        None => cfg.reconnect_sleeptime,
        Some(d) => (d * 2).min(cfg.reconnect_maxsleeptime),
    }
}

fn uris_want_tls(cfg: &Config) -> bool {
    cfg.uris.iter().any(|u| u.starts_with("ldaps://"))
}

fn describe_ldap_error(err: &ldap3::LdapError) -> String {
    match err {
        ldap3::LdapError::LdapResult { result } if !result.text.is_empty() => {
            result.text.clone()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn cfg(extra: &str) -> Arc<Config> {
        let text = format!("uri ldap://dir/\nbase dc=x\n{}", extra);
        Arc::new(Config::parse(&text).unwrap())
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let cfg = cfg("reconnect_sleeptime 2\nreconnect_maxsleeptime 10\n");
        let b1 = next_backoff(None, &cfg);
        let b2 = next_backoff(Some(b1), &cfg);
        let b3 = next_backoff(Some(b2), &cfg);
        let b4 = next_backoff(Some(b3), &cfg);
        assert_eq!(b1, Duration::from_secs(2));
        assert_eq!(b2, Duration::from_secs(4));
        assert_eq!(b3, Duration::from_secs(8));
        assert_eq!(b4, Duration::from_secs(10));
    }

    #[test]
    fn new_session_is_disconnected() {
        let s = Session::new(cfg(""));
        assert!(!s.is_connected());
        assert_eq!(s.uri_cursor(), 0);
    }

    #[tokio::test]
    async fn soft_policy_gives_up_after_one_sweep() {
        // connection refused on both URIs; the soft policy must return
        // after a single sweep instead of sleeping and retrying
        let text = "uri ldap://127.0.0.1:1/ ldap://127.0.0.1:2/\nbase dc=x\n\
                    bind_policy soft\nbind_timelimit 1\n";
        let mut session = Session::new(Arc::new(Config::parse(text).unwrap()));
        let start = Instant::now();
        let res = session.ensure_open(false).await;
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        // a full sweep returns the cursor to its starting point
        assert_eq!(session.uri_cursor(), 0);
    }
}
