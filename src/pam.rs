//! PAM authentication, authorization, session and password-change
//! handling.
//!
//! Authentication binds with the caller's credentials on a throwaway
//! session so the worker's own session never changes identity. All PAM
//! requests produce a complete response record, message included, even on
//! denial; only directory unavailability breaks the response off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ldap3::Mod;
use log::{debug, info, warn};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::attmap::{MapSelector, MapValue};
use crate::config::{AuthcSearch, Config, SearchBase};
use crate::expr::Expr;
use crate::filter;
use crate::handlers::shadow::{shadow_properties, shadow_uid2entry, ShadowProps};
use crate::handlers::{uid2entry, RequestCtx};
use crate::proto::{pam_rc, Action, LIMIT_HOSTNAME, LIMIT_NAME, LIMIT_PASSWORD};
use crate::result::{NsdError, Result};
use crate::search::{Entry, Search};
use crate::session::Session;

/// Common prefix of every PAM request: username, service, ruser, rhost,
/// tty.
struct PamRequest {
    username: String,
    service: String,
    ruser: String,
    rhost: String,
    tty: String,
}

async fn read_pam_request<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<PamRequest> {
    Ok(PamRequest {
        username: ctx.stream.read_string(LIMIT_NAME).await?,
        service: ctx.stream.read_string(LIMIT_NAME).await?,
        ruser: ctx.stream.read_string(LIMIT_NAME).await?,
        rhost: ctx.stream.read_string(LIMIT_HOSTNAME).await?,
        tty: ctx.stream.read_string(64).await?,
    })
}

/// Days since the epoch, the unit of the shadow fields.
fn today() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() / 86400) as i64)
        .unwrap_or(0)
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The variable dictionary for `pam_authc_search` and `pam_authz_search`
/// templates. Values are LDAP-escaped when inserted, so expanded
/// templates are safe to use as filters.
fn search_vars(req: &PamRequest, dn: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let mut put = |name: &str, value: &str| {
        vars.insert(name.to_string(), filter::escape(value).into_owned());
    };
    put("username", &req.username);
    put("service", &req.service);
    put("ruser", &req.ruser);
    put("rhost", &req.rhost);
    put("tty", &req.tty);
    // resolving the FQDN through the resolver would recurse into this
    // daemon; the kernel hostname is used as reported
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    put("hostname", &hostname);
    put("fqdn", &hostname);
    if let Some((_, domain)) = hostname.split_once('.') {
        if !domain.is_empty() {
            put("domain", domain);
        }
    }
    put("dn", dn);
    put("uid", &req.username);
    vars
}

/// Expand a search template and run it across every global base; any
/// failure, including an empty result, is a denial.
async fn do_searches(
    session: &mut Session,
    cfg: &Config,
    option: &str,
    template: &Expr,
    vars: &HashMap<String, String>,
) -> Result<bool> {
    let flt = match template.eval(&|name| vars.get(name).cloned()) {
        Some(flt) => flt,
        None => {
            warn!("invalid {} template (missing variable)", option);
            return Ok(false);
        }
    };
    debug!("trying {} \"{}\"", option, flt);
    let bases: Vec<SearchBase> = cfg
        .bases_global
        .iter()
        .map(|base| SearchBase {
            base: base.clone(),
            scope: ldap3::Scope::Subtree,
            filter: None,
        })
        .collect();
    let entry = Search::find_first(session, &bases, &flt, vec!["dn".to_string()], false).await?;
    match entry {
        Some(entry) => {
            debug!("{} found \"{}\"", option, entry.dn());
            Ok(true)
        }
        None => {
            warn!("{} \"{}\" found no matches", option, flt);
            Ok(false)
        }
    }
}

/// The canonical username from the entry, preferring the RDN value.
fn update_username(cfg: &Config, entry: &Entry, username: &mut String) {
    let uid_attr = cfg.attmap.attr(MapSelector::Passwd, "uid");
    let value = match entry.rdn_value(uid_attr) {
        Some(v) => Some(v),
        None => entry.attr(uid_attr),
    };
    let value = match value {
        Some(v) => v,
        None => {
            warn!("{}: {}: missing", entry.dn(), uid_attr);
            return;
        }
    };
    if !cfg.valid_name(value) {
        warn!("{}: {}: denied by validnames option", entry.dn(), uid_attr);
        return;
    }
    if !cfg.name_eq(username, value) {
        info!("username changed from \"{}\" to \"{}\"", username, value);
        *username = value.to_string();
    }
}

/// Evaluate the shadow expiry rules. Returns a PAM result code and a
/// user-facing message (possibly empty for pure warnings, which are only
/// logged).
pub fn check_shadow_props(
    props: ShadowProps,
    today: i64,
    dn: &str,
    check_maxdays: bool,
    check_mindays: bool,
) -> (i32, String) {
    if props.expiredate != -1 && today >= props.expiredate {
        let msg = format!("Account expired {} days ago", today - props.expiredate);
        warn!("{}: {}", dn, msg);
        return (pam_rc::ACCT_EXPIRED, msg);
    }
    let mut message = String::new();
    if check_maxdays {
        if props.lastchange == 0 {
            let msg = "Need a new password".to_string();
            warn!("{}: {}", dn, msg);
            return (pam_rc::NEW_AUTHTOK_REQD, msg);
        } else if today < props.lastchange {
            warn!("{}: password changed in the future", dn);
        } else if props.maxdays != -1 {
            let daysleft = props.lastchange + props.maxdays - today;
            if daysleft == 0 {
                message = "Password will expire today".to_string();
            } else if daysleft < 0 {
                message = format!("Password expired {} days ago", -daysleft);
            }
            if daysleft <= 0 && props.inactdays != -1 {
                let inactleft = props.lastchange + props.maxdays + props.inactdays - today;
                if inactleft == 0 {
                    message.push_str(", account will be locked today");
                } else if inactleft > 0 {
                    message.push_str(&format!(", account will be locked in {} days", inactleft));
                } else {
                    message.push_str(&format!(", account locked {} days ago", -inactleft));
                    warn!("{}: {}", dn, message);
                    return (pam_rc::AUTHTOK_EXPIRED, message);
                }
            }
            if daysleft <= 0 {
                warn!("{}: {}", dn, message);
                return (pam_rc::NEW_AUTHTOK_REQD, message);
            }
            if props.warndays > 0 && daysleft <= props.warndays {
                message = format!("Password will expire in {} days", daysleft);
                warn!("{}: {}", dn, message);
            }
        }
    }
    if check_mindays && props.mindays != -1 {
        let daysleft = props.lastchange + props.mindays - today;
        if daysleft > 0 {
            let msg = format!("Password cannot be changed for another {} days", daysleft);
            warn!("{}: {}", dn, msg);
            return (pam_rc::AUTHTOK_ERR, msg);
        }
    }
    (pam_rc::SUCCESS, message)
}

/// Fetch the shadow entry for the user and run the expiry rules against
/// it. A user without shadow data passes.
async fn check_shadow(
    session: &mut Session,
    cfg: &Config,
    username: &str,
    check_maxdays: bool,
    check_mindays: bool,
) -> Result<(i32, String)> {
    let entry = match shadow_uid2entry(session, cfg, username).await? {
        Some(entry) => entry,
        None => return Ok((pam_rc::SUCCESS, String::new())),
    };
    let props = shadow_properties(cfg, &entry);
    Ok(check_shadow_props(
        props,
        today(),
        entry.dn(),
        check_maxdays,
        check_mindays,
    ))
}

/// Bind with the user's credentials and run the configured post-bind
/// check. Returns the resulting PAM code and diagnostic message.
async fn try_bind(
    cfg: &Arc<Config>,
    userdn: &str,
    password: &str,
    req: &PamRequest,
) -> Result<(i32, String)> {
    let mut session = Session::new(cfg.clone());
    let outcome = try_bind_inner(&mut session, cfg, userdn, password, req).await;
    session.close().await;
    outcome
}

async fn try_bind_inner(
    session: &mut Session,
    cfg: &Arc<Config>,
    userdn: &str,
    password: &str,
    req: &PamRequest,
) -> Result<(i32, String)> {
    let (rc, diag) = match session.user_bind(userdn, password).await {
        Ok(pair) => pair,
        Err(NsdError::Unavailable) => return Err(NsdError::Unavailable),
        Err(e) => {
            warn!("{}: {}", userdn, e);
            return Ok((pam_rc::AUTH_ERR, String::new()));
        }
    };
    if !diag.is_empty() {
        warn!("{}: {}", userdn, diag);
    }
    if rc != 0 {
        // invalid credentials and everything else map to an
        // authentication failure; the distinction is in the logs
        debug!("{}: bind returned code {}", userdn, rc);
        return Ok((pam_rc::AUTH_ERR, diag));
    }
    // the bind succeeded; run the configured post-bind check
    let ok = match &cfg.pam_authc_search {
        AuthcSearch::None => true,
        AuthcSearch::Base => {
            let bases = [SearchBase {
                base: userdn.to_string(),
                scope: ldap3::Scope::Base,
                filter: None,
            }];
            Search::find_first(session, &bases, "(objectClass=*)", vec!["dn".to_string()], false)
                .await?
                .is_some()
        }
        AuthcSearch::Filter(template) => {
            let vars = search_vars(req, userdn);
            do_searches(session, cfg, "pam_authc_search", template, &vars).await?
        }
    };
    if !ok {
        warn!("{}: authentication check failed", userdn);
        return Ok((pam_rc::AUTH_ERR, diag));
    }
    debug!("bind successful");
    Ok((pam_rc::SUCCESS, diag))
}

/// Check authentication credentials of the user.
pub async fn authc<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let mut req = read_pam_request(ctx).await?;
    let mut password = ctx.stream.read_string(LIMIT_PASSWORD).await?;
    debug!("authc=\"{}\" service=\"{}\"", req.username, req.service);
    ctx.stream.write_response_header(Action::PamAuthc).await?;
    let cfg = ctx.cfg.clone();
    let userdn;
    if req.username.is_empty() {
        // administrator authentication through the password-change DN
        userdn = match &cfg.rootpwmoddn {
            Some(dn) => dn.clone(),
            None => {
                info!("rootpwmoddn not configured");
                return Err(NsdError::proto("empty username"));
            }
        };
        if password.is_empty() && ctx.caller.is_root() {
            if let Some(pw) = &cfg.rootpwmodpw {
                password = pw.clone();
            }
        }
    } else {
        if !cfg.valid_name(&req.username) {
            warn!("authc=\"{}\": request denied by validnames option", req.username);
            return ctx.stream.end_results().await;
        }
        let entry = match uid2entry(ctx.session, &cfg, &req.username).await? {
            Some(entry) => entry,
            None => {
                debug!("authc=\"{}\": user not found", req.username);
                return ctx.stream.end_results().await;
            }
        };
        userdn = entry.dn().to_string();
        update_username(&cfg, &entry, &mut req.username);
    }
    let (rc, mut authzmsg) = try_bind(&cfg, &userdn, &password, &req).await?;
    let mut authzrc = pam_rc::SUCCESS;
    if rc == pam_rc::SUCCESS && !req.username.is_empty() {
        let (shadow_rc, shadow_msg) =
            check_shadow(ctx.session, &cfg, &req.username, true, false).await?;
        authzrc = shadow_rc;
        if !shadow_msg.is_empty() {
            authzmsg = shadow_msg;
        }
    }
    ctx.stream.begin_record().await?;
    ctx.stream.write_i32(rc).await?;
    ctx.stream.write_string(&req.username).await?;
    ctx.stream.write_i32(authzrc).await?;
    ctx.stream.write_string(&authzmsg).await?;
    ctx.stream.end_results().await
}

/// Check authorization of the user.
pub async fn authz<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let req = read_pam_request(ctx).await?;
    debug!(
        "authz=\"{}\" service=\"{}\" ruser=\"{}\" rhost=\"{}\" tty=\"{}\"",
        req.username, req.service, req.ruser, req.rhost, req.tty
    );
    ctx.stream.write_response_header(Action::PamAuthz).await?;
    let cfg = ctx.cfg.clone();
    if !cfg.valid_name(&req.username) {
        warn!("authz=\"{}\": request denied by validnames option", req.username);
        return ctx.stream.end_results().await;
    }
    let entry = match uid2entry(ctx.session, &cfg, &req.username).await? {
        Some(entry) => entry,
        None => {
            debug!("authz=\"{}\": user not found", req.username);
            return ctx.stream.end_results().await;
        }
    };
    if !cfg.pam_authz_searches.is_empty() {
        let vars = search_vars(&req, entry.dn());
        for template in &cfg.pam_authz_searches {
            if !do_searches(ctx.session, &cfg, "pam_authz_search", template, &vars).await? {
                ctx.stream.begin_record().await?;
                ctx.stream.write_i32(pam_rc::PERM_DENIED).await?;
                ctx.stream
                    .write_string("LDAP authorisation check failed")
                    .await?;
                return ctx.stream.end_results().await;
            }
        }
    }
    let (rc, msg) = check_shadow(ctx.session, &cfg, &req.username, false, false).await?;
    ctx.stream.begin_record().await?;
    ctx.stream.write_i32(rc).await?;
    ctx.stream.write_string(&msg).await?;
    ctx.stream.end_results().await
}

/// Generate a session id for session open.
fn new_session_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..24)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub async fn sess_open<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let req = read_pam_request(ctx).await?;
    let sessionid = new_session_id();
    debug!(
        "sess_o=\"{}\" service=\"{}\": {}",
        req.username, req.service, sessionid
    );
    ctx.stream.write_response_header(Action::PamSessOpen).await?;
    ctx.stream.begin_record().await?;
    ctx.stream.write_string(&sessionid).await?;
    ctx.stream.end_results().await
}

pub async fn sess_close<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &mut RequestCtx<'_, S>,
) -> Result<()> {
    let req = read_pam_request(ctx).await?;
    let sessionid = ctx.stream.read_string(64).await?;
    debug!(
        "sess_c=\"{}\" service=\"{}\": {}",
        req.username, req.service, sessionid
    );
    ctx.stream
        .write_response_header(Action::PamSessClose)
        .await?;
    ctx.stream.begin_record().await?;
    ctx.stream.end_results().await
}

/// Try to update the last-change attribute after a password change.
async fn update_lastchange(session: &mut Session, cfg: &Config, userdn: &str) -> Result<bool> {
    let attr = match cfg.attmap.resolve(MapSelector::Shadow, "shadowLastChange") {
        MapValue::Attribute(name) => name.clone(),
        MapValue::Expression(expr) => {
            if *expr == Expr::parse("${shadowLastChange:--1}").expect("default expression") {
                "shadowLastChange".to_string()
            } else {
                // arbitrary expressions have no single attribute to update
                return Ok(false);
            }
        }
    };
    let bases = [SearchBase {
        base: userdn.to_string(),
        scope: ldap3::Scope::Base,
        filter: None,
    }];
    let uid_attr = cfg.attmap.attr(MapSelector::Shadow, "uid").to_string();
    let entry = Search::find_first(
        session,
        &bases,
        cfg.map_filter(MapSelector::Shadow),
        vec![uid_attr, attr.clone()],
        false,
    )
    .await?;
    let entry = match entry {
        Some(e) => e,
        None => return Ok(false),
    };
    match entry.attr(&attr) {
        Some(v) if !v.is_empty() => {}
        _ => return Ok(false),
    }
    let value = if attr.eq_ignore_ascii_case("pwdLastSet") {
        format!("{}000000000", unix_time() / 100 + 134774 * 864)
    } else {
        format!("{}", unix_time() / 86400)
    };
    let mods = vec![Mod::Replace(attr.clone(), [value].into_iter().collect())];
    match session.modify(userdn, mods).await {
        Ok(()) => {
            debug!("{}: {}: modification succeeded", userdn, attr);
            Ok(true)
        }
        Err(e) => {
            warn!("{}: {}: modification failed: {}", userdn, attr, e);
            Ok(false)
        }
    }
}

/// Change the user's password via the password-modify extended operation.
async fn try_pwmod(
    worker_session: &mut Session,
    cfg: &Arc<Config>,
    binddn: &str,
    userdn: &str,
    oldpassword: &str,
    newpassword: &str,
) -> std::result::Result<(), String> {
    let mut session = Session::new(cfg.clone());
    let (rc, text) = match session.user_bind(binddn, oldpassword).await {
        Ok(pair) => pair,
        Err(e) => {
            session.close().await;
            return Err(e.to_string());
        }
    };
    if rc != 0 {
        session.close().await;
        return Err(if text.is_empty() {
            format!("bind returned code {}", rc)
        } else {
            text
        });
    }
    // an administrative change must not pass the admin password to the
    // password-modify operation
    let old_for_exop = match &cfg.rootpwmoddn {
        Some(dn) if dn == binddn => None,
        _ => Some(oldpassword),
    };
    let outcome = session.password_modify(userdn, old_for_exop, newpassword).await;
    if outcome.is_ok() && !update_lastchange(&mut session, cfg, userdn).await.unwrap_or(false) {
        // retry on the worker's own session
        let _ = update_lastchange(worker_session, cfg, userdn).await;
    }
    session.close().await;
    outcome
}

/// Change the user's password.
pub async fn pwmod<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let req = read_pam_request(ctx).await?;
    let asroot = ctx.stream.read_i32().await? != 0;
    let mut oldpassword = ctx.stream.read_string(LIMIT_PASSWORD).await?;
    let newpassword = ctx.stream.read_string(LIMIT_PASSWORD).await?;
    debug!(
        "pwmod=\"{}\" ({})",
        req.username,
        if asroot { "asroot" } else { "asuser" }
    );
    ctx.stream.write_response_header(Action::PamPwMod).await?;
    let cfg = ctx.cfg.clone();
    if !cfg.valid_name(&req.username) {
        warn!("pwmod=\"{}\": request denied by validnames option", req.username);
        return ctx.stream.end_results().await;
    }
    let entry = match uid2entry(ctx.session, &cfg, &req.username).await? {
        Some(entry) => entry,
        None => {
            debug!("pwmod=\"{}\": user not found", req.username);
            return ctx.stream.end_results().await;
        }
    };
    if let Some(message) = &cfg.pam_password_prohibit_message {
        info!("pwmod=\"{}\": password change prohibited", req.username);
        ctx.stream.begin_record().await?;
        ctx.stream.write_i32(pam_rc::PERM_DENIED).await?;
        ctx.stream.write_string(message).await?;
        return ctx.stream.end_results().await;
    }
    let binddn;
    if asroot {
        binddn = match &cfg.rootpwmoddn {
            Some(dn) => dn.clone(),
            None => {
                info!("pwmod=\"{}\": rootpwmoddn not configured", req.username);
                return Err(NsdError::proto("password change as root not enabled"));
            }
        };
        if oldpassword.is_empty() && ctx.caller.is_root() {
            if let Some(pw) = &cfg.rootpwmodpw {
                oldpassword = pw.clone();
            }
        }
    } else {
        binddn = entry.dn().to_string();
        // password changes by the user are subject to the minimum age
        let (rc, msg) = check_shadow(ctx.session, &cfg, &req.username, false, true).await?;
        if rc != pam_rc::SUCCESS {
            ctx.stream.begin_record().await?;
            ctx.stream.write_i32(rc).await?;
            ctx.stream.write_string(&msg).await?;
            return ctx.stream.end_results().await;
        }
    }
    match try_pwmod(
        ctx.session,
        &cfg,
        &binddn,
        entry.dn(),
        &oldpassword,
        &newpassword,
    )
    .await
    {
        Ok(()) => {
            info!("password changed for {}", entry.dn());
            ctx.invalidate(MapSelector::Passwd);
            ctx.invalidate(MapSelector::Shadow);
            ctx.stream.begin_record().await?;
            ctx.stream.write_i32(pam_rc::SUCCESS).await?;
            ctx.stream.write_string("").await?;
        }
        Err(msg) => {
            let msg = format!("password change failed: {}", msg);
            warn!("pwmod=\"{}\": {}", req.username, msg);
            ctx.stream.begin_record().await?;
            ctx.stream.write_i32(pam_rc::PERM_DENIED).await?;
            ctx.stream.write_string(&msg).await?;
        }
    }
    ctx.stream.end_results().await
}

#[cfg(test)]
mod test {
    use super::*;

    fn props(
        lastchange: i64,
        mindays: i64,
        maxdays: i64,
        warndays: i64,
        inactdays: i64,
        expiredate: i64,
    ) -> ShadowProps {
        ShadowProps {
            lastchange,
            mindays,
            maxdays,
            warndays,
            inactdays,
            expiredate,
            flag: 0,
        }
    }

    #[test]
    fn account_expiry() {
        let (rc, msg) =
            check_shadow_props(props(-1, -1, -1, -1, -1, 10000), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::ACCT_EXPIRED);
        assert_eq!(msg, "Account expired 10000 days ago");
    }

    #[test]
    fn expiry_only_at_or_after_date() {
        let (rc, _) =
            check_shadow_props(props(-1, -1, -1, -1, -1, 20001), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::SUCCESS);
    }

    #[test]
    fn forced_change_when_never_changed() {
        let (rc, msg) = check_shadow_props(props(0, -1, 90, -1, -1, -1), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::NEW_AUTHTOK_REQD);
        assert_eq!(msg, "Need a new password");
    }

    #[test]
    fn password_age_enforced() {
        // changed 100 days ago with a 90 day maximum
        let (rc, msg) =
            check_shadow_props(props(19900, -1, 90, -1, -1, -1), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::NEW_AUTHTOK_REQD);
        assert_eq!(msg, "Password expired 10 days ago");
    }

    #[test]
    fn password_expires_today() {
        let (rc, msg) =
            check_shadow_props(props(19910, -1, 90, -1, -1, -1), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::NEW_AUTHTOK_REQD);
        assert_eq!(msg, "Password will expire today");
    }

    #[test]
    fn inactivity_locks_account() {
        // expired 10 days ago with 5 days of grace
        let (rc, msg) =
            check_shadow_props(props(19900, -1, 90, -1, 5, -1), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::AUTHTOK_EXPIRED);
        assert!(msg.contains("account locked 5 days ago"), "got: {}", msg);
    }

    #[test]
    fn inactivity_warning_before_lock() {
        // expired 3 days ago with 5 days of grace: still a password change
        let (rc, msg) =
            check_shadow_props(props(19907, -1, 90, -1, 5, -1), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::NEW_AUTHTOK_REQD);
        assert!(msg.contains("account will be locked in 2 days"), "got: {}", msg);
    }

    #[test]
    fn warning_window_is_not_a_denial() {
        let (rc, msg) =
            check_shadow_props(props(19915, -1, 90, 7, -1, -1), 20000, "dn", true, false);
        assert_eq!(rc, pam_rc::SUCCESS);
        assert_eq!(msg, "Password will expire in 5 days");
    }

    #[test]
    fn change_too_soon_rejected() {
        let (rc, msg) =
            check_shadow_props(props(19998, 7, -1, -1, -1, -1), 20000, "dn", false, true);
        assert_eq!(rc, pam_rc::AUTHTOK_ERR);
        assert_eq!(msg, "Password cannot be changed for another 5 days");
    }

    #[test]
    fn change_allowed_after_min_age() {
        let (rc, _) =
            check_shadow_props(props(19990, 7, -1, -1, -1, -1), 20000, "dn", false, true);
        assert_eq!(rc, pam_rc::SUCCESS);
    }

    #[test]
    fn no_shadow_data_passes() {
        let (rc, msg) =
            check_shadow_props(props(-1, -1, -1, -1, -1, -1), 20000, "dn", true, true);
        assert_eq!(rc, pam_rc::SUCCESS);
        assert!(msg.is_empty());
    }

    #[test]
    fn session_ids_are_distinct_and_well_formed() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
