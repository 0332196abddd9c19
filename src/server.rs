//! The local socket server: acceptor, worker pool and request routing.
//!
//! A fixed number of worker tasks share the listening socket; each worker
//! owns one LDAP session and serves one client connection at a time, so
//! no directory state is ever shared between requests. Shutdown is
//! coordinated through a cancellation token: workers finish the request
//! they are on and exit, and the whole pool is drained with a bounded
//! wait.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::handlers::{self, Caller, RequestCtx};
use crate::invalidator::Invalidator;
use crate::pam;
use crate::proto::{Action, ProtoStream};
use crate::result::{NsdError, Result};
use crate::session::Session;

/// How long workers get to finish their in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Create the listening socket with permissions that let any local user
/// connect. A stale socket file from a previous run is removed first.
pub fn bind_socket(cfg: &Config) -> Result<UnixListener> {
    let path = &cfg.socket_path;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!("cannot remove {} (ignored): {}", path.display(), e);
        }
    }
    let listener = UnixListener::bind(path)?;
    // NSS answers go to arbitrary local processes
    std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(0o666))?;
    info!("listening on {}", path.display());
    Ok(listener)
}

/// Drop to the configured unprivileged identity. Supplemental groups are
/// cleared first; the invalidator child keeps the original privileges.
pub fn drop_privileges(cfg: &Config) -> Result<()> {
    if cfg.run_uid.is_none() && cfg.run_gid.is_none() {
        return Ok(());
    }
    if let Err(e) = setgroups(&[]) {
        warn!("cannot setgroups() (ignored): {}", e);
    }
    if let Some(gid) = cfg.run_gid {
        setgid(Gid::from_raw(gid)).map_err(|e| NsdError::Io { source: e.into() })?;
        debug!("setgid({}) done", gid);
    }
    if let Some(uid) = cfg.run_uid {
        setuid(Uid::from_raw(uid)).map_err(|e| NsdError::Io { source: e.into() })?;
        debug!("setuid({}) done", uid);
    }
    Ok(())
}

/// Run the worker pool until the shutdown token fires, then drain it.
pub async fn run(
    cfg: Arc<Config>,
    listener: UnixListener,
    invalidator: Option<Arc<Invalidator>>,
    shutdown: CancellationToken,
) {
    let listener = Arc::new(listener);
    let mut workers = JoinSet::new();
    for id in 0..cfg.threads {
        let cfg = cfg.clone();
        let listener = listener.clone();
        let invalidator = invalidator.clone();
        let shutdown = shutdown.clone();
        workers.spawn(worker_loop(id, cfg, listener, invalidator, shutdown));
    }
    shutdown.cancelled().await;
    info!("shutting down");
    let drain = async {
        while workers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("workers did not finish within the grace period");
    }
}

async fn worker_loop(
    id: usize,
    cfg: Arc<Config>,
    listener: Arc<UnixListener>,
    invalidator: Option<Arc<Invalidator>>,
    shutdown: CancellationToken,
) {
    debug!("worker {} started", id);
    let mut session = Session::new(cfg.clone());
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("worker {}: accept() failed: {}", id, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        handle_connection(stream, &mut session, &cfg, &invalidator).await;
        // a reconnect may have left external caches stale
        if session.reconnected {
            session.reconnected = false;
            if !cfg.reconnect_invalidate.is_empty() {
                if let Some(inv) = &invalidator {
                    inv.signal_all();
                }
            }
        }
    }
    session.close().await;
    debug!("worker {} stopped", id);
}

/// Serve one connection: exactly one request, one response.
async fn handle_connection(
    stream: UnixStream,
    session: &mut Session,
    cfg: &Arc<Config>,
    invalidator: &Option<Arc<Invalidator>>,
) {
    let caller = match stream.peer_cred() {
        Ok(cred) => Caller {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        },
        Err(e) => {
            warn!("cannot get peer credentials: {}", e);
            return;
        }
    };
    let mut proto = ProtoStream::new(stream);
    proto.start_request();
    let action = match proto.read_request_header().await {
        Ok(action) => action,
        Err(NsdError::Disconnect) => {
            debug!("client disconnected before sending a request");
            return;
        }
        Err(e) => {
            warn!("invalid request: {}", e);
            return;
        }
    };
    debug!(
        "handling {} for uid={} gid={} pid={}",
        action,
        caller.uid,
        caller.gid,
        caller.pid.unwrap_or(-1)
    );
    let mut ctx = RequestCtx {
        stream: &mut proto,
        session,
        cfg: cfg.clone(),
        caller,
        invalidator: invalidator.clone(),
    };
    match dispatch(action, &mut ctx).await {
        Ok(()) => {}
        Err(NsdError::Io { source }) if source.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("{}: client went away: {}", action, source);
        }
        Err(NsdError::Protocol(msg)) => {
            warn!("{}: protocol error: {}", action, msg);
        }
        Err(e) => {
            warn!("{}: request failed: {}", action, e);
        }
    }
    // deliver whatever was written before an abort; the missing END
    // marker tells the client the response is incomplete
    let _ = proto.flush().await;
}

/// Route a decoded action to its handler.
async fn dispatch<S>(action: Action, ctx: &mut RequestCtx<'_, S>) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    use Action::*;
    match action {
        ConfigGet => handlers::config::get(ctx).await,
        AliasByName => handlers::aliases::byname(ctx).await,
        AliasAll => handlers::aliases::all(ctx).await,
        EtherByName => handlers::ethers::byname(ctx).await,
        EtherByEther => handlers::ethers::byether(ctx).await,
        EtherAll => handlers::ethers::all(ctx).await,
        GroupByName => handlers::group::byname(ctx).await,
        GroupByGid => handlers::group::bygid(ctx).await,
        GroupByMember => handlers::group::bymember(ctx).await,
        GroupAll => handlers::group::all(ctx).await,
        HostByName => handlers::hosts::byname(ctx).await,
        HostByAddr => handlers::hosts::byaddr(ctx).await,
        HostAll => handlers::hosts::all(ctx).await,
        NetgroupByName => handlers::netgroup::byname(ctx).await,
        NetgroupAll => handlers::netgroup::all(ctx).await,
        NetworkByName => handlers::networks::byname(ctx).await,
        NetworkByAddr => handlers::networks::byaddr(ctx).await,
        NetworkAll => handlers::networks::all(ctx).await,
        PasswdByName => handlers::passwd::byname(ctx).await,
        PasswdByUid => handlers::passwd::byuid(ctx).await,
        PasswdAll => handlers::passwd::all(ctx).await,
        ProtocolByName => handlers::protocols::byname(ctx).await,
        ProtocolByNumber => handlers::protocols::bynumber(ctx).await,
        ProtocolAll => handlers::protocols::all(ctx).await,
        RpcByName => handlers::rpc::byname(ctx).await,
        RpcByNumber => handlers::rpc::bynumber(ctx).await,
        RpcAll => handlers::rpc::all(ctx).await,
        ServiceByName => handlers::services::byname(ctx).await,
        ServiceByNumber => handlers::services::bynumber(ctx).await,
        ServiceAll => handlers::services::all(ctx).await,
        ShadowByName => handlers::shadow::byname(ctx).await,
        ShadowAll => handlers::shadow::all(ctx).await,
        PamAuthc => pam::authc(ctx).await,
        PamAuthz => pam::authz(ctx).await,
        PamSessOpen => pam::sess_open(ctx).await,
        PamSessClose => pam::sess_close(ctx).await,
        PamPwMod => pam::pwmod(ctx).await,
        UserMod => handlers::usermod::usermod(ctx).await,
        AutomountByName => handlers::automount::byname(ctx).await,
        AutomountAll => handlers::automount::all(ctx).await,
    }
}
