//! External cache invalidation.
//!
//! A child process is forked once at daemon start, before the runtime is
//! built and before privileges are dropped, so it can still execute the
//! external flush commands (`nscd -i <db>`, `nfsidmap -c`). The parent
//! keeps the non-blocking write end of a pipe; every byte written is one
//! map code, with 0 requesting every map flagged by
//! `reconnect_invalidate`. The child exits when the pipe reaches EOF,
//! which happens exactly when the daemon does.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;
use std::sync::Arc;

use log::{debug, error, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{chdir, fork, ForkResult};

use crate::attmap::MapSelector;
use crate::config::Config;
use crate::result::{NsdError, Result};

/// Wire code requesting invalidation of all configured maps.
pub const INVALIDATE_ALL: u8 = 0;

/// Sanitized search path for the flush commands.
const SAFE_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Parent-side handle to the invalidator child.
pub struct Invalidator {
    fd: OwnedFd,
}

impl Invalidator {
    /// Fork the child. MUST be called from a single-threaded context,
    /// before the async runtime exists.
    pub fn start(cfg: Arc<Config>) -> Result<Invalidator> {
        let (read_fd, write_fd) =
            nix::unistd::pipe().map_err(|e| NsdError::Io { source: e.into() })?;
        // SAFETY: freshly returned by pipe(), not owned by anything else
        let read_fd = unsafe { OwnedFd::from_raw_fd(read_fd) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(write_fd) };
        // a stalled child must not block request handling
        let flags = fcntl(write_fd.as_raw_fd(), FcntlArg::F_GETFL)
            .map_err(|e| NsdError::Io { source: e.into() })?;
        fcntl(
            write_fd.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(|e| NsdError::Io { source: e.into() })?;
        // SAFETY: called before any threads are spawned; the child only
        // runs async-signal-safe setup before its blocking read loop
        match unsafe { fork() }.map_err(|e| NsdError::Io { source: e.into() })? {
            ForkResult::Child => {
                drop(write_fd);
                child_loop(read_fd, &cfg)
            }
            ForkResult::Parent { child } => {
                drop(read_fd);
                debug!("invalidator started (pid {})", child);
                Ok(Invalidator { fd: write_fd })
            }
        }
    }

    /// Request invalidation of one map. Failures are logged and dropped;
    /// they never fail the originating request.
    pub fn signal(&self, map: MapSelector) {
        self.send(map.code());
    }

    /// Request invalidation of every map configured in
    /// `reconnect_invalidate`.
    pub fn signal_all(&self) {
        self.send(INVALIDATE_ALL);
    }

    fn send(&self, code: u8) {
        if let Err(e) = nix::unistd::write(self.fd.as_raw_fd(), &[code]) {
            warn!("error signalling invalidator: {}", e);
        }
    }
}

/// Resolve a map to the external database name; maps without an external
/// cache have none.
fn map_db_name(map: MapSelector) -> Option<&'static str> {
    match map {
        MapSelector::Automount => None,
        map => Some(map.name()),
    }
}

fn child_loop(fd: OwnedFd, cfg: &Config) -> ! {
    debug!("invalidator: starting");
    let _ = chdir("/");
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => {
                debug!("invalidator: EOF");
                std::process::exit(0);
            }
            Ok(_) => {
                if buf[0] == INVALIDATE_ALL {
                    let mut maps: Vec<MapSelector> =
                        cfg.reconnect_invalidate.iter().copied().collect();
                    maps.sort();
                    for map in maps {
                        run_invalidate(map);
                    }
                } else {
                    match MapSelector::from_code(buf[0]) {
                        Some(map) => run_invalidate(map),
                        None => error!("invalidator: invalid db code {} received", buf[0]),
                    }
                }
            }
            Err(nix::errno::Errno::EINTR) => {
                debug!("invalidator: read interrupted (ignored)");
            }
            Err(e) => {
                error!("invalidator: read failed: {}", e);
                std::process::exit(0);
            }
        }
    }
}

/// Run the flush command for one database with a minimal environment,
/// waiting for it to finish.
fn run_invalidate(map: MapSelector) {
    let db = match map_db_name(map) {
        Some(db) => db,
        None => return,
    };
    let mut command = if map == MapSelector::NfsIdmap {
        let mut c = Command::new("nfsidmap");
        c.arg("-c");
        c
    } else {
        let mut c = Command::new("nscd");
        c.args(["-i", db]);
        c
    };
    command.env_clear().env("PATH", SAFE_PATH);
    debug!("invalidator: {:?}", command);
    match command.status() {
        Ok(status) if status.success() => {
            debug!("invalidator: flush of {} succeeded", db);
        }
        Ok(status) => {
            debug!("invalidator: flush of {} failed ({})", db, status);
        }
        Err(e) => {
            error!("invalidator: cannot run flush command for {}: {}", db, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn map_codes_roundtrip() {
        for map in MapSelector::ALL {
            assert_ne!(map.code(), INVALIDATE_ALL);
            assert_eq!(MapSelector::from_code(map.code()), Some(map));
        }
        assert_eq!(MapSelector::from_code(INVALIDATE_ALL), None);
    }

    #[test]
    fn nscd_has_no_automount_database() {
        assert_eq!(map_db_name(MapSelector::Automount), None);
        assert_eq!(map_db_name(MapSelector::Passwd), Some("passwd"));
        assert_eq!(map_db_name(MapSelector::NfsIdmap), Some("nfsidmap"));
    }
}
