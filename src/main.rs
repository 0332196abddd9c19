//! Daemon entry point: option parsing, configuration, privilege handling
//! and runtime bring-up.
//!
//! The invalidator child is forked before the async runtime is built so
//! the process is still single-threaded at that point, and the listening
//! socket is created before privileges are dropped.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, LevelFilter};
use nix::sys::signal::{signal, SigHandler, Signal};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;

use ldapnsd::invalidator::Invalidator;
use ldapnsd::{server, Config};

const DEFAULT_CONFIG_PATH: &str = "/etc/ldapnsd.conf";

struct Options {
    config_path: PathBuf,
    debug: u8,
    check_only: bool,
}

fn usage(program: &str) {
    eprintln!("Usage: {} [-c CONFIG] [-d] [-t] [-V]", program);
    eprintln!("  -c CONFIG  read configuration from CONFIG");
    eprintln!("  -d         increase logging detail (repeatable)");
    eprintln!("  -t         check the configuration and exit");
    eprintln!("  -V         print version information and exit");
}

fn parse_options() -> Result<Options, ExitCode> {
    let mut options = Options {
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        debug: 0,
        check_only: false,
    };
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "ldapnsd".to_string());
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => match args.next() {
                Some(path) => options.config_path = PathBuf::from(path),
                None => {
                    usage(&program);
                    return Err(ExitCode::FAILURE);
                }
            },
            "-d" | "--debug" => options.debug += 1,
            "-t" | "--check" => options.check_only = true,
            "-V" | "--version" => {
                println!("ldapnsd {}", env!("CARGO_PKG_VERSION"));
                return Err(ExitCode::SUCCESS);
            }
            "-h" | "--help" => {
                usage(&program);
                return Err(ExitCode::SUCCESS);
            }
            other => {
                eprintln!("{}: unknown option \"{}\"", program, other);
                usage(&program);
                return Err(ExitCode::FAILURE);
            }
        }
    }
    Ok(options)
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn main() -> ExitCode {
    let options = match parse_options() {
        Ok(options) => options,
        Err(code) => return code,
    };
    init_logging(options.debug);
    let cfg = match Config::load(&options.config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("{}: {}", options.config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if options.check_only {
        info!("configuration {} is ok", options.config_path.display());
        return ExitCode::SUCCESS;
    }
    // a half-closed client or directory connection must produce write
    // errors, not kill the process
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
    // fork the invalidator while still single-threaded and privileged
    let invalidator = if cfg.reconnect_invalidate.is_empty() {
        None
    } else {
        match Invalidator::start(cfg.clone()) {
            Ok(inv) => Some(Arc::new(inv)),
            Err(e) => {
                error!("cannot start invalidator: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async move {
        let listener = match server::bind_socket(&cfg) {
            Ok(listener) => listener,
            Err(e) => {
                error!("cannot create socket: {}", e);
                return ExitCode::from(2);
            }
        };
        if let Err(e) = server::drop_privileges(&cfg) {
            error!("cannot drop privileges: {}", e);
            return ExitCode::from(2);
        }
        let shutdown = CancellationToken::new();
        tokio::spawn(wait_for_signal(shutdown.clone()));
        info!("ldapnsd {} accepting connections", env!("CARGO_PKG_VERSION"));
        server::run(cfg, listener, invalidator, shutdown).await;
        info!("stopped");
        ExitCode::SUCCESS
    })
}

/// Trip the shutdown token on SIGHUP, SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let mut hangup = match unix_signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGHUP handler: {}", e);
            return;
        }
    };
    let mut interrupt = match unix_signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGINT handler: {}", e);
            return;
        }
    };
    let mut terminate = match unix_signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGTERM handler: {}", e);
            return;
        }
    };
    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    info!("caught {}, stopping", name);
    shutdown.cancel();
}
