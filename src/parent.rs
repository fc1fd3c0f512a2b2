//! The privileged parent process.
//!
//! The parent is the only process that forks: it spawns the frontend
//! and engine roles, forks one child per configured filter, and wires
//! everything together over socketpairs.  Afterwards it runs a single
//! dispatch loop that reaps children, relays control requests, and
//! drives configuration reloads.

use crate::{
    config::{self, Config, FilterSpec},
    imsg::{Handler, Header, Imsg, ImsgType},
    process::{self, FilterChild, Peer, ENGINE, FRONTEND},
    Error,
};
use nix::{
    errno::Errno,
    sys::wait::{wait, waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use smtpfd_log::{debug, info, warn};
use std::collections::HashMap;
use tokio::signal::unix::{signal, SignalKind};

/// Command-line settings the parent needs at runtime.
#[derive(Debug)]
pub struct Options {
    pub debug: bool,
    pub verbose: i32,
    pub conffile: String,
    pub csock: String,
    pub macros: Vec<(String, String)>,
}

/// Mutable daemon state, owned by the dispatch loop.
#[derive(Debug)]
struct SupervisorState {
    /// The active configuration.
    conf: Config,
    /// Live filter processes by filter name.
    filters: HashMap<String, Pid>,
    opts: Options,
}

/// Main entrypoint of the parent process.
///
/// Only returns on a fatal startup error; otherwise it terminates the
/// process from the shutdown path.
pub async fn main(opts: Options, conf: Config) -> Result<(), Error> {
    // Signals feed the same dispatch loop as the message channels, so
    // their handlers below are ordinary sequential code.
    let mut sigchld = signal(SignalKind::child())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let frontend = Peer::exec(FRONTEND, &frontend_args(&opts))?;
    let engine = Peer::exec(ENGINE, &engine_args(&opts))?;

    // Connect the two children; the parent stays out of their traffic.
    let (frontend_fd, engine_fd) = Handler::socketpair()?;
    frontend
        .handler
        .send_message(Header::new(ImsgType::SocketIpc), Some(&frontend_fd), &())
        .await?;
    engine
        .handler
        .send_message(Header::new(ImsgType::SocketIpc), Some(&engine_fd), &())
        .await?;
    drop(frontend_fd);
    drop(engine_fd);

    let mut state = SupervisorState {
        conf,
        filters: HashMap::new(),
        opts,
    };

    distribute(&mut state.filters, &engine, &state.conf).await?;

    process::sandbox()?;

    loop {
        tokio::select! {
            _ = sigchld.recv() => reap(&mut state),
            _ = sighup.recv() => reload(&mut state, &engine).await,
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            message = frontend.handler.recv_imsg() => match message {
                Ok(Some(imsg)) => {
                    if let Err(err) = dispatch_frontend(&mut state, &frontend, &engine, imsg).await {
                        warn!("frontend channel: {}", err);
                        break;
                    }
                }
                Ok(None) => {
                    warn!("frontend terminated unexpectedly");
                    break;
                }
                Err(err) => {
                    warn!("frontend channel: {}", err);
                    break;
                }
            },
            message = engine.handler.recv_imsg() => match message {
                Ok(Some(imsg)) => dispatch_engine(&imsg),
                Ok(None) => {
                    warn!("engine terminated unexpectedly");
                    break;
                }
                Err(err) => {
                    warn!("engine channel: {}", err);
                    break;
                }
            },
        }
    }

    shutdown(state, frontend, engine)
}

fn frontend_args(opts: &Options) -> Vec<String> {
    let mut args = vec!["-F".to_string()];
    push_common_args(&mut args, opts);
    args.push("-s".to_string());
    args.push(opts.csock.clone());
    args
}

fn engine_args(opts: &Options) -> Vec<String> {
    let mut args = vec!["-E".to_string()];
    push_common_args(&mut args, opts);
    args
}

fn push_common_args(args: &mut Vec<String>, opts: &Options) {
    if opts.debug {
        args.push("-d".to_string());
    }
    for _ in 0..opts.verbose {
        args.push("-v".to_string());
    }
}

/// Handle a control request forwarded by the frontend.
async fn dispatch_frontend(
    state: &mut SupervisorState,
    frontend: &Peer,
    engine: &Peer,
    imsg: Imsg,
) -> Result<(), Error> {
    match imsg.imsg_type() {
        Ok(ImsgType::CtlReload) => reload(state, engine).await,
        Ok(ImsgType::CtlLogVerbose) => {
            // Already validated by the frontend.
            let verbose: i32 = imsg.decode()?;
            smtpfd_log::set_verbose(verbose);
        }
        Ok(ImsgType::CtlShowMainInfo) => {
            let mut header = Header::new(ImsgType::CtlEnd);
            header.peer_id = imsg.header.peer_id;
            frontend.handler.send_message(header, None, &()).await?;
        }
        _ => debug!("unexpected imsg {} from frontend", imsg.header.id),
    }

    Ok(())
}

fn dispatch_engine(imsg: &Imsg) {
    // The engine has nothing to ask the parent for.
    debug!("unexpected imsg {} from engine", imsg.header.id);
}

/// Parse and distribute a new configuration, keeping the old one on
/// any failure.
async fn reload(state: &mut SupervisorState, engine: &Peer) {
    match try_reload(state, engine).await {
        Ok(()) => info!("configuration reloaded"),
        Err(err) => warn!("configuration reload failed: {}", err),
    }
}

async fn try_reload(state: &mut SupervisorState, engine: &Peer) -> Result<(), Error> {
    let xconf = config::parse_file(&state.opts.conffile, &state.opts.macros)?;

    distribute(&mut state.filters, engine, &xconf).await?;

    // Discard the old configuration only now that the new one is in
    // effect on the engine side.
    state.conf = xconf;

    Ok(())
}

/// Fork the filter processes of `conf` and send the configuration to
/// the engine.
async fn distribute(
    filters: &mut HashMap<String, Pid>,
    engine: &Peer,
    conf: &Config,
) -> Result<(), Error> {
    send_config(&engine.handler, conf, |spec| {
        let child = process::exec_filter(spec)?;
        filters.insert(spec.name.clone(), child.pid);
        Ok(child)
    })
    .await
}

/// Send a configuration to the engine as one bracketed sequence.
///
/// The spawn step is a callback so the message sequence can be tested
/// without forking.
pub async fn send_config<F>(engine: &Handler, conf: &Config, mut spawn: F) -> Result<(), Error>
where
    F: FnMut(&FilterSpec) -> Result<FilterChild, Error>,
{
    // Tell the engine to start building a separate configuration.
    engine
        .send_message(Header::new(ImsgType::ReconfConf), None, &())
        .await?;

    // Fork the filter processes and hand their sockets over.
    for spec in conf.filters.iter().filter(|spec| !spec.chain) {
        let child = spawn(spec)?;
        let mut header = Header::new(ImsgType::ReconfFilterProc);
        header.pid = child.pid.as_raw();
        engine
            .send_message(header, Some(&child.fd), &spec.name)
            .await?;
    }

    // Declare every entry, expanding chains to their concrete leaves.
    for spec in &conf.filters {
        engine
            .send_message(Header::new(ImsgType::ReconfFilter), None, &spec.name)
            .await?;
        if spec.chain {
            for leaf in conf.resolve_chain(&spec.name)? {
                engine
                    .send_message(Header::new(ImsgType::ReconfFilterNode), None, &leaf)
                    .await?;
            }
        }
    }

    // Tell the engine the revised configuration is now complete.
    engine
        .send_message(Header::new(ImsgType::ReconfEnd), None, &())
        .await?;

    Ok(())
}

/// Collect every exited child without blocking the loop.
fn reap(state: &mut SupervisorState) {
    loop {
        let status = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!("waitpid: {}", err);
                break;
            }
        };

        let pid = match status {
            WaitStatus::StillAlive => break,
            WaitStatus::Signaled(pid, signal, _) => {
                warn!("process {} terminated by signal {}", pid, signal);
                pid
            }
            WaitStatus::Exited(pid, 0) => {
                debug!("process {} exited normally", pid);
                pid
            }
            WaitStatus::Exited(pid, status) => {
                warn!("process {} exited with status {}", pid, status);
                pid
            }
            // Stopped or continued children stay tracked.
            _ => continue,
        };

        state.filters.retain(|_, filter_pid| *filter_pid != pid);
    }
}

/// Tear down the process tree and terminate.
fn shutdown(state: SupervisorState, frontend: Peer, engine: Peer) -> ! {
    let frontend_pid = frontend.pid;
    let engine_pid = engine.pid;

    // Close the channels; the children exit when their parent socket
    // reports the peer gone.
    drop(frontend);
    drop(engine);

    let SupervisorState { conf, filters, opts } = state;
    drop(conf);
    drop(filters);

    debug!("waiting for children to terminate");
    loop {
        match wait() {
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                let role = if pid == engine_pid {
                    ENGINE
                } else if pid == frontend_pid {
                    FRONTEND
                } else {
                    "filter"
                };
                warn!("{} terminated; signal {}", role, signal);
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break,
            Err(err) => {
                warn!("wait: {}", err);
                break;
            }
        }
    }

    let _ = nix::unistd::unlink(opts.csock.as_str());

    info!("terminating");
    std::process::exit(0)
}
