//! The filter engine process.
//!
//! The engine receives its configuration from the parent as a
//! bracketed message sequence: it builds the new configuration on the
//! side and swaps it in atomically when the end marker arrives, so a
//! partially transferred policy is never in effect.  The actual
//! filtering policy logic lives behind this boundary.

use crate::{
    imsg::{Handler, Imsg, ImsgType},
    net::Fd,
    process::{self, Child, ENGINE},
    Error, SMTPFD_USER,
};
use nix::unistd::Pid;
use smtpfd_log::{debug, warn};
use std::{collections::HashMap, os::unix::io::AsRawFd};

/// The engine's view of one declared filter entry.
#[derive(Debug)]
struct EngineFilter {
    name: String,
    /// Concrete filters this entry expands to, for chains.
    nodes: Vec<String>,
}

/// A running filter process attached by the parent.
#[derive(Debug)]
struct FilterProc {
    pid: Pid,
    /// The engine's end of the filter's socketpair.
    socket: Fd,
}

/// One complete engine configuration.
#[derive(Debug, Default)]
struct EngineConf {
    /// Declared entries in announcement order.
    filters: Vec<EngineFilter>,
    /// Running filter processes by filter name.
    procs: HashMap<String, FilterProc>,
}

/// Main entrypoint of the engine process.
pub async fn main() -> Result<(), Error> {
    let child = Child::attach(ENGINE)?;
    process::privdrop(SMTPFD_USER)?;

    debug!("{} started", child);

    let mut frontend: Option<Handler> = None;
    let mut active = EngineConf::default();
    let mut pending: Option<EngineConf> = None;

    loop {
        match child.parent.recv_imsg().await? {
            Some(imsg) => dispatch_parent(&mut frontend, &mut active, &mut pending, imsg)?,
            None => break,
        }
    }

    debug!("terminating");
    Ok(())
}

fn dispatch_parent(
    frontend: &mut Option<Handler>,
    active: &mut EngineConf,
    pending: &mut Option<EngineConf>,
    imsg: Imsg,
) -> Result<(), Error> {
    match imsg.imsg_type() {
        Ok(ImsgType::SocketIpc) => match imsg.fd {
            Some(fd) => {
                *frontend = Some(Handler::from_raw_fd(fd)?);
                debug!("received frontend channel");
            }
            None => warn!("frontend channel message without descriptor"),
        },
        Ok(ImsgType::ReconfConf) => *pending = Some(EngineConf::default()),
        Ok(ImsgType::ReconfFilterProc) => {
            let name: String = imsg.decode()?;
            match pending.as_mut() {
                Some(conf) => match imsg.fd {
                    Some(socket) => {
                        let pid = Pid::from_raw(imsg.header.pid);
                        debug!("filter {} attached as pid {}", name, pid);
                        conf.procs.insert(name, FilterProc { pid, socket });
                    }
                    None => warn!("filter process {} without descriptor", name),
                },
                None => debug!("filter process attach outside reconfiguration"),
            }
        }
        Ok(ImsgType::ReconfFilter) => match pending.as_mut() {
            Some(conf) => conf.filters.push(EngineFilter {
                name: imsg.decode()?,
                nodes: Vec::new(),
            }),
            None => debug!("filter declaration outside reconfiguration"),
        },
        Ok(ImsgType::ReconfFilterNode) => {
            match pending.as_mut().and_then(|conf| conf.filters.last_mut()) {
                Some(filter) => filter.nodes.push(imsg.decode()?),
                None => debug!("filter node outside reconfiguration"),
            }
        }
        Ok(ImsgType::ReconfEnd) => match pending.take() {
            Some(conf) => {
                // Swap first; the previous configuration and its filter
                // sockets are released only afterwards.
                *active = conf;
                debug!(
                    "configuration installed: {} entries, {} filter processes",
                    active.filters.len(),
                    active.procs.len()
                );
                for filter in &active.filters {
                    debug!("filter {}: {} nodes", filter.name, filter.nodes.len());
                }
                for (name, filter_proc) in &active.procs {
                    debug!(
                        "filter process {}: pid {}, fd {}",
                        name,
                        filter_proc.pid,
                        filter_proc.socket.as_raw_fd()
                    );
                }
            }
            None => debug!("end of reconfiguration without start"),
        },
        _ => debug!("unexpected imsg {} from parent", imsg.header.id),
    }

    Ok(())
}
