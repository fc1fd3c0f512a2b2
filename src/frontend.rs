//! The frontend process.
//!
//! The frontend owns the control socket.  Control clients speak the
//! same imsg protocol as the internal channels; their requests are
//! forwarded to the parent tagged with a per-client correlation id,
//! and the parent's replies are relayed back to the matching client.
//! The network-facing listener logic lives behind this boundary.

use crate::{
    imsg::{Handler, Header, Imsg, ImsgType},
    process::{self, Child, FRONTEND},
    Error, SMTPFD_USER,
};
use smtpfd_log::{debug, warn};
use std::fs;
use tokio::net::UnixListener;

/// Main entrypoint of the frontend process.
pub async fn main(csock: String) -> Result<(), Error> {
    let child = Child::attach(FRONTEND)?;

    // Bind the control socket while we still have the privileges to do
    // so; a stale socket from a previous run is removed first.
    let _ = fs::remove_file(&csock);
    let control = UnixListener::bind(&csock)?;

    process::privdrop(SMTPFD_USER)?;

    debug!("{} started", child);

    let mut engine: Option<Handler> = None;
    let mut client_id: u32 = 0;

    loop {
        tokio::select! {
            accepted = control.accept() => {
                let (stream, _) = accepted?;
                client_id = client_id.wrapping_add(1);
                // Control clients are served one at a time; further
                // connections wait in the listen backlog.
                if !serve_client(&child, &mut engine, Handler::from(stream), client_id).await? {
                    break;
                }
            }
            message = child.parent.recv_imsg() => match message? {
                Some(imsg) => dispatch_parent(&mut engine, imsg)?,
                None => break,
            },
        }
    }

    debug!("terminating");
    Ok(())
}

/// Serve one control client until it disconnects.
///
/// Returns `Ok(false)` when the parent channel closed and the frontend
/// should exit.
async fn serve_client(
    child: &Child,
    engine: &mut Option<Handler>,
    client: Handler,
    client_id: u32,
) -> Result<bool, Error> {
    loop {
        tokio::select! {
            message = child.parent.recv_imsg() => match message? {
                Some(imsg) => match imsg.imsg_type() {
                    Ok(ImsgType::CtlEnd) if imsg.header.peer_id == client_id => {
                        let mut header = Header::new(ImsgType::CtlEnd);
                        header.peer_id = client_id;
                        if client.send_message(header, None, &()).await.is_err() {
                            // The client went away before its reply.
                            return Ok(true);
                        }
                    }
                    _ => dispatch_parent(engine, imsg)?,
                },
                None => return Ok(false),
            },
            message = client.recv_imsg() => match message {
                Ok(Some(imsg)) => forward_request(child, &imsg, client_id).await?,
                // A vanished or misbehaving client ends its own session only.
                Ok(None) | Err(_) => return Ok(true),
            },
        }
    }
}

/// Forward a control request to the parent.
async fn forward_request(child: &Child, imsg: &Imsg, client_id: u32) -> Result<(), Error> {
    match imsg.imsg_type() {
        Ok(id @ ImsgType::CtlReload) | Ok(id @ ImsgType::CtlShowMainInfo) => {
            let mut header = Header::new(id);
            header.peer_id = client_id;
            child.parent.send_message(header, None, &()).await?;
        }
        Ok(ImsgType::CtlLogVerbose) => {
            let verbose: i32 = match imsg.decode() {
                Ok(verbose) => verbose,
                Err(err) => {
                    debug!("bad verbosity payload: {}", err);
                    return Ok(());
                }
            };
            smtpfd_log::set_verbose(verbose);
            let mut header = Header::new(ImsgType::CtlLogVerbose);
            header.peer_id = client_id;
            child.parent.send_message(header, None, &verbose).await?;
        }
        _ => debug!("unsupported control request {}", imsg.header.id),
    }

    Ok(())
}

fn dispatch_parent(engine: &mut Option<Handler>, imsg: Imsg) -> Result<(), Error> {
    match imsg.imsg_type() {
        Ok(ImsgType::SocketIpc) => match imsg.fd {
            Some(fd) => {
                *engine = Some(Handler::from_raw_fd(fd)?);
                debug!("received engine channel");
            }
            None => warn!("engine channel message without descriptor"),
        },
        Ok(ImsgType::CtlEnd) => debug!("control reply for a vanished client"),
        _ => debug!("unexpected imsg {} from parent", imsg.header.id),
    }

    Ok(())
}
