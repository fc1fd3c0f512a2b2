//! Configuration and setup of the privilege-separated processes.

use crate::{
    config::FilterSpec,
    imsg::Handler,
    net::Fd,
    Error,
};
use cfg_if::cfg_if;
use close_fds::close_open_fds;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
    unistd::{self, chdir, chroot, dup2, execv, execvp, fork, geteuid, getpid, ForkResult, Pid, User},
};
use smtpfd_log::debug;
use std::{
    env,
    ffi::CString,
    fmt,
    os::unix::{
        ffi::OsStrExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
};

/// Internal file descriptor that is passed to child processes.
pub const PRIVSEP_FD: RawFd = 3;

/// Role name of the frontend process.
pub const FRONTEND: &str = "frontend";

/// Role name of the engine process.
pub const ENGINE: &str = "engine";

/// A supervised child process, from the parent's point of view.
#[derive(Debug)]
pub struct Peer {
    /// The process role.
    pub name: &'static str,
    /// Process PID.
    pub pid: Pid,
    /// IPC channel to the child process.
    pub handler: Handler,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.pid)
    }
}

impl Peer {
    /// Fork and re-execute the daemon in the given role.
    ///
    /// The child finds its end of the channel on `PRIVSEP_FD`; every
    /// other inherited descriptor above it is closed before the exec.
    /// Returns a fully wired handle or an error, never a partially
    /// wired child.
    pub fn exec(name: &'static str, args: &[String]) -> Result<Self, Error> {
        let program = env::current_exe()?;
        let program_c = path_to_cstr(program.as_path())?;
        let mut argv = vec![path_to_cstr(program.as_path())?];
        for arg in args {
            argv.push(CString::new(arg.as_str())?);
        }

        let (handler, remote) = Handler::pair()?;

        match unsafe { fork() }? {
            ForkResult::Parent { child, .. } => {
                drop(remote);
                debug!("forked {} as pid {}", name, child);
                Ok(Peer {
                    name,
                    pid: child,
                    handler,
                })
            }
            ForkResult::Child => {
                if let Ok(fd) = dup2(remote.as_raw_fd(), PRIVSEP_FD) {
                    if set_cloexec(fd, false).is_ok() {
                        unsafe {
                            close_open_fds(PRIVSEP_FD + 1, &[]);
                        }
                        let _ = execv(&program_c, &argv);
                    }
                }
                // The exec did not happen; nothing sane is left to run.
                unsafe { libc::_exit(1) }
            }
        }
    }
}

/// A filter child process whose socket is handed to the engine.
#[derive(Debug)]
pub struct FilterChild {
    /// The engine's end of the filter socketpair.
    pub fd: Fd,
    /// Process PID.
    pub pid: Pid,
}

/// Fork a concrete filter and execute its configured program.
///
/// The filter finds its end of the socketpair on `PRIVSEP_FD`; the
/// other end is returned so it can be passed to the engine.
pub fn exec_filter(spec: &FilterSpec) -> Result<FilterChild, Error> {
    if spec.chain || spec.args.is_empty() {
        return Err(Error::ConfigError(format!(
            "filter {} has no program to execute",
            spec.name
        )));
    }

    let mut argv = Vec::with_capacity(spec.args.len());
    for arg in &spec.args {
        argv.push(CString::new(arg.as_str())?);
    }

    let (engine_end, filter_end) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK,
    )?;
    let engine_end = Fd::from(engine_end);
    let filter_end = Fd::from(filter_end);

    match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => {
            drop(filter_end);
            debug!("forked filter {} as pid {}", spec.name, child);
            Ok(FilterChild {
                fd: engine_end,
                pid: child,
            })
        }
        ForkResult::Child => {
            if dup2(filter_end.as_raw_fd(), PRIVSEP_FD).is_ok() {
                unsafe {
                    close_open_fds(PRIVSEP_FD + 1, &[]);
                }
                let _ = execvp(&argv[0], &argv);
            }
            unsafe { libc::_exit(1) }
        }
    }
}

/// A child process, from its own point of view.
#[derive(Debug)]
pub struct Child {
    /// Process role.
    pub name: &'static str,
    /// Process PID.
    pub pid: Pid,
    /// Channel to the parent process.
    pub parent: Handler,
}

impl fmt::Display for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.pid)
    }
}

impl Child {
    /// Attach to the parent channel on `PRIVSEP_FD`.
    pub fn attach(name: &'static str) -> Result<Self, Error> {
        set_cloexec(PRIVSEP_FD, true)?;
        let parent = Handler::from_raw_fd(PRIVSEP_FD)?;

        Ok(Self {
            name,
            pid: getpid(),
            parent,
        })
    }
}

/// Verify that we are root and that the daemon user exists.
pub fn check_privileges(username: &str) -> Result<(), Error> {
    if !geteuid().is_root() {
        return Err(Error::PermissionDenied);
    }
    User::from_name(username)?
        .map(|_| ())
        .ok_or_else(|| Error::UserNotFound(username.to_string()))
}

/// Drop privileges to the given user, chrooted to its home directory.
pub fn privdrop(username: &str) -> Result<(), Error> {
    let user = User::from_name(username)?
        .ok_or_else(|| Error::UserNotFound(username.to_string()))?;

    // chroot and change the working directory.
    let dir = if user.dir.is_dir() {
        user.dir.as_path()
    } else {
        Path::new("/var/empty")
    };
    chroot(dir).map_err(|err| Error::Privdrop("chroot", err))?;
    chdir("/").map_err(|err| Error::Privdrop("chdir", err))?;

    // Set the supplementary groups.
    #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
    unistd::setgroups(&[user.gid]).map_err(|err| Error::Privdrop("setgroups", err))?;

    // Drop the privileges.
    cfg_if! {
        if #[cfg(any(target_os = "android", target_os = "freebsd",
                     target_os = "linux", target_os = "openbsd"))] {
            unistd::setresgid(user.gid, user.gid, user.gid)
                .map_err(|err| Error::Privdrop("setresgid", err))?;
            unistd::setresuid(user.uid, user.uid, user.uid)
                .map_err(|err| Error::Privdrop("setresuid", err))?;
        } else {
            unistd::setegid(user.gid).map_err(|err| Error::Privdrop("setegid", err))?;
            unistd::setgid(user.gid).map_err(|err| Error::Privdrop("setgid", err))?;
            // seteuid before setuid fails on macOS (and AIX...)
            #[cfg(not(any(target_os = "ios", target_os = "macos")))]
            unistd::seteuid(user.uid).map_err(|err| Error::Privdrop("seteuid", err))?;
            unistd::setuid(user.uid).map_err(|err| Error::Privdrop("setuid", err))?;
        }
    }

    Ok(())
}

/// Restrict the parent to the operations it still needs: logging,
/// reading the configuration, forking filters, and passing their
/// sockets on.
pub fn sandbox() -> Result<(), Error> {
    cfg_if! {
        if #[cfg(target_os = "openbsd")] {
            let promises = CString::new("stdio rpath proc exec sendfd cpath")?;
            if unsafe { libc::pledge(promises.as_ptr(), std::ptr::null()) } == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        } else {
            debug!("process sandbox not available on this platform");
        }
    }

    Ok(())
}

/// Detach from the controlling terminal and run in the background.
pub fn daemonize() -> Result<(), Error> {
    cfg_if! {
        if #[cfg(not(any(target_os = "ios", target_os = "macos")))] {
            unistd::daemon(true, false)?;
        } else {
            return Err(Error::Error("daemonization not supported on this platform"));
        }
    }

    Ok(())
}

fn set_cloexec(fd: RawFd, add: bool) -> Result<(), Error> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

fn path_to_cstr(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes()).map_err(Into::into)
}
