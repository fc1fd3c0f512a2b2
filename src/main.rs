use clap::{ArgAction, Parser};
use smtpfd::{config, engine, frontend, parent, process, Error, CONF_FILE, SMTPFD_SOCKET, SMTPFD_USER};
use smtpfd_log::{error, info, warn};
use tokio::runtime;

/// Privilege-separated SMTP filter daemon.
#[derive(Debug, Parser)]
#[command(name = "smtpfd", about = "SMTP filter daemon")]
struct Args {
    /// Run as the filter engine process.
    #[arg(short = 'E', conflicts_with = "frontend")]
    engine: bool,

    /// Run as the frontend process.
    #[arg(short = 'F')]
    frontend: bool,

    /// Do not daemonize and log to stderr.
    #[arg(short = 'd')]
    debug: bool,

    /// Increase the log verbosity; may be given twice.
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Configuration file.
    #[arg(short = 'f', value_name = "file", default_value = CONF_FILE)]
    conffile: String,

    /// Control socket.
    #[arg(short = 's', value_name = "socket", default_value = SMTPFD_SOCKET)]
    csock: String,

    /// Check the configuration and exit.
    #[arg(short = 'n')]
    configtest: bool,

    /// Define a configuration macro; may be given multiple times.
    #[arg(short = 'D', value_name = "macro=value")]
    define: Vec<String>,
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    std::process::exit(match run(args) {
        Ok(()) => 0,
        Err(_) => 1,
    });
}

fn run(args: Args) -> Result<(), Error> {
    let verbose = i32::from(args.verbose);

    let (name, log_config) = if args.engine {
        (
            process::ENGINE,
            smtpfd_log::Config {
                foreground: args.debug,
                verbose,
            },
        )
    } else if args.frontend {
        (
            process::FRONTEND,
            smtpfd_log::Config {
                foreground: args.debug,
                verbose,
            },
        )
    } else {
        // The parent logs to stderr until daemonized.
        (
            "main",
            smtpfd_log::Config {
                foreground: true,
                verbose: verbose.max(1),
            },
        )
    };
    let _log = match smtpfd_log::init(name, log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("smtpfd: {}", err);
            return Err(err.into());
        }
    };

    let result = dispatch(args, verbose);
    if let Err(err) = &result {
        error!("{}", err);
    }
    result
}

fn dispatch(args: Args, verbose: i32) -> Result<(), Error> {
    if args.engine {
        return new_runtime()?.block_on(engine::main());
    }
    if args.frontend {
        return new_runtime()?.block_on(frontend::main(args.csock));
    }

    let mut macros = Vec::new();
    for define in &args.define {
        match define.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                macros.push((name.to_string(), value.to_string()));
            }
            _ => warn!("could not parse macro definition {}", define),
        }
    }

    let conf = config::parse_file(&args.conffile, &macros)?;

    if args.configtest {
        if verbose > 0 {
            print!("{}", conf);
        } else {
            eprintln!("configuration OK");
        }
        return Ok(());
    }

    process::check_privileges(SMTPFD_USER)?;

    smtpfd_log::set_verbose(verbose);
    smtpfd_log::set_foreground(args.debug);
    if !args.debug {
        process::daemonize()?;
    }

    info!("startup");

    let opts = parent::Options {
        debug: args.debug,
        verbose,
        conffile: args.conffile,
        csock: args.csock,
        macros,
    };

    // The runtime is created only after daemonization has forked.
    new_runtime()?.block_on(parent::main(opts, conf))
}

/// All roles run on a single-threaded event loop.
fn new_runtime() -> Result<runtime::Runtime, Error> {
    runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Into::into)
}
