//! shunt: a privilege-separated load-balancing relay daemon. One
//! binary serves every process role; the parent forks the packet
//! filter engine, the host check engine, and the relay and CA worker
//! sets, then supervises them.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

mod ca;
mod config;
mod control;
mod event;
mod hce;
mod http;
mod ipc;
mod kv;
mod logger;
mod parent;
mod pf;
mod pfe;
mod privsep;
mod relay;
mod rules;
mod stream;
mod tls;

use privsep::{Forked, Role};

#[derive(Parser)]
#[command(name = "shunt", version, about = "load-balancing relay daemon")]
struct Cli {
    /// Stay in the foreground and log to stderr.
    #[arg(short = 'd')]
    debug: bool,
    /// Parse the configuration file and exit.
    #[arg(short = 'n')]
    configtest: bool,
    /// Raise log verbosity; repeat for more.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
    /// Define a configuration macro.
    #[arg(short = 'D', value_name = "macro=value")]
    define: Vec<String>,
    /// Configuration file.
    #[arg(short = 'f', value_name = "file", default_value = "/etc/shunt.json")]
    file: PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("shunt: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let macros = cli
        .define
        .iter()
        .map(|d| config::parse_macro(d))
        .collect::<Result<Vec<_>, _>>()?;

    let cfg = config::load(&cli.file, &macros)?;
    if cli.configtest {
        println!("configuration OK");
        return Ok(());
    }

    logger::init(cli.verbose)?;
    if !cli.debug {
        nix::unistd::daemon(false, false).context("daemonize")?;
    }

    match privsep::fork_children(cfg.opts.prefork)? {
        Forked::Parent(children) => parent::run(cfg, cli.file, macros, children),
        Forked::Worker(worker) => match worker.role {
            Role::Pfe => pfe::run(worker, &cfg.opts, pf::NullFilter),
            Role::Hce => hce::run(worker, &cfg.opts),
            Role::Relay => relay::run(worker, &cfg.opts),
            Role::Ca => ca::run(worker, &cfg.opts),
            Role::Parent => unreachable!("parent is never forked"),
        },
    }
}
