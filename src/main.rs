//! # schroot
//! Securely enter a chroot environment and run a command or login
//! shell.  Chroot definitions come from a site-wide catalog; sessions
//! are materialised, entered with dropped privileges and torn down
//! again on every exit path.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use schroot::auth::{Auth, CheckMode, NullAuthenticator, TtyConv};
use schroot::chroot::Verbosity;
use schroot::config::ChrootConfig;
use schroot::format_detail;
use schroot::locations::Locations;
use schroot::session::{Operation, Session};

#[derive(Parser, Debug)]
#[clap(
    name = "schroot",
    version,
    about = "Securely enter a chroot environment and run a command or login shell"
)]
struct Opts {
    /// Use the specified chroot (may be repeated)
    #[clap(short, long = "chroot")]
    chroots: Vec<String>,

    /// Username to run the command or shell as
    #[clap(short, long)]
    user: Option<String>,

    /// Begin a persistent session and print its id
    #[clap(short, long, group = "operation")]
    begin_session: bool,

    /// Recover an existing session
    #[clap(long, group = "operation")]
    recover_session: bool,

    /// Run a command or shell in an existing session
    #[clap(short, long, group = "operation")]
    run_session: bool,

    /// End an existing session
    #[clap(short, long, group = "operation")]
    end_session: bool,

    /// Print the location of the selected chroots
    #[clap(long, group = "operation")]
    location: bool,

    /// List available chroots
    #[clap(short, long, group = "operation")]
    list: bool,

    /// Show information about the selected chroots
    #[clap(short, long, group = "operation")]
    info: bool,

    /// Dump the configuration of the selected chroots
    #[clap(long, group = "operation")]
    config: bool,

    /// Preserve the invoking user's environment
    #[clap(short, long)]
    preserve_environment: bool,

    /// Force the operation, even on an active session
    #[clap(short, long)]
    force: bool,

    /// Print only essential messages
    #[clap(short, long)]
    quiet: bool,

    /// Print all messages
    #[clap(short, long)]
    verbose: bool,

    /// Historic dchroot ACL compatibility
    #[clap(long, hide = true)]
    dchroot_compat: bool,

    /// Historic dchroot-dsa ACL compatibility
    #[clap(long, hide = true)]
    dchroot_dsa_compat: bool,

    /// Log to this file instead of stderr
    #[clap(long)]
    log: Option<PathBuf>,

    /// Root directory for configuration and state (testing)
    #[clap(long, hide = true)]
    root: Option<PathBuf>,

    /// Command to run inside the chroot (a login shell when omitted)
    command: Vec<String>,
}

impl Opts {
    fn operation(&self) -> Operation {
        if self.begin_session {
            Operation::Begin
        } else if self.recover_session {
            Operation::Recover
        } else if self.run_session {
            Operation::Run
        } else if self.end_session {
            Operation::End
        } else if self.location {
            Operation::Location
        } else {
            Operation::Automatic
        }
    }

    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn check_mode(&self) -> CheckMode {
        if self.dchroot_dsa_compat {
            CheckMode::DchrootDsa
        } else if self.dchroot_compat {
            CheckMode::Dchroot
        } else {
            CheckMode::Schroot
        }
    }
}

fn load_catalog(locations: &Locations, active: bool) -> Result<ChrootConfig> {
    let mut config = ChrootConfig::new();

    if active {
        if locations.session_dir.exists() {
            config.add_location(&locations.session_dir, true)?;
        }
    } else {
        if locations.conf_file.exists() {
            config.add_location(&locations.conf_file, false)?;
        }
        if locations.conf_dir.exists() {
            config.add_location(&locations.conf_dir, false)?;
        }
    }

    Ok(config)
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(err) = schroot::logger::init(opts.log.clone()) {
        eprintln!("log init failed: {:?}", err);
    }

    let locations = match &opts.root {
        Some(root) => Locations::with_root(root),
        None => Locations::default(),
    };

    let operation = opts.operation();
    let load_sessions = matches!(
        operation,
        Operation::Recover | Operation::Run | Operation::End
    );
    let config = load_catalog(&locations, load_sessions)?;

    if config.is_empty() {
        bail!("no chroots are defined in {}", locations.conf_file.display());
    }

    // Read-only inspection paths need no session or authentication.
    if opts.list {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        config.print_chroot_list(&mut out)?;
        return Ok(());
    }

    let selected: Vec<String> = if opts.chroots.is_empty() && (opts.info || opts.config) {
        config
            .get_chroots()
            .iter()
            .map(|chroot| chroot.name().to_string())
            .collect()
    } else {
        opts.chroots.clone()
    };

    if selected.is_empty() {
        bail!("no chroot specified; use -c or --chroot");
    }

    let invalid = config.validate_chroots(&selected);
    if !invalid.is_empty() {
        bail!("{}: no such chroot", invalid.join(", "));
    }

    if opts.info {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for name in &selected {
            if let Some(chroot) = config.find_alias(name) {
                format_detail::chroot_details(chroot).emit(&mut out)?;
                writeln!(out)?;
            }
        }
        return Ok(());
    }

    if opts.config {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        config.print_chroot_config(&selected, &mut out)?;
        return Ok(());
    }

    let mut auth = Auth::new("schroot", Box::new(NullAuthenticator::default()))
        .context("failed to initialise authentication")?;
    if let Some(user) = &opts.user {
        auth.set_target(user)?;
    }

    let mut session = Session::new(
        config,
        operation,
        selected,
        auth,
        Box::new(TtyConv::default()),
        locations,
    );
    session.set_command(opts.command.clone());
    session.set_verbosity(opts.verbosity());
    session.set_preserve_environment(opts.preserve_environment);
    session.set_force(opts.force);
    session.set_check_mode(opts.check_mode());

    match session.run() {
        Ok(()) => std::process::exit(session.child_status()),
        Err(err) => {
            log::error!("{}", err);
            eprintln!("schroot: {}", err);
            let status = session.child_status();
            std::process::exit(if status != 0 { status } else { libc::EXIT_FAILURE });
        }
    }
}
