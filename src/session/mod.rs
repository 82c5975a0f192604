//! The session engine: orchestrates authentication, template-to-
//! session cloning, the ordered setup and exec phases with their
//! locking, the forked child running the user command, and teardown on
//! every exit path.

mod child;

use std::io::Write;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, getpid};
use thiserror::Error;

use crate::auth::{self, Auth, AuthError, Conv, Status};
use crate::chroot::{Chroot, ChrootError, SetupPhase, Verbosity};
use crate::config::ChrootConfig;
use crate::environment::Environment;
use crate::locations::Locations;
use crate::run_parts;
use crate::utils;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}: no chroot found matching alias")]
    ChrootUnknown(String),
    #[error("{0}: session already exists")]
    SessionAlreadyExists(String),
    #[error("{0}: not an active session")]
    SessionUnknown(String),
    #[error("chroot setup failed to lock chroot in {phase}: {source}")]
    SetupLock {
        phase: SetupPhase,
        #[source]
        source: ChrootError,
    },
    #[error("chroot setup failed during {0}")]
    ChrootSetup(SetupPhase),
    #[error("failed to fork child: {0}")]
    Fork(#[source] nix::Error),
    #[error("wait for child failed: {0}")]
    ChildWait(#[source] nix::Error),
    #[error("child terminated by signal {0}")]
    ChildSignal(String),
    #[error("child dumped core")]
    ChildCore,
    #[error("child exited abnormally with status {0}")]
    ChildStatus(i32),
    #[error("failed to switch to user '{0}'")]
    UserSwitch(String),
    #[error("script runner failed: {0}")]
    ScriptRunner(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Chroot(#[from] ChrootError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Top-level session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// One-shot ephemeral session: full setup, exec and teardown.
    Automatic,
    /// Create a persistent session and print its id.
    Begin,
    /// Re-run recovery scripts on an existing session.
    Recover,
    /// Run a command in an existing session.
    Run,
    /// End an existing session.
    End,
    /// Print the location of the named chroots.
    Location,
}

/// A single invocation of the session engine over a list of chroots.
pub struct Session {
    config: ChrootConfig,
    operation: Operation,
    chroots: Vec<String>,
    command: Vec<String>,
    auth: Auth,
    conv: Box<dyn Conv>,
    check_mode: auth::CheckMode,
    verbosity: Verbosity,
    preserve_environment: bool,
    force: bool,
    locations: Locations,
    child_status: i32,
}

impl Session {
    pub fn new(
        config: ChrootConfig,
        operation: Operation,
        chroots: Vec<String>,
        auth: Auth,
        conv: Box<dyn Conv>,
        locations: Locations,
    ) -> Self {
        Self {
            config,
            operation,
            chroots,
            command: Vec::new(),
            auth,
            conv,
            check_mode: auth::CheckMode::Schroot,
            verbosity: Verbosity::Normal,
            preserve_environment: false,
            force: false,
            locations,
            child_status: 0,
        }
    }

    pub fn set_command(&mut self, command: Vec<String>) {
        self.command = command;
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    pub fn set_preserve_environment(&mut self, preserve: bool) {
        self.preserve_environment = preserve;
    }

    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    pub fn set_check_mode(&mut self, mode: auth::CheckMode) {
        self.check_mode = mode;
    }

    /// Exit status of the last child to run, or of the engine itself.
    pub fn child_status(&self) -> i32 {
        self.child_status
    }

    /// The required authentication level, maximised over all chroots.
    pub fn auth_status(&self) -> Status {
        let mut status = Status::None;

        for name in &self.chroots {
            match self.config.find_alias(name) {
                Some(chroot) => {
                    status = auth::change_auth(
                        status,
                        auth::check_access(
                            chroot,
                            self.auth.ruid(),
                            self.auth.rgid(),
                            self.auth.ruser(),
                            self.auth.uid(),
                            self.check_mode,
                        ),
                    );
                }
                None => {
                    log::warn!("no chroot found matching alias '{}'", name);
                    status = auth::change_auth(status, Status::Fail);
                }
            }
            if status == Status::Fail {
                break;
            }
        }

        status
    }

    /// Run the requested operation with full authentication.
    pub fn run(&mut self) -> Result<()> {
        if self.operation == Operation::Location {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for name in &self.chroots {
                match self.config.find_alias(name) {
                    Some(chroot) => {
                        let _ = writeln!(out, "{}", chroot.get_path());
                    }
                    None => log::error!("{}", SessionError::ChrootUnknown(name.clone())),
                }
            }
            return Ok(());
        }

        let status = self.auth_status();

        self.auth.start()?;
        let result = self.run_authenticated(status);

        if result.is_ok() {
            self.auth.cred_delete()?;
            self.auth.stop()?;
        } else {
            // Roll back from the furthest-reached step; the original
            // failure is what gets reported.
            self.auth.shutdown();
        }

        if result.is_err() && self.child_status == 0 {
            self.child_status = libc::EXIT_FAILURE;
        }

        result
    }

    fn run_authenticated(&mut self, status: Status) -> Result<()> {
        self.auth.authenticate(status, &mut *self.conv)?;
        self.auth.setup_env(self.preserve_environment)?;
        self.auth.account()?;
        self.auth.cred_establish()?;
        self.run_impl()
    }

    fn run_impl(&mut self) -> Result<()> {
        let mut first_error: Option<SessionError> = None;
        let chroots = self.chroots.clone();

        match self.operation {
            Operation::Begin => {
                // Chroots that reached setup-start, for reverse-order
                // teardown if a later one fails.
                let mut started: Vec<Chroot> = Vec::new();
                for name in &chroots {
                    match self.begin_one(name) {
                        Ok(session) => started.push(session),
                        Err(err) => {
                            for session in started.iter().rev() {
                                if let Err(teardown) = self.setup_chroot(session, SetupPhase::SetupStop)
                                {
                                    log::warn!("{}: {}", session.name(), teardown);
                                }
                            }
                            first_error = Some(err);
                            break;
                        }
                    }
                }
            }
            _ => {
                for name in &chroots {
                    match self.run_one(name) {
                        Ok(()) => (),
                        Err(SessionError::ChildStatus(code)) => {
                            // The engine's status is the status of the
                            // last failing child; later chroots still
                            // run.
                            self.child_status = code;
                        }
                        Err(err @ SessionError::ChrootUnknown(_)) => {
                            if first_error.is_none() {
                                first_error = Some(err);
                            } else {
                                log::error!("{}", err);
                            }
                        }
                        Err(err) => {
                            first_error = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolve(&self, name: &str) -> Result<Chroot> {
        self.config
            .find_alias(name)
            .cloned()
            .ok_or_else(|| SessionError::ChrootUnknown(name.to_string()))
    }

    /// Materialise the session instance for one chroot reference.
    fn prepare_session(&self, name: &str) -> Result<Chroot> {
        let template = self.resolve(name)?;
        let create_style = matches!(self.operation, Operation::Automatic | Operation::Begin);

        if template.active() {
            if create_style && !self.force {
                return Err(SessionError::SessionAlreadyExists(name.to_string()));
            }
            return Ok(template);
        }

        if matches!(
            self.operation,
            Operation::Recover | Operation::Run | Operation::End
        ) {
            return Err(SessionError::SessionUnknown(name.to_string()));
        }

        // Only chroots which support session creation append a UUID.
        let session_id = if template.session_flags().create {
            format!("{}-{}", template.name(), utils::uuid4())
        } else {
            template.name().to_string()
        };

        let session = template.clone_session(
            &session_id,
            name,
            self.auth.ruser(),
            self.auth.uid().is_root(),
            &self.locations,
        )?;
        Ok(session)
    }

    fn begin_one(&mut self, name: &str) -> Result<Chroot> {
        let session = self.prepare_session(name)?;
        self.setup_chroot(&session, SetupPhase::SetupStart)?;
        println!("{}", session.name());
        Ok(session)
    }

    fn run_one(&mut self, name: &str) -> Result<()> {
        let session = self.prepare_session(name)?;
        log::debug!("running session in '{}' chroot", name);

        match self.operation {
            Operation::Automatic => {
                self.setup_chroot(&session, SetupPhase::SetupStart)?;

                let body = self.run_session_body(&session);

                // Teardown runs whether or not the body failed; the
                // first error wins.
                let teardown = self.setup_chroot(&session, SetupPhase::SetupStop);
                match body {
                    Err(err) => {
                        if let Err(teardown_err) = teardown {
                            log::warn!("{}: {}", session.name(), teardown_err);
                        }
                        Err(err)
                    }
                    Ok(()) => teardown,
                }
            }
            Operation::Recover => self.setup_chroot(&session, SetupPhase::SetupRecover),
            Operation::Run => self.run_session_body(&session),
            Operation::End => self.setup_chroot(&session, SetupPhase::SetupStop),
            Operation::Begin | Operation::Location => unreachable!(),
        }
    }

    /// exec-start, the forked command, exec-stop.  exec-stop runs even
    /// when exec-start or the command fails; the first error wins.
    fn run_session_body(&mut self, session: &Chroot) -> Result<()> {
        let start_result = self.setup_chroot(session, SetupPhase::ExecStart);

        let run_result = if start_result.is_ok() {
            self.run_chroot(session)
        } else {
            Ok(())
        };

        let stop_result = self.setup_chroot(session, SetupPhase::ExecStop);

        start_result?;
        run_result?;
        stop_result
    }

    /// Run the scripts of one phase, bracketed by the backend's lock
    /// contract.
    fn setup_chroot(&self, session: &Chroot, phase: SetupPhase) -> Result<()> {
        if phase.is_setup() && !session.run_setup_scripts() {
            return Ok(());
        }
        if !phase.is_setup() && !session.run_exec_scripts() {
            return Ok(());
        }

        session
            .lock(phase, &self.locations)
            .map_err(|source| SessionError::SetupLock { phase, source })?;

        let environment = self.script_environment(session);
        let status = run_parts::run_phase(phase, &environment, self.verbosity, &self.locations)
            .map_err(|err| {
                // The unlock must still happen when the runner could
                // not be spawned at all.
                if let Err(unlock_err) = session.unlock(phase, libc::EXIT_FAILURE, &self.locations) {
                    log::warn!("{}: {}", session.name(), unlock_err);
                }
                SessionError::ScriptRunner(err.to_string())
            })?;

        session
            .unlock(phase, status, &self.locations)
            .map_err(|source| SessionError::SetupLock { phase, source })?;

        if status != 0 {
            return Err(SessionError::ChrootSetup(phase));
        }

        Ok(())
    }

    /// The environment exported to setup and exec scripts.
    fn script_environment(&self, session: &Chroot) -> Environment {
        let mut environment = Environment::new();
        session.setup_env(&mut environment, &self.locations);

        environment.add_pair("AUTH_USER", self.auth.user());
        environment.add_pair("AUTH_VERBOSITY", self.verbosity.as_str());
        environment.add_pair("MOUNT_DIR", &self.locations.mount_dir.to_string_lossy());
        environment.add_pair("LIBEXEC_DIR", &self.locations.libexec_dir.to_string_lossy());
        environment.add_pair("PID", &getpid().to_string());
        environment.add_pair("SESSION_ID", session.name());

        environment
    }

    /// Fork and run the user command in the chroot; wait for it.
    fn run_chroot(&mut self, session: &Chroot) -> Result<()> {
        if !session.default_shell().is_empty()
            && !std::path::Path::new(self.auth.shell()).exists()
        {
            self.auth.set_shell(session.default_shell());
        }

        self.report_command(session);

        match unsafe { fork() }.map_err(SessionError::Fork)? {
            ForkResult::Child => {
                let login = !self.preserve_environment && !session.preserve_environment();
                child::run_child(session, &mut self.auth, &self.command, login);
            }
            ForkResult::Parent { child } => self.wait_for_child(child),
        }
    }

    fn wait_for_child(&mut self, pid: nix::unistd::Pid) -> Result<()> {
        self.child_status = libc::EXIT_FAILURE;

        let status = waitpid(pid, None).map_err(SessionError::ChildWait)?;

        // The child opened the PAM session; the parent closes it.
        if let Err(err) = self.auth.close_session() {
            log::warn!("{}", err);
        }

        match status {
            WaitStatus::Exited(_, code) => {
                self.child_status = code;
                if code != 0 {
                    return Err(SessionError::ChildStatus(code));
                }
                Ok(())
            }
            WaitStatus::Signaled(_, signal, core_dumped) => {
                if core_dumped {
                    Err(SessionError::ChildCore)
                } else {
                    Err(SessionError::ChildSignal(signal.to_string()))
                }
            }
            other => Err(SessionError::ChildSignal(format!("{:?}", other))),
        }
    }

    fn report_command(&self, session: &Chroot) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }

        let identity = if self.auth.ruid() == self.auth.uid() {
            String::new()
        } else {
            format!(" ({}->{})", self.auth.ruser(), self.auth.user())
        };

        if self.command.is_empty() || self.command[0].is_empty() {
            let kind = if !self.preserve_environment && !session.preserve_environment() {
                "login shell"
            } else {
                "shell"
            };
            eprintln!(
                "[{} chroot]{} Running {}: \"{}\"",
                session.name(),
                identity,
                kind,
                self.auth.shell()
            );
            log::info!(
                "[{} chroot] ({}->{}) running {}: \"{}\"",
                session.name(),
                self.auth.ruser(),
                self.auth.user(),
                kind,
                self.auth.shell()
            );
        } else {
            let commandline = self.command.join(" ");
            eprintln!(
                "[{} chroot]{} Running command: \"{}\"",
                session.name(),
                identity,
                commandline
            );
            log::info!(
                "[{} chroot] ({}->{}) running command: \"{}\"",
                session.name(),
                self.auth.ruser(),
                self.auth.user(),
                commandline
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuthenticator;
    use crate::keyfile::Keyfile;

    struct SilentConv;

    impl Conv for SilentConv {
        fn message(
            &mut self,
            _kind: auth::MessageKind,
            _text: &str,
        ) -> auth::Result<Option<String>> {
            Ok(None)
        }
    }

    fn engine(config_text: &str, operation: Operation, chroots: &[&str]) -> Session {
        let keyfile = Keyfile::parse_str(config_text).unwrap();
        let mut config = ChrootConfig::new();
        config.load_keyfile(keyfile, false).unwrap();
        let auth = Auth::new("schroot", Box::new(NullAuthenticator::default())).unwrap();
        Session::new(
            config,
            operation,
            chroots.iter().map(|s| s.to_string()).collect(),
            auth,
            Box::new(SilentConv),
            Locations::default(),
        )
    }

    const DIRECTORY_CONFIG: &str = "\
[sid]
type=directory
directory=/srv/chroot/sid
users=alice
aliases=unstable
";

    #[test]
    fn test_auth_status_unknown_chroot_fails() {
        let session = engine(DIRECTORY_CONFIG, Operation::Automatic, &["missing"]);
        assert_eq!(session.auth_status(), Status::Fail);
    }

    #[test]
    fn test_auth_status_root_invoker() {
        let session = engine(DIRECTORY_CONFIG, Operation::Automatic, &["sid"]);
        let expected = if nix::unistd::getuid().is_root() {
            Status::None
        } else {
            // The test runner is not in the ACLs.
            Status::Fail
        };
        assert_eq!(session.auth_status(), expected);
    }

    #[test]
    fn test_prepare_session_appends_uuid() {
        let session = engine(DIRECTORY_CONFIG, Operation::Begin, &["unstable"]);
        let prepared = session.prepare_session("unstable").unwrap();
        assert!(prepared.name().starts_with("sid-"));
        assert_eq!(prepared.name().len(), "sid-".len() + 36);
        assert!(prepared.active());
        assert_eq!(
            prepared.facets().session().unwrap().selected_name(),
            "unstable"
        );
    }

    #[test]
    fn test_prepare_session_plain_keeps_name() {
        let session = engine(
            "[base]\ntype=plain\ndirectory=/srv/base\nusers=alice\n",
            Operation::Automatic,
            &["base"],
        );
        let prepared = session.prepare_session("base").unwrap();
        assert_eq!(prepared.name(), "base");
    }

    #[test]
    fn test_prepare_session_unknown_chroot() {
        let session = engine(DIRECTORY_CONFIG, Operation::Automatic, &["nope"]);
        assert!(matches!(
            session.prepare_session("nope"),
            Err(SessionError::ChrootUnknown(_))
        ));
    }

    #[test]
    fn test_run_requires_active_session() {
        let session = engine(DIRECTORY_CONFIG, Operation::Run, &["sid"]);
        assert!(matches!(
            session.prepare_session("sid"),
            Err(SessionError::SessionUnknown(_))
        ));
    }

    #[test]
    fn test_begin_on_active_session_rejected() {
        let keyfile = Keyfile::parse_str(
            "[sid-123]\n\
             type=directory\n\
             directory=/srv/chroot/sid\n\
             mount-location=/var/lib/schroot/mount/sid-123\n\
             original-name=sid\n\
             selected-name=sid\n\
             users=alice\n",
        )
        .unwrap();
        let mut config = ChrootConfig::new();
        config.load_keyfile(keyfile, true).unwrap();
        let auth = Auth::new("schroot", Box::new(NullAuthenticator::default())).unwrap();
        let session = Session::new(
            config,
            Operation::Begin,
            vec!["sid-123".to_string()],
            auth,
            Box::new(SilentConv),
            Locations::default(),
        );
        assert!(matches!(
            session.prepare_session("sid-123"),
            Err(SessionError::SessionAlreadyExists(_))
        ));
    }

    #[test]
    fn test_setup_skipped_without_scripts() {
        // run-setup-scripts defaults to false; setup phases are a
        // no-op and need no script runner at all.
        let session = engine(DIRECTORY_CONFIG, Operation::Automatic, &["sid"]);
        let prepared = session.prepare_session("sid").unwrap();
        session
            .setup_chroot(&prepared, SetupPhase::SetupStart)
            .unwrap();
        session
            .setup_chroot(&prepared, SetupPhase::ExecStart)
            .unwrap();
    }

    #[test]
    fn test_script_environment_contents() {
        let session = engine(DIRECTORY_CONFIG, Operation::Automatic, &["sid"]);
        let prepared = session.prepare_session("sid").unwrap();
        let environment = session.script_environment(&prepared);

        assert_eq!(environment.get("CHROOT_TYPE"), Some("directory"));
        assert_eq!(environment.get("SESSION_ID"), Some(prepared.name()));
        assert_eq!(environment.get("AUTH_VERBOSITY"), Some("normal"));
        assert!(environment.contains("PID"));
        assert!(environment.contains("MOUNT_DIR"));
        assert!(environment.contains("LIBEXEC_DIR"));
        assert!(environment.contains("AUTH_USER"));
    }
}
