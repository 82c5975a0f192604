//! Authentication and authorisation.
//!
//! Access to a chroot is gated by per-chroot ACLs evaluated for the
//! transition from the invoking user to the target user, combined with
//! a pluggable PAM-like authenticator.  The authenticator is driven
//! through a conversation handler so password prompts, informational
//! messages and errors can be rendered by the front end.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use nix::unistd::{getuid, Gid, Uid};
use thiserror::Error;

use crate::chroot::Chroot;
use crate::environment::Environment;
use crate::user::{self, User};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to start authentication: {0}")]
    Start(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("access not authorised")]
    Denied,
    #[error("account authorisation failed: {0}")]
    Account(String),
    #[error("failed to establish credentials: {0}")]
    Cred(String),
    #[error("failed to open session: {0}")]
    SessionOpen(String),
    #[error("failed to close session: {0}")]
    SessionClose(String),
    #[error("failed to delete credentials: {0}")]
    CredDelete(String),
    #[error("failed to stop authentication: {0}")]
    Stop(String),
    #[error("authentication error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Authentication requirement, ordered so that a requirement can only
/// ever escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// No authentication required.
    None,
    /// Password authentication required.
    User,
    /// Access denied.
    Fail,
}

/// Escalate an authentication status; the requirement never decreases.
pub fn change_auth(old: Status, new: Status) -> Status {
    std::cmp::max(old, new)
}

/// ACL compatibility modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Full user/group ACL checks.
    Schroot,
    /// Historic dchroot behaviour: checks apply only when ACL lists
    /// are configured at all.
    Dchroot,
    /// Historic dchroot-dsa behaviour: everyone may enter as
    /// themselves; switching users is denied.
    DchrootDsa,
}

/// Evaluate the ACLs of one chroot for the transition
/// `ruid@ruser -> uid@target`.
pub fn check_access(
    chroot: &Chroot,
    ruid: Uid,
    rgid: Gid,
    ruser: &str,
    uid: Uid,
    mode: CheckMode,
) -> Status {
    // Root can always enter.
    if ruid.is_root() {
        return Status::None;
    }

    match mode {
        CheckMode::DchrootDsa => {
            return if uid == ruid { Status::None } else { Status::Fail };
        }
        CheckMode::Dchroot => {
            if chroot.users().is_empty()
                && chroot.groups().is_empty()
                && chroot.root_users().is_empty()
                && chroot.root_groups().is_empty()
            {
                return Status::None;
            }
        }
        CheckMode::Schroot => {
            // No ACL entries means no access to anyone.
            if chroot.users().is_empty()
                && chroot.groups().is_empty()
                && chroot.root_users().is_empty()
                && chroot.root_groups().is_empty()
            {
                return Status::Fail;
            }
        }
    }

    let in_groups = |groups: &[String]| {
        groups.iter().any(|group| {
            user::is_group_member(ruser, rgid, group).unwrap_or_else(|err| {
                log::warn!("{}: group lookup failed: {}", group, err);
                false
            })
        })
    };

    let in_users = chroot.users().iter().any(|u| u == ruser) || in_groups(chroot.groups());
    let in_root_users =
        chroot.root_users().iter().any(|u| u == ruser) || in_groups(chroot.root_groups());

    if in_users && (if uid.is_root() { in_root_users } else { uid == ruid }) {
        Status::None
    } else if in_users {
        Status::User
    } else {
        Status::Fail
    }
}

/// Conversation message kinds, mirroring the PAM conversation
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PromptEchoOn,
    PromptEchoOff,
    Info,
    Error,
}

/// Conversation handler driven by the authenticator.  Prompt kinds
/// return the user's response.
pub trait Conv {
    fn message(&mut self, kind: MessageKind, text: &str) -> Result<Option<String>>;
}

/// Terminal conversation with warning and fatal timeouts, so an
/// abandoned prompt eventually aborts the session.
pub struct TtyConv {
    pub warning_timeout: Duration,
    pub fatal_timeout: Duration,
}

impl Default for TtyConv {
    fn default() -> Self {
        Self {
            warning_timeout: Duration::from_secs(15),
            fatal_timeout: Duration::from_secs(60),
        }
    }
}

impl TtyConv {
    fn read_line(&self, echo: bool) -> Result<String> {
        use nix::sys::termios;
        use std::os::unix::io::AsRawFd;

        let tty = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .map_err(|e| AuthError::Fatal(format!("failed to open /dev/tty: {}", e)))?;
        let fd = tty.as_raw_fd();

        let saved = if !echo {
            let saved = termios::tcgetattr(fd)
                .map_err(|e| AuthError::Fatal(format!("failed to get terminal state: {}", e)))?;
            let mut silent = saved.clone();
            silent.local_flags.remove(termios::LocalFlags::ECHO);
            termios::tcsetattr(fd, termios::SetArg::TCSANOW, &silent)
                .map_err(|e| AuthError::Fatal(format!("failed to set terminal state: {}", e)))?;
            Some(saved)
        } else {
            None
        };

        // Wait for the reply in a separate thread so the prompt can
        // time out; the channel gives us timed receives.
        let (sender, receiver) = crossbeam_channel::unbounded();
        std::thread::spawn(move || {
            let mut line = String::new();
            let result = BufReader::new(tty).read_line(&mut line);
            let _ = sender.send(result.map(|_| line));
        });

        let received = match receiver.recv_timeout(self.warning_timeout) {
            Ok(result) => Ok(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                eprintln!("warning: no response; session will terminate soon");
                match receiver.recv_timeout(self.fatal_timeout - self.warning_timeout) {
                    Ok(result) => Ok(result),
                    Err(_) => Err(AuthError::Fatal("timed out waiting for response".to_string())),
                }
            }
            Err(_) => Err(AuthError::Fatal("prompt reader failed".to_string())),
        };

        if let Some(saved) = saved {
            let tty = std::fs::File::open("/dev/tty");
            if let Ok(tty) = tty {
                let _ = termios::tcsetattr(tty.as_raw_fd(), termios::SetArg::TCSANOW, &saved);
            }
            eprintln!();
        }

        let line = received?
            .map_err(|e| AuthError::Fatal(format!("failed to read response: {}", e)))?;
        Ok(line.trim_end_matches('\n').to_string())
    }
}

impl Conv for TtyConv {
    fn message(&mut self, kind: MessageKind, text: &str) -> Result<Option<String>> {
        match kind {
            MessageKind::PromptEchoOn | MessageKind::PromptEchoOff => {
                eprint!("{}", text);
                let _ = std::io::stderr().flush();
                let reply = self.read_line(kind == MessageKind::PromptEchoOn)?;
                Ok(Some(reply))
            }
            MessageKind::Info => {
                eprintln!("{}", text);
                Ok(None)
            }
            MessageKind::Error => {
                eprintln!("{}", text);
                Ok(None)
            }
        }
    }
}

/// The PAM-like authentication stack.  PAM itself is an external
/// collaborator; implementations adapt it behind this trait.
pub trait Authenticator {
    fn start(&mut self, service: &str, user: &str) -> Result<()>;
    fn authenticate(&mut self, user: &str, conv: &mut dyn Conv) -> Result<()>;
    fn setup_env(&mut self, environment: &Environment) -> Result<()>;
    fn account(&mut self) -> Result<()>;
    fn cred_establish(&mut self) -> Result<()>;
    fn open_session(&mut self) -> Result<()>;
    fn close_session(&mut self) -> Result<()>;
    fn cred_delete(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// The environment exported to the child process.
    fn environment(&self) -> Environment;
}

/// Authenticator used when no PAM stack is available.  All
/// non-interactive steps succeed; password authentication is refused.
#[derive(Default)]
pub struct NullAuthenticator {
    environment: Environment,
}

impl Authenticator for NullAuthenticator {
    fn start(&mut self, _service: &str, _user: &str) -> Result<()> {
        Ok(())
    }

    fn authenticate(&mut self, user: &str, conv: &mut dyn Conv) -> Result<()> {
        let _ = conv.message(
            MessageKind::Error,
            &format!("{}: password authentication is not available", user),
        );
        Err(AuthError::Auth(
            "password authentication is not available".to_string(),
        ))
    }

    fn setup_env(&mut self, environment: &Environment) -> Result<()> {
        self.environment = environment.clone();
        Ok(())
    }

    fn account(&mut self) -> Result<()> {
        Ok(())
    }

    fn cred_establish(&mut self) -> Result<()> {
        Ok(())
    }

    fn open_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn close_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn cred_delete(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn environment(&self) -> Environment {
        self.environment.clone()
    }
}

/// How far the authentication flow has progressed; used to roll back
/// from the furthest-reached step on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AuthStep {
    Initial,
    Started,
    CredEstablished,
}

/// Identity and state for one authenticated invocation: the invoking
/// (real) user, the target user and the authentication flow state.
pub struct Auth {
    service: String,
    ruid: Uid,
    rgid: Gid,
    ruser: String,
    uid: Uid,
    gid: Gid,
    user: String,
    home: String,
    shell: String,
    user_environment: Option<Environment>,
    authenticator: Box<dyn Authenticator>,
    step: AuthStep,
}

impl Auth {
    /// Create an authentication context for the invoking process.
    pub fn new(service: &str, authenticator: Box<dyn Authenticator>) -> anyhow::Result<Self> {
        let ruid = getuid();
        let rgid = nix::unistd::getgid();
        let ruser = user::user_by_uid(ruid)?
            .map(|u| u.name)
            .unwrap_or_else(|| ruid.to_string());

        let mut auth = Self {
            service: service.to_string(),
            ruid,
            rgid,
            ruser,
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            user: String::new(),
            home: String::new(),
            shell: String::new(),
            user_environment: None,
            authenticator,
            step: AuthStep::Initial,
        };
        let ruser = auth.ruser.clone();
        auth.set_target(&ruser)?;
        Ok(auth)
    }

    /// Set the target user by login name.
    pub fn set_target(&mut self, username: &str) -> anyhow::Result<()> {
        let target: User = user::user_by_name(username)?
            .ok_or_else(|| anyhow::anyhow!("{}: user not found", username))?;
        self.uid = target.uid;
        self.gid = target.gid;
        self.user = target.name;
        self.home = if target.home.is_empty() {
            "/".to_string()
        } else {
            target.home
        };
        self.shell = if target.shell.is_empty() {
            "/bin/sh".to_string()
        } else {
            target.shell
        };
        Ok(())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    pub fn rgid(&self) -> Gid {
        self.rgid
    }

    pub fn ruser(&self) -> &str {
        &self.ruser
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn set_shell(&mut self, shell: &str) {
        self.shell = shell.to_string();
    }

    /// An explicit environment to hand to the child, overriding the
    /// minimal one.
    pub fn set_user_environment(&mut self, environment: Environment) {
        self.user_environment = Some(environment);
    }

    pub fn start(&mut self) -> Result<()> {
        self.authenticator
            .start(&self.service, &self.user)
            .map_err(|e| AuthError::Start(e.to_string()))?;
        self.step = AuthStep::Started;
        Ok(())
    }

    /// Authenticate if the status demands it.  NONE skips the
    /// authenticator entirely; FAIL is rejected outright.
    pub fn authenticate(&mut self, status: Status, conv: &mut dyn Conv) -> Result<()> {
        match status {
            Status::None => Ok(()),
            Status::User => self.authenticator.authenticate(&self.user.clone(), conv),
            Status::Fail => Err(AuthError::Denied),
        }
    }

    /// Import the environment the child will receive into the
    /// authentication context.
    pub fn setup_env(&mut self, preserve: bool) -> Result<()> {
        let environment = match &self.user_environment {
            Some(user_env) => user_env.clone(),
            None if preserve => Environment::from_process(),
            None => {
                let mut env = Environment::new();
                if let Ok(term) = std::env::var("TERM") {
                    env.add_pair("TERM", &term);
                }
                env.add_pair("USER", &self.user);
                env.add_pair("LOGNAME", &self.user);
                env.add_pair("HOME", &self.home);
                env.add_pair("SHELL", &self.shell);
                let path = if self.uid.is_root() {
                    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                } else {
                    "/usr/local/bin:/usr/bin:/bin"
                };
                env.add_pair("PATH", path);
                env
            }
        };

        self.authenticator.setup_env(&environment)
    }

    pub fn account(&mut self) -> Result<()> {
        self.authenticator.account()
    }

    pub fn cred_establish(&mut self) -> Result<()> {
        self.authenticator.cred_establish()?;
        self.step = AuthStep::CredEstablished;
        Ok(())
    }

    pub fn open_session(&mut self) -> Result<()> {
        self.authenticator.open_session()
    }

    pub fn close_session(&mut self) -> Result<()> {
        self.authenticator.close_session()
    }

    pub fn cred_delete(&mut self) -> Result<()> {
        self.authenticator.cred_delete()?;
        self.step = AuthStep::Started;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.authenticator.stop()?;
        self.step = AuthStep::Initial;
        Ok(())
    }

    /// The environment the child process should receive.
    pub fn child_environment(&self) -> Environment {
        self.authenticator.environment()
    }

    /// Best-effort rollback from the furthest-reached step.  Errors
    /// during rollback are logged, not returned.
    pub fn shutdown(&mut self) {
        if self.step >= AuthStep::CredEstablished {
            if let Err(err) = self.cred_delete() {
                log::warn!("{}", err);
            }
        }
        if self.step >= AuthStep::Started {
            if let Err(err) = self.stop() {
                log::warn!("{}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyfile::Keyfile;

    fn chroot_with_acls(users: &str, groups: &str, root_users: &str, root_groups: &str) -> Chroot {
        let mut config = String::from("[test]\ntype=plain\nactive=false\ndirectory=/srv/test\n");
        if !users.is_empty() {
            config.push_str(&format!("users={}\n", users));
        }
        if !groups.is_empty() {
            config.push_str(&format!("groups={}\n", groups));
        }
        if !root_users.is_empty() {
            config.push_str(&format!("root-users={}\n", root_users));
        }
        if !root_groups.is_empty() {
            config.push_str(&format!("root-groups={}\n", root_groups));
        }
        let keyfile = Keyfile::parse_str(&config).unwrap();
        Chroot::from_keyfile(&keyfile, "test").unwrap()
    }

    fn alice() -> Uid {
        Uid::from_raw(1000)
    }

    fn bob() -> Uid {
        Uid::from_raw(1001)
    }

    fn root() -> Uid {
        Uid::from_raw(0)
    }

    fn users_gid() -> Gid {
        Gid::from_raw(100)
    }

    #[test]
    fn test_root_always_enters() {
        let chroot = chroot_with_acls("", "", "", "");
        assert_eq!(
            check_access(&chroot, root(), Gid::from_raw(0), "root", alice(), CheckMode::Schroot),
            Status::None
        );
    }

    #[test]
    fn test_empty_acls_deny() {
        let chroot = chroot_with_acls("", "", "", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", alice(), CheckMode::Schroot),
            Status::Fail
        );
    }

    #[test]
    fn test_user_enters_as_self() {
        let chroot = chroot_with_acls("alice", "", "", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", alice(), CheckMode::Schroot),
            Status::None
        );
    }

    #[test]
    fn test_user_switching_requires_password() {
        let chroot = chroot_with_acls("alice,bob", "", "", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", bob(), CheckMode::Schroot),
            Status::User
        );
    }

    #[test]
    fn test_root_user_becomes_root_without_password() {
        let chroot = chroot_with_acls("alice", "", "alice", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", root(), CheckMode::Schroot),
            Status::None
        );
    }

    #[test]
    fn test_non_root_user_becoming_root_needs_password() {
        let chroot = chroot_with_acls("alice", "", "", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", root(), CheckMode::Schroot),
            Status::User
        );
    }

    #[test]
    fn test_unlisted_user_denied() {
        let chroot = chroot_with_acls("alice", "", "", "");
        assert_eq!(
            check_access(&chroot, bob(), users_gid(), "bob", bob(), CheckMode::Schroot),
            Status::Fail
        );
    }

    #[test]
    fn test_dchroot_mode_allows_when_unconfigured() {
        let chroot = chroot_with_acls("", "", "", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", alice(), CheckMode::Dchroot),
            Status::None
        );
    }

    #[test]
    fn test_dchroot_dsa_denies_switching() {
        let chroot = chroot_with_acls("", "", "", "");
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", alice(), CheckMode::DchrootDsa),
            Status::None
        );
        assert_eq!(
            check_access(&chroot, alice(), users_gid(), "alice", bob(), CheckMode::DchrootDsa),
            Status::Fail
        );
    }

    #[test]
    fn test_change_auth_escalates_only() {
        assert_eq!(change_auth(Status::None, Status::User), Status::User);
        assert_eq!(change_auth(Status::User, Status::None), Status::User);
        assert_eq!(change_auth(Status::User, Status::Fail), Status::Fail);
        assert_eq!(change_auth(Status::Fail, Status::None), Status::Fail);
    }

    struct RecordingConv {
        messages: Vec<(MessageKind, String)>,
    }

    impl Conv for RecordingConv {
        fn message(&mut self, kind: MessageKind, text: &str) -> Result<Option<String>> {
            self.messages.push((kind, text.to_string()));
            Ok(Some(String::new()))
        }
    }

    #[test]
    fn test_null_authenticator_refuses_passwords() {
        let mut auth = NullAuthenticator::default();
        let mut conv = RecordingConv { messages: Vec::new() };
        auth.start("schroot", "alice").unwrap();
        assert!(matches!(
            auth.authenticate("alice", &mut conv),
            Err(AuthError::Auth(_))
        ));
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].0, MessageKind::Error);
    }

    #[test]
    fn test_null_authenticator_environment() {
        let mut auth = NullAuthenticator::default();
        let mut env = Environment::new();
        env.add_pair("HOME", "/home/alice");
        auth.setup_env(&env).unwrap();
        assert_eq!(auth.environment().get("HOME"), Some("/home/alice"));
    }
}
