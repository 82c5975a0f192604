//! Child-side execution: the ordered privilege drop, chroot entry and
//! final exec.  Nothing here unwinds across exec; failures print to
//! stderr and exit the child.

use std::ffi::CString;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::unistd::{self, Uid};

use crate::auth::Auth;
use crate::chroot::Chroot;
use crate::environment::Environment;
use crate::utils;

/// Run the user's command inside the chroot.  Never returns.
pub fn run_child(chroot: &Chroot, auth: &mut Auth, command: &[String], login: bool) -> ! {
    if let Err(err) = exec_child(chroot, auth, command, login) {
        eprintln!("schroot: {:#}", err);
    }
    // Only reached when exec failed.
    std::process::exit(libc::EXIT_FAILURE);
}

fn exec_child(chroot: &Chroot, auth: &mut Auth, command: &[String], login: bool) -> Result<()> {
    auth.open_session().context("PAM error")?;

    let location = chroot.get_path();
    if location.is_empty() {
        bail!("chroot location is not set");
    }

    // Remember the invoker's working directory before the root moves.
    let invoker_cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/".to_string());

    unistd::setgid(auth.gid())
        .with_context(|| format!("could not set gid to '{}'", auth.gid()))?;
    let user = CString::new(auth.user()).context("user name contains a NUL byte")?;
    unistd::initgroups(&user, auth.gid()).context("could not set supplementary group IDs")?;

    // The effective working directory is the invoker's cwd when it
    // exists inside the chroot, else the home directory, else /.
    let effective_cwd = select_cwd(&location, &invoker_cwd, auth.home());

    unistd::chdir(location.as_str())
        .with_context(|| format!("could not chdir to '{}'", location))?;
    unistd::chroot(location.as_str())
        .with_context(|| format!("could not chroot to '{}'", location))?;
    if let Err(err) = unistd::chdir(effective_cwd.as_str()) {
        eprintln!(
            "schroot: warning: could not chdir to '{}': {}",
            effective_cwd, err
        );
        unistd::chdir("/").context("could not chdir to '/'")?;
    }

    if let Some(unshare) = chroot.facets().unshare() {
        if unshare.any() {
            nix::sched::unshare(unshare.clone_flags())
                .context("could not unshare execution context")?;
        }
    }

    chroot.persona().apply()?;

    unistd::setuid(auth.uid())
        .with_context(|| format!("could not set uid to '{}'", auth.uid()))?;
    // Dropping back to root must now be impossible.
    if !auth.uid().is_root() && unistd::setuid(Uid::from_raw(0)).is_ok() {
        bail!("failed to drop root permissions");
    }

    let environment = child_environment(chroot, auth);
    let (file, argv) = build_command(chroot, auth, command, login, &environment)?;

    log::debug!("executing '{}'", file);
    let file_c = CString::new(file.clone()).context("command contains a NUL byte")?;
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()).unwrap_or_default())
        .collect();
    let envp_c = environment.to_argv();

    unistd::execve(&file_c, &argv_c, &envp_c)
        .with_context(|| format!("could not exec '{}'", file))?;
    unreachable!();
}

fn select_cwd(location: &str, invoker_cwd: &str, home: &str) -> String {
    let inside = |path: &str| {
        let relative = path.trim_start_matches('/');
        Path::new(location).join(relative).is_dir()
    };

    if inside(invoker_cwd) {
        invoker_cwd.to_string()
    } else if !home.is_empty() && inside(home) {
        home.to_string()
    } else {
        "/".to_string()
    }
}

/// The environment passed to the command: the authenticator's exported
/// environment, the invoker environment when the chroot preserves it,
/// always subject to the chroot's environment filter.
fn child_environment(chroot: &Chroot, auth: &Auth) -> Environment {
    let mut raw = auth.child_environment();
    if chroot.preserve_environment() {
        raw.add(&Environment::from_process());
    }

    let mut filtered = Environment::new();
    filtered.set_filter(Some(chroot.environment_filter().clone()));
    filtered.add(&raw);
    filtered
}

/// Build the executable path and argv: the command prefix plus the
/// user command, or a login-shell invocation when no command is given.
fn build_command(
    chroot: &Chroot,
    auth: &Auth,
    command: &[String],
    login: bool,
    environment: &Environment,
) -> Result<(String, Vec<String>)> {
    if command.is_empty() || command[0].is_empty() {
        let shell = auth.shell().to_string();
        if shell.is_empty() {
            bail!("no shell available");
        }
        let argv0 = if login {
            format!("-{}", utils::basename(&shell))
        } else {
            shell.clone()
        };
        return Ok((shell, vec![argv0]));
    }

    let mut full: Vec<String> = chroot.command_prefix().to_vec();
    full.extend(command.iter().cloned());

    let search_path = environment.get("PATH").unwrap_or("/usr/bin:/bin");
    let file = utils::find_program_in_path(&full[0], search_path)
        .unwrap_or_else(|| full[0].clone());

    Ok((file, full))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuthenticator;
    use crate::keyfile::Keyfile;

    fn test_chroot(extra: &str) -> Chroot {
        let config = format!(
            "[t]\ntype=plain\nactive=false\ndirectory=/srv/t\n{}",
            extra
        );
        let keyfile = Keyfile::parse_str(&config).unwrap();
        Chroot::from_keyfile(&keyfile, "t").unwrap()
    }

    fn test_auth() -> Auth {
        Auth::new("schroot", Box::new(NullAuthenticator::default())).unwrap()
    }

    #[test]
    fn test_login_shell_argv() {
        let chroot = test_chroot("");
        let mut auth = test_auth();
        auth.set_shell("/bin/bash");
        let env = Environment::new();

        let (file, argv) = build_command(&chroot, &auth, &[], true, &env).unwrap();
        assert_eq!(file, "/bin/bash");
        assert_eq!(argv, vec!["-bash".to_string()]);

        let (_, argv) = build_command(&chroot, &auth, &[], false, &env).unwrap();
        assert_eq!(argv, vec!["/bin/bash".to_string()]);
    }

    #[test]
    fn test_command_prefix_prepended() {
        let chroot = test_chroot("command-prefix=nice,ionice\n");
        let auth = test_auth();
        let env = Environment::new();

        let (_, argv) =
            build_command(&chroot, &auth, &["make".to_string(), "all".to_string()], false, &env)
                .unwrap();
        assert_eq!(
            argv,
            vec![
                "nice".to_string(),
                "ionice".to_string(),
                "make".to_string(),
                "all".to_string()
            ]
        );
    }

    #[test]
    fn test_absolute_command_used_verbatim() {
        let chroot = test_chroot("");
        let auth = test_auth();
        let env = Environment::new();
        let (file, _) =
            build_command(&chroot, &auth, &["/bin/true".to_string()], false, &env).unwrap();
        assert_eq!(file, "/bin/true");
    }

    #[test]
    fn test_select_cwd_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().to_string_lossy().into_owned();
        std::fs::create_dir_all(dir.path().join("home/alice")).unwrap();

        // Invoker cwd does not exist inside the chroot.
        assert_eq!(
            select_cwd(&location, "/nonexistent/path", "/home/alice"),
            "/home/alice"
        );
        assert_eq!(select_cwd(&location, "/nonexistent", "/also/missing"), "/");
    }

    #[test]
    fn test_environment_filter_applies_to_preserved() {
        let chroot = test_chroot("preserve-environment=true\n");
        let mut auth = test_auth();
        let mut exported = Environment::new();
        exported.add_pair("LD_PRELOAD", "/evil.so");
        exported.add_pair("HOME", "/home/alice");
        auth.set_user_environment(exported);
        auth.setup_env(false).unwrap();

        let env = child_environment(&chroot, &auth);
        assert!(!env.contains("LD_PRELOAD"));
        assert_eq!(env.get("HOME"), Some("/home/alice"));
    }

    #[test]
    fn test_gid_uid_types() {
        // run_child drops to the auth target; pin the types used.
        let auth = test_auth();
        let _gid: nix::unistd::Gid = auth.gid();
        let _uid: Uid = auth.uid();
    }
}
