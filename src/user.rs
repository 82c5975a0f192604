//! Password and group database lookups.
//!
//! Thin wrappers over the reentrant libc interfaces; the buffer-resize
//! loop follows the usual getpw*_r calling convention.

use std::ffi::{CStr, CString};
use std::mem;
use std::ptr;

use anyhow::{Context, Result};
use nix::unistd::{Gid, Uid};

/// A passwd database entry.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: String,
    pub shell: String,
}

/// A group database entry.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub gid: Gid,
}

unsafe fn string_from_raw(p: *const libc::c_char) -> String {
    if p.is_null() {
        String::new()
    } else {
        CStr::from_ptr(p).to_string_lossy().into_owned()
    }
}

unsafe fn passwd_to_user(passwd: &libc::passwd) -> User {
    User {
        name: string_from_raw(passwd.pw_name),
        uid: Uid::from_raw(passwd.pw_uid),
        gid: Gid::from_raw(passwd.pw_gid),
        home: string_from_raw(passwd.pw_dir),
        shell: string_from_raw(passwd.pw_shell),
    }
}

fn lookup_passwd<F>(call: F) -> Option<User>
where
    F: Fn(*mut libc::passwd, *mut libc::c_char, libc::size_t, *mut *mut libc::passwd) -> libc::c_int,
{
    let mut passwd = unsafe { mem::zeroed::<libc::passwd>() };
    let mut buf = vec![0 as libc::c_char; 2048];
    let mut result = ptr::null_mut::<libc::passwd>();

    loop {
        let r = call(&mut passwd, buf.as_mut_ptr(), buf.len(), &mut result);
        if r != libc::ERANGE {
            break;
        }
        let newsize = buf.len().checked_mul(2)?;
        buf.resize(newsize, 0);
    }

    if result.is_null() {
        return None;
    }

    Some(unsafe { passwd_to_user(&*result) })
}

/// Look up a user by login name.  `Ok(None)` when no such user exists.
pub fn user_by_name(name: &str) -> Result<Option<User>> {
    let cname = CString::new(name).context("user name contains a NUL byte")?;
    Ok(lookup_passwd(|pwd, buf, len, result| unsafe {
        libc::getpwnam_r(cname.as_ptr(), pwd, buf, len, result)
    }))
}

/// Look up a user by uid.  `Ok(None)` when no such user exists.
pub fn user_by_uid(uid: Uid) -> Result<Option<User>> {
    Ok(lookup_passwd(|pwd, buf, len, result| unsafe {
        libc::getpwuid_r(uid.as_raw(), pwd, buf, len, result)
    }))
}

/// Look up a group by name.  `Ok(None)` when no such group exists.
pub fn group_by_name(name: &str) -> Result<Option<Group>> {
    let cname = CString::new(name).context("group name contains a NUL byte")?;
    let mut group = unsafe { mem::zeroed::<libc::group>() };
    let mut buf = vec![0 as libc::c_char; 2048];
    let mut result = ptr::null_mut::<libc::group>();

    loop {
        let r = unsafe {
            libc::getgrnam_r(cname.as_ptr(), &mut group, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if r != libc::ERANGE {
            break;
        }
        let newsize = match buf.len().checked_mul(2) {
            Some(n) => n,
            None => return Ok(None),
        };
        buf.resize(newsize, 0);
    }

    if result.is_null() {
        return Ok(None);
    }

    let group = unsafe { &*result };
    Ok(Some(Group {
        name: unsafe { string_from_raw(group.gr_name) },
        gid: Gid::from_raw(group.gr_gid),
    }))
}

/// All group ids a user belongs to, including the primary group.
pub fn group_list(user: &str, gid: Gid) -> Result<Vec<Gid>> {
    let cname = CString::new(user).context("user name contains a NUL byte")?;
    let mut ngroups: libc::c_int = 32;
    let mut groups = vec![0 as libc::gid_t; ngroups as usize];

    loop {
        let r = unsafe {
            libc::getgrouplist(cname.as_ptr(), gid.as_raw(), groups.as_mut_ptr(), &mut ngroups)
        };
        if r >= 0 {
            groups.truncate(ngroups as usize);
            break;
        }
        // ngroups has been updated with the required size.
        groups.resize(ngroups as usize, 0);
    }

    Ok(groups.into_iter().map(Gid::from_raw).collect())
}

/// Check whether `user` (with primary group `gid`) is a member of the
/// named group, either directly or through a supplementary group.
pub fn is_group_member(user: &str, gid: Gid, group_name: &str) -> Result<bool> {
    let group = match group_by_name(group_name)? {
        Some(g) => g,
        None => {
            log::warn!("{}: group not found", group_name);
            return Ok(false);
        }
    };

    if group.gid == gid {
        return Ok(true);
    }

    Ok(group_list(user, gid)?.contains(&group.gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_by_uid_root() {
        let root = user_by_uid(Uid::from_raw(0)).unwrap().unwrap();
        assert_eq!(root.name, "root");
        assert_eq!(root.gid, Gid::from_raw(0));
    }

    #[test]
    fn test_user_by_name_root() {
        let root = user_by_name("root").unwrap().unwrap();
        assert_eq!(root.uid, Uid::from_raw(0));
        assert!(!root.shell.is_empty());
    }

    #[test]
    fn test_unknown_user() {
        assert!(user_by_name("no-such-user-here").unwrap().is_none());
    }

    #[test]
    fn test_group_by_name_root() {
        let root = group_by_name("root").unwrap().unwrap();
        assert_eq!(root.gid, Gid::from_raw(0));
    }

    #[test]
    fn test_root_in_root_group() {
        assert!(is_group_member("root", Gid::from_raw(0), "root").unwrap());
        assert!(!is_group_member("root", Gid::from_raw(0), "no-such-group").unwrap());
    }
}
