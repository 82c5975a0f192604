//! Aligned human-readable dumps of chroot and session metadata.

use std::io::Write;

use tabwriter::TabWriter;

use crate::chroot::Chroot;

/// A titled collection of name/value rows with aligned output.
pub struct FormatDetail {
    title: String,
    rows: Vec<(String, String)>,
}

impl FormatDetail {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, value: &str) -> &mut Self {
        self.rows.push((name.to_string(), value.to_string()));
        self
    }

    pub fn add_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.add(name, if value { "true" } else { "false" })
    }

    pub fn add_list(&mut self, name: &str, value: &[String]) -> &mut Self {
        self.add(name, &value.join(" "))
    }

    pub fn emit(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "--- {} ---", self.title)?;
        let mut writer = TabWriter::new(Vec::new());
        for (name, value) in &self.rows {
            writeln!(writer, "  {}\t{}", name, value)?;
        }
        writer.flush()?;
        out.write_all(&writer.into_inner().unwrap_or_default())?;
        Ok(())
    }
}

/// Collect the details of a chroot or session for display.
pub fn chroot_details(chroot: &Chroot) -> FormatDetail {
    let flags = chroot.session_flags();
    let mut detail = FormatDetail::new(if chroot.active() { "Session" } else { "Chroot" });

    detail
        .add("Name", chroot.name())
        .add("Description", chroot.description())
        .add("Type", chroot.backend().tag())
        .add_list("Users", chroot.users())
        .add_list("Groups", chroot.groups())
        .add_list("Root Users", chroot.root_users())
        .add_list("Root Groups", chroot.root_groups())
        .add_list("Aliases", chroot.aliases())
        .add("Environment Filter", chroot.environment_filter().as_str())
        .add_bool("Run Setup Scripts", chroot.run_setup_scripts())
        .add_bool("Run Execution Scripts", chroot.run_exec_scripts())
        .add("Script Configuration", chroot.script_config())
        .add_bool("Session Managed", flags.create)
        .add_bool("Session Cloned", flags.clone)
        .add_bool("Session Purged", flags.purge);

    if chroot.priority() != 0 {
        detail.add("Priority", &chroot.priority().to_string());
    }
    if !chroot.command_prefix().is_empty() {
        detail.add_list("Command Prefix", chroot.command_prefix());
    }
    detail.add("Personality", chroot.persona().name());
    detail.add("Message Verbosity", chroot.message_verbosity().as_str());

    match chroot.backend() {
        crate::chroot::Backend::Plain(plain) => {
            detail.add("Directory", plain.directory());
        }
        crate::chroot::Backend::Directory(dir) => {
            detail.add("Directory", dir.directory());
        }
        crate::chroot::Backend::File(file) => {
            detail.add("File", file.file());
            detail.add_bool("File Repack", file.repack());
        }
        crate::chroot::Backend::BlockDevice(block) => {
            detail.add("Device", block.device());
        }
        crate::chroot::Backend::Loopback(loop_) => {
            detail.add("File", loop_.file());
        }
        crate::chroot::Backend::LvmSnapshot(lvm) => {
            detail.add("Device", lvm.device());
            if !lvm.snapshot_device().is_empty() {
                detail.add("LVM Snapshot Device", lvm.snapshot_device());
            }
            if !lvm.snapshot_options().is_empty() {
                detail.add("LVM Snapshot Options", lvm.snapshot_options());
            }
        }
        crate::chroot::Backend::BtrfsSnapshot(btrfs) => {
            if !btrfs.source_subvolume().is_empty() {
                detail.add("Btrfs Source Subvolume", btrfs.source_subvolume());
            }
            if !btrfs.snapshot_path().is_empty() {
                detail.add("Btrfs Snapshot Path", btrfs.snapshot_path());
            }
        }
        crate::chroot::Backend::Custom(custom) => {
            detail.add_bool("Session Cloneable", custom.cloneable());
            detail.add_bool("Session Purgeable", custom.purgeable());
        }
    }

    if let Some(mountable) = chroot.facets().mountable() {
        if !mountable.mount_options().is_empty() {
            detail.add("Mount Options", mountable.mount_options());
        }
    }

    if let Some(union) = chroot.facets().union() {
        detail.add("Filesystem Union Type", union.union_type());
        if union.configured() {
            if !union.mount_options().is_empty() {
                detail.add("Filesystem Union Mount Options", union.mount_options());
            }
            detail.add("Filesystem Union Overlay Directory", union.overlay_directory());
            detail.add("Filesystem Union Underlay Directory", union.underlay_directory());
        }
    }

    if let Some(unshare) = chroot.facets().unshare() {
        if unshare.any() {
            detail.add_bool("Unshare Networking", unshare.net());
            detail.add_bool("Unshare System V IPC", unshare.sysvipc());
            detail.add_bool("Unshare System V Semaphores", unshare.sysvsem());
            detail.add_bool("Unshare UTS namespace", unshare.uts());
        }
    }

    if let Some(session) = chroot.facets().session() {
        detail.add("Original Chroot Name", session.original_name());
        detail.add("Selected Chroot Name", session.selected_name());
    }

    // Non user-settable properties are listed last.
    if !chroot.location().is_empty() {
        detail.add("Location", chroot.location());
    }
    if !chroot.mount_location().is_empty() {
        detail.add("Mount Location", chroot.mount_location());
    }
    let path = chroot.get_path();
    if !path.is_empty() {
        detail.add("Path", &path);
    }
    let mount_device = chroot.mount_device();
    if !mount_device.is_empty() {
        detail.add("Mount Device", &mount_device);
    }

    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyfile::Keyfile;

    #[test]
    fn test_aligned_output() {
        let mut detail = FormatDetail::new("Chroot");
        detail.add("Name", "sid").add("Description", "Debian unstable");
        let mut out = Vec::new();
        detail.emit(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("--- Chroot ---\n"));
        assert!(text.contains("Name"));
        assert!(text.contains("Debian unstable"));
        // Values line up in a column.
        let lines: Vec<&str> = text.lines().skip(1).collect();
        let sid_col = lines[0].find("sid").unwrap();
        let desc_col = lines[1].find("Debian").unwrap();
        assert_eq!(sid_col, desc_col);
    }

    #[test]
    fn test_chroot_details() {
        let keyfile = Keyfile::parse_str(
            "[sid]\ntype=directory\nactive=false\ndirectory=/srv/chroot/sid\nusers=alice\n",
        )
        .unwrap();
        let chroot = Chroot::from_keyfile(&keyfile, "sid").unwrap();
        let detail = chroot_details(&chroot);
        let mut out = Vec::new();
        detail.emit(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("--- Chroot ---"));
        assert!(text.contains("/srv/chroot/sid"));
        assert!(text.contains("alice"));
    }
}
