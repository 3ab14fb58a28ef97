//! Chroot jail construction and privilege reduction.
//!
//! The jail is assembled from two template trees: a system template
//! (mirroring `/` minus variable state) and the office-engine install.
//! Regular files are hardlinked rather than copied, so a jail costs inodes,
//! not disk. After the tree is complete the process chroots into it and
//! drops the capabilities that were needed to build it.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use caps::{CapSet, Capability};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::sys::time::TimeVal;
use walkdir::WalkDir;

use crate::error::{KitError, Result, fatal};

/// Name-resolution files copied (not linked) into the jail; rendering can
/// trigger hostname lookups.
const NETWORK_FILES: [&str; 4] = [
    "/etc/host.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
];

/// Engine-install subtrees never needed at render time.
const ENGINE_SKIP_DIRS: [&str; 7] = [
    "program/wizards",
    "sdk",
    "share/basic",
    "share/gallery",
    "share/Scripts",
    "share/template",
    "share/config/wizard",
];

/// Which subtrees a mirroring pass includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Everything (system template, no bind mount).
    All,
    /// Everything except `usr`, which is already bind-mounted.
    NoUsr,
    /// Engine install, minus the subtrees in [`ENGINE_SKIP_DIRS`].
    EngineInstall,
}

/// Engine paths as seen from inside the jail.
#[derive(Debug, Clone)]
pub struct JailPaths {
    /// Engine program directory, e.g. `/lo/program`.
    pub instdir: String,
    /// User-profile URL handed to the engine.
    pub userdir_url: String,
}

fn should_copy_dir(mode: LinkMode, relative: &str) -> bool {
    match mode {
        LinkMode::All => true,
        LinkMode::NoUsr => relative != "usr",
        LinkMode::EngineInstall => !ENGINE_SKIP_DIRS.contains(&relative),
    }
}

/// Copy a directory's access/modification times onto its mirror.
fn copy_dir_times(source: &Path, dest: &Path) -> Result<()> {
    let meta = std::fs::metadata(source)?;
    let atime = TimeVal::new(meta.atime(), meta.atime_nsec() / 1000);
    let mtime = TimeVal::new(meta.mtime(), meta.mtime_nsec() / 1000);
    nix::sys::stat::utimes(dest, &atime, &mtime)
        .map_err(|e| KitError::Jail(format!("utimes({}) failed: {e}", dest.display())))?;
    Ok(())
}

/// Mirror `source` into `dest`: hardlink files, recreate directories with
/// their timestamps, skip the subtrees excluded by `mode`.
///
/// A failed `link(2)` leaves the jail unusable and terminates the process.
pub fn link_or_copy(source: &Path, dest: &Path, mode: LinkMode) {
    let mut walker = WalkDir::new(source).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!("Cannot read template entry under {}: {e}", source.display());
                continue;
            }
        };
        if entry.path() == source {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walked entry outside its root");
        let new_path = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            if !should_copy_dir(mode, &relative.to_string_lossy()) {
                tracing::trace!("skip redundant paths {}", relative.display());
                walker.skip_current_dir();
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&new_path) {
                tracing::error!("mkdir({}) failed: {e}", new_path.display());
                continue;
            }
            if let Err(e) = copy_dir_times(entry.path(), &new_path) {
                tracing::error!("{e}");
            }
        } else {
            if let Some(parent) = new_path.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::error!("mkdir({}) failed: {e}", parent.display());
                continue;
            }
            if let Err(e) = std::fs::hard_link(entry.path(), &new_path) {
                fatal(&format!(
                    "link(\"{}\", \"{}\") failed: {e}",
                    entry.path().display(),
                    new_path.display()
                ));
            }
        }
    }
}

/// Plant a symlink inside the jail so that the absolute path `lo_template`,
/// interpreted inside the chroot, resolves to `lo_sub_path` relative to the
/// jail root.
pub fn symlink_path_to_jail(jail_path: &Path, lo_template: &str, lo_sub_path: &str) -> Result<()> {
    let source = jail_path.join(lo_template.trim_start_matches('/'));
    if let Some(parent) = source.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let depth = Path::new(lo_template)
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .count();
    let mut target = String::new();
    for _ in 1..depth {
        target.push_str("../");
    }
    target.push_str(lo_sub_path);

    tracing::debug!("symlink(\"{target}\", \"{}\")", source.display());
    std::os::unix::fs::symlink(&target, &source)
        .map_err(|e| KitError::Jail(format!("symlink({}) failed: {e}", source.display())))
}

/// Create the `/dev/random` and `/dev/urandom` character devices.
///
/// Failures are logged and ignored; the engine degrades without them.
fn make_device_nodes(jail_path: &Path) {
    let dev = jail_path.join("dev");
    if let Err(e) = std::fs::create_dir_all(&dev) {
        tracing::error!("mkdir({}) failed: {e}", dev.display());
        return;
    }
    for (name, minor) in [("random", 8), ("urandom", 9)] {
        let node = dev.join(name);
        if let Err(e) = mknod(
            &node,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(1, minor),
        ) {
            tracing::error!("mknod({}) failed: {e}", node.display());
        }
    }
}

/// Copy the name-resolution files into the jail, skipping any that exist.
fn copy_network_files(jail_path: &Path) {
    for filename in NETWORK_FILES {
        let source = Path::new(filename);
        let dest = jail_path.join(filename.trim_start_matches('/'));
        if source.exists() && !dest.exists() {
            if let Err(e) = std::fs::copy(source, &dest) {
                tracing::error!("copy({filename}) into jail failed: {e}");
            }
        }
    }
}

/// Bind-mount `<sys_template>/usr` onto `<jail>/usr` via the external
/// helper. Returns whether the mount succeeded.
fn bind_mount_usr(sys_template: &str, jail_path: &Path) -> bool {
    let usr_src = Path::new(sys_template).join("usr");
    let usr_dest = jail_path.join("usr");
    if let Err(e) = std::fs::create_dir_all(&usr_dest) {
        tracing::error!("mkdir({}) failed: {e}", usr_dest.display());
        return false;
    }
    tracing::debug!("Initializing jail bind mount.");
    let mounted = Command::new("loolmount")
        .arg(&usr_src)
        .arg(&usr_dest)
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    tracing::debug!("Initialized jail bind mount.");
    mounted
}

/// Clear a capability from the effective and permitted sets; failure is
/// fatal because the process would keep privileges it was meant to shed.
fn drop_capability(capability: Capability) {
    for set in [CapSet::Effective, CapSet::Permitted] {
        if let Err(e) = caps::drop(None, set, capability) {
            fatal(&format!("dropping {capability} from {set:?} failed: {e}"));
        }
    }
    tracing::trace!("Dropped capability {capability}.");
}

/// Build the jail under `<child_root>/<jail_id>`, chroot into it, and drop
/// the build-time capabilities.
///
/// Returns the engine paths as visible from inside the chroot.
pub fn enter(
    child_root: &str,
    sys_template: &str,
    lo_template: &str,
    lo_sub_path: &str,
    jail_id: &str,
) -> Result<JailPaths> {
    let jail_path = PathBuf::from(child_root).join(jail_id);
    tracing::info!("Jail path: {}", jail_path.display());
    std::fs::create_dir_all(&jail_path)?;

    symlink_path_to_jail(&jail_path, lo_template, lo_sub_path)?;

    // Font paths can end up as realpaths, so cover the resolved spelling too.
    if let Ok(resolved) = std::fs::canonicalize(lo_template) {
        let resolved = resolved.to_string_lossy().into_owned();
        if resolved != lo_template {
            symlink_path_to_jail(&jail_path, &resolved, lo_sub_path)?;
        }
    }

    let jail_lo_installation = jail_path.join(lo_sub_path);
    std::fs::create_dir_all(&jail_lo_installation)?;

    let usr_mounted = if std::env::var_os("LOOL_BIND_MOUNT").is_some() {
        bind_mount_usr(sys_template, &jail_path)
    } else {
        false
    };
    link_or_copy(
        Path::new(sys_template),
        &jail_path,
        if usr_mounted { LinkMode::NoUsr } else { LinkMode::All },
    );
    link_or_copy(
        Path::new(lo_template),
        &jail_lo_installation,
        LinkMode::EngineInstall,
    );

    copy_network_files(&jail_path);
    tracing::debug!("Initialized jail files.");

    make_device_nodes(&jail_path);

    tracing::info!("chroot(\"{}\")", jail_path.display());
    if let Err(e) = nix::unistd::chroot(&jail_path) {
        fatal(&format!("chroot(\"{}\") failed: {e}", jail_path.display()));
    }
    if let Err(e) = nix::unistd::chdir("/") {
        fatal(&format!("chdir(\"/\") in jail failed: {e}"));
    }

    drop_capability(Capability::CAP_SYS_CHROOT);
    drop_capability(Capability::CAP_MKNOD);
    drop_capability(Capability::CAP_FOWNER);

    tracing::debug!("Initialized jail nodes, dropped caps.");

    Ok(JailPaths {
        instdir: format!("/{lo_sub_path}/program"),
        userdir_url: "file:///user".to_string(),
    })
}

/// Developer path: no jail, the engine runs from its install location.
pub fn paths_without_jail(child_root: &str, lo_template: &str, jail_id: &str) -> JailPaths {
    let jail_path = PathBuf::from(child_root).join(jail_id);
    tracing::info!(
        "Using template {lo_template} as install subpath - skipping jail setup"
    );
    JailPaths {
        instdir: format!("{lo_template}/program"),
        userdir_url: format!("file://{}/user", jail_path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_should_copy_dir() {
        assert!(should_copy_dir(LinkMode::All, "usr"));
        assert!(!should_copy_dir(LinkMode::NoUsr, "usr"));
        assert!(should_copy_dir(LinkMode::NoUsr, "etc"));
        assert!(!should_copy_dir(LinkMode::EngineInstall, "sdk"));
        assert!(!should_copy_dir(LinkMode::EngineInstall, "share/config/wizard"));
        assert!(should_copy_dir(LinkMode::EngineInstall, "program"));
    }

    #[test]
    fn test_link_or_copy_mirrors_with_hardlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("template");
        let dest = tmp.path().join("jail");

        touch(&source.join("etc/hosts"));
        touch(&source.join("usr/lib/libx.so"));
        fs::create_dir_all(dest.as_path()).unwrap();

        link_or_copy(&source, &dest, LinkMode::All);

        let orig = fs::metadata(source.join("etc/hosts")).unwrap();
        let mirror = fs::metadata(dest.join("etc/hosts")).unwrap();
        assert_eq!(orig.ino(), mirror.ino());
        assert!(dest.join("usr/lib/libx.so").exists());
    }

    #[test]
    fn test_link_or_copy_engine_mode_skips_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("lo");
        let dest = tmp.path().join("jail/lo");

        touch(&source.join("program/soffice.bin"));
        touch(&source.join("program/wizards/wizard.py"));
        touch(&source.join("sdk/include/sdk.h"));
        touch(&source.join("share/basic/script.bas"));
        touch(&source.join("share/gallery/img.png"));
        touch(&source.join("share/Scripts/s.py"));
        touch(&source.join("share/template/t.ott"));
        touch(&source.join("share/config/wizard/w.xml"));
        touch(&source.join("share/config/registry.xcd"));
        fs::create_dir_all(dest.as_path()).unwrap();

        link_or_copy(&source, &dest, LinkMode::EngineInstall);

        // Every excluded subtree is absent.
        assert!(!dest.join("program/wizards").exists());
        assert!(!dest.join("sdk").exists());
        assert!(!dest.join("share/basic").exists());
        assert!(!dest.join("share/gallery").exists());
        assert!(!dest.join("share/Scripts").exists());
        assert!(!dest.join("share/template").exists());
        assert!(!dest.join("share/config/wizard").exists());

        // Everything else is hardlinked.
        let orig = fs::metadata(source.join("program/soffice.bin")).unwrap();
        let mirror = fs::metadata(dest.join("program/soffice.bin")).unwrap();
        assert_eq!(orig.ino(), mirror.ino());
        assert!(dest.join("share/config/registry.xcd").exists());
    }

    #[test]
    fn test_link_or_copy_no_usr_skips_mounted_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("sys");
        let dest = tmp.path().join("jail");

        touch(&source.join("usr/bin/tool"));
        touch(&source.join("etc/passwd"));
        fs::create_dir_all(dest.as_path()).unwrap();

        link_or_copy(&source, &dest, LinkMode::NoUsr);

        assert!(!dest.join("usr").exists());
        assert!(dest.join("etc/passwd").exists());
    }

    #[test]
    fn test_symlink_path_to_jail() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = tmp.path().join("jail");
        fs::create_dir_all(&jail).unwrap();

        symlink_path_to_jail(&jail, "/opt/office/install", "lo").unwrap();

        let link = jail.join("opt/office/install");
        let target = fs::read_link(&link).unwrap();
        assert_eq!(target, PathBuf::from("../../lo"));
    }

    #[test]
    fn test_copy_dir_times() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a");
        let dest = tmp.path().join("b");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&dest).unwrap();

        copy_dir_times(&source, &dest).unwrap();
        let src_meta = fs::metadata(&source).unwrap();
        let dest_meta = fs::metadata(&dest).unwrap();
        assert_eq!(src_meta.mtime(), dest_meta.mtime());
    }

    #[test]
    fn test_paths_without_jail() {
        let paths = paths_without_jail("/tmp/child", "/opt/lo", "1234");
        assert_eq!(paths.instdir, "/opt/lo/program");
        assert_eq!(paths.userdir_url, "file:///tmp/child/1234/user");
    }
}
