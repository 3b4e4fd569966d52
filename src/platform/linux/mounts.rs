use std::fs;
use std::path::{Component, Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::core::config::{Config, Mount};
use crate::core::error::{Error, Result};

/// Device nodes a minimal /dev carries: name, major, minor.
const DEV_NODES: [(&str, u64, u64); 4] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Build the container's mount namespace from the configuration: detach
/// from the host tree, attach the configured bind mounts, pivot into the
/// rootfs, mount the pseudo filesystems, then optionally seal the root
/// read-only. Runs in the init when no user namespace is configured, in
/// the setup helper otherwise.
pub fn setup_rootfs(config: &Config) -> Result<()> {
    let rootfs = config.rootfs.as_path();

    // Nothing done here may propagate back to the host tree.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::system("make mount tree private", e))?;

    // pivot_root requires the rootfs to be a mount point.
    bind(rootfs, rootfs, false)?;

    for entry in &config.mounts {
        attach_bind(rootfs, entry)?;
    }

    enter_rootfs(rootfs)?;
    mount_pseudo_filesystems()?;

    if config.readonly_rootfs {
        // Bind mounts attached above keep their own write settings.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::system("remount container root read-only", e))?;
    }
    Ok(())
}

/// Attach one configured bind mount under the rootfs, creating the target
/// on demand (a directory for directory sources, an empty file otherwise).
fn attach_bind(rootfs: &Path, entry: &Mount) -> Result<()> {
    let target = rootfs.join(contained_target(&entry.target)?);

    if entry.source.is_dir() {
        fs::create_dir_all(&target)
            .map_err(|e| Error::system(format!("create mount target {}", target.display()), e))?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::system(format!("create mount target {}", parent.display()), e)
            })?;
        }
        if !target.exists() {
            fs::write(&target, b"").map_err(|e| {
                Error::system(format!("create mount target {}", target.display()), e)
            })?;
        }
    }
    bind(&entry.source, &target, entry.read_only)
}

/// A mount target names a path inside the container: absolute, and not
/// allowed to climb back out of the rootfs.
fn contained_target(target: &Path) -> Result<PathBuf> {
    let relative = target.strip_prefix("/").map_err(|_| {
        Error::mismatch(format!("mount target {} is not absolute", target.display()))
    })?;
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::mismatch(format!(
            "mount target {} escapes the rootfs",
            target.display()
        )));
    }
    Ok(relative.to_path_buf())
}

/// Recursive bind mount; read-only takes a second remount because the
/// kernel ignores MS_RDONLY on the initial bind.
fn bind(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        Error::system(
            format!("bind {} to {}", source.display(), target.display()),
            e,
        )
    })?;

    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::system(format!("remount {} read-only", target.display()), e))?;
    }
    Ok(())
}

/// Swap `/` for the rootfs, parking the old root just long enough to
/// detach it.
fn enter_rootfs(rootfs: &Path) -> Result<()> {
    let old_root = rootfs.join(".old_root");
    fs::create_dir_all(&old_root)
        .map_err(|e| Error::system(format!("create {}", old_root.display()), e))?;

    nix::unistd::pivot_root(rootfs, &old_root)
        .map_err(|e| Error::system(format!("pivot_root into {}", rootfs.display()), e))?;
    nix::unistd::chdir("/").map_err(|e| Error::system("chdir / after pivot_root", e))?;

    umount2("/.old_root", MntFlags::MNT_DETACH)
        .map_err(|e| Error::system("detach old root", e))?;
    fs::remove_dir("/.old_root").map_err(|e| Error::system("remove old root directory", e))
}

/// Mount /proc and a tmpfs /dev with the minimal device nodes inside the
/// freshly pivoted root.
fn mount_pseudo_filesystems() -> Result<()> {
    fs::create_dir_all("/proc").map_err(|e| Error::system("create /proc", e))?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| Error::system("mount proc at /proc", e))?;

    fs::create_dir_all("/dev").map_err(|e| Error::system("create /dev", e))?;
    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=0755,size=65536k"),
    )
    .map_err(|e| Error::system("mount tmpfs on /dev", e))?;

    // mknod may be refused in a user namespace, where the nodes arrive as
    // bind mounts instead.
    use nix::sys::stat;
    let perm = stat::Mode::from_bits_truncate(0o666);
    for (name, major, minor) in DEV_NODES {
        let _ = stat::mknod(
            &Path::new("/dev").join(name),
            stat::SFlag::S_IFCHR,
            perm,
            stat::makedev(major, minor),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_must_be_absolute() {
        match contained_target(Path::new("data")) {
            Err(Error::ConfigMismatch { message }) => assert!(message.contains("absolute")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn target_may_not_escape_rootfs() {
        match contained_target(Path::new("/data/../../etc")) {
            Err(Error::ConfigMismatch { message }) => assert!(message.contains("escapes")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn target_maps_under_rootfs() {
        let relative = contained_target(Path::new("/var/lib/data")).unwrap();
        assert_eq!(
            Path::new("/srv/c1/rootfs").join(relative),
            Path::new("/srv/c1/rootfs/var/lib/data")
        );
    }
}
