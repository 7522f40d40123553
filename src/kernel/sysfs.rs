use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SYSFS_DEV_CHAR: &str = "/sys/dev/char";

/// Splits a `dev_t` using the glibc encoding.
#[must_use]
pub const fn dev_major(dev: u64) -> u32 {
    (((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff)) as u32
}

#[must_use]
pub const fn dev_minor(dev: u64) -> u32 {
    (((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff)) as u32
}

#[must_use]
pub const fn make_dev(major: u32, minor: u32) -> u64 {
    let major = major as u64;
    let minor = minor as u64;
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}

/// What sysfs knows about a DRM character device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmNode {
    pub major: u32,
    pub minor: u32,
    /// Device node name relative to `/dev` (e.g. `dri/renderD128`).
    pub devname: Option<String>,
    /// Kernel driver bound to the parent device (e.g. `i915`, `amdgpu`).
    pub driver: Option<String>,
}

impl DrmNode {
    /// Looks up a node by `dev_t` under `/sys/dev/char`.
    pub fn from_dev_id(dev: u64) -> io::Result<Self> {
        Self::from_sysfs_root(Path::new(SYSFS_DEV_CHAR), dev)
    }

    fn from_sysfs_root(root: &Path, dev: u64) -> io::Result<Self> {
        let major = dev_major(dev);
        let minor = dev_minor(dev);
        let dir: PathBuf = root.join(format!("{major}:{minor}"));
        if !dir.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no sysfs entry for device {major}:{minor}"),
            ));
        }

        let devname = fs::read_to_string(dir.join("uevent"))
            .ok()
            .and_then(|uevent| parse_uevent(&uevent, "DEVNAME"));

        let driver = fs::read_link(dir.join("device/driver"))
            .ok()
            .and_then(|link| link.file_name().map(|s| s.to_string_lossy().into_owned()));

        Ok(Self {
            major,
            minor,
            devname,
            driver,
        })
    }
}

fn parse_uevent(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k == key).then(|| v.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_t_round_trips_through_glibc_encoding() {
        let dev = make_dev(226, 128);
        assert_eq!(dev, 0xe280);
        assert_eq!(dev_major(dev), 226);
        assert_eq!(dev_minor(dev), 128);

        let big = make_dev(0x12345, 0x6789a);
        assert_eq!(dev_major(big), 0x12345);
        assert_eq!(dev_minor(big), 0x6789a);
    }

    #[test]
    fn uevent_lookup() {
        let uevent = "MAJOR=226\nMINOR=128\nDEVNAME=dri/renderD128\nDEVTYPE=drm_minor\n";
        assert_eq!(parse_uevent(uevent, "DEVNAME").as_deref(), Some("dri/renderD128"));
        assert_eq!(parse_uevent(uevent, "DRIVER"), None);
    }

    #[test]
    fn missing_node_is_not_found() {
        let root = std::env::temp_dir().join("hbm-sysfs-missing");
        let err = DrmNode::from_sysfs_root(&root, make_dev(1, 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn reads_driver_link_and_devname() {
        let root = std::env::temp_dir().join(format!("hbm-sysfs-{}", std::process::id()));
        let node = root.join("226:128");
        let driver_dir = root.join("drivers/i915");
        fs::create_dir_all(node.join("device")).unwrap();
        fs::create_dir_all(&driver_dir).unwrap();
        fs::write(node.join("uevent"), "DEVNAME=dri/renderD128\n").unwrap();
        let link = node.join("device/driver");
        let _ = fs::remove_file(&link);
        std::os::unix::fs::symlink(&driver_dir, &link).unwrap();

        let drm = DrmNode::from_sysfs_root(&root, make_dev(226, 128)).unwrap();
        assert_eq!(drm.driver.as_deref(), Some("i915"));
        assert_eq!(drm.devname.as_deref(), Some("dri/renderD128"));

        fs::remove_dir_all(&root).ok();
    }
}
