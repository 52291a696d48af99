use std::path::{Path, PathBuf};

use log::{info, warn};
use tempfile::TempDir;

use crate::{dependencies::Dependency, errors::CmdError};

/// Mount a block device. The mockup key is derived from the device so
/// recorded sessions replay regardless of the mount directory.
pub fn mount(
    device: &str,
    mount_dir: &Path,
    fs_type: Option<&str>,
    options: &[String],
) -> Result<(), CmdError> {
    let mut cmd = Dependency::Mount.cmd();

    if !options.is_empty() {
        cmd = cmd.arg("-o").arg(options.join(","));
    }
    if let Some(fs_type) = fs_type {
        cmd = cmd.arg("-t").arg(fs_type);
    }

    cmd.arg(device)
        .arg(mount_dir.to_string_lossy().to_string())
        .mockup_key(format!("mount (device:{device})"))
        .run()?;
    Ok(())
}

pub fn umount(device: &str, mount_dir: &Path) -> Result<(), CmdError> {
    Dependency::Umount
        .cmd()
        .arg(mount_dir.to_string_lossy().to_string())
        .mockup_key(format!("umount (device:{device})"))
        .run()?;
    Ok(())
}

/// Scoped mount acquisition: reuses an existing mount point when there is
/// one, otherwise mounts the device at a fresh temp directory. A mount
/// introduced by this guard is unmounted on every exit path.
#[derive(Debug)]
pub struct EnsureMounted {
    device: String,
    mount_point: PathBuf,
    tempdir: Option<TempDir>,
}

impl EnsureMounted {
    pub fn new(device: &str, existing_mount: Option<&Path>) -> Result<Self, CmdError> {
        match existing_mount {
            Some(mount_point) => Ok(EnsureMounted {
                device: device.to_owned(),
                mount_point: mount_point.to_owned(),
                tempdir: None,
            }),
            None => {
                let tempdir = TempDir::new().map_err(|source| CmdError::CouldNotExecute {
                    command: "create temporary mount point".into(),
                    source,
                })?;

                info!(
                    "Temporarily mounting '{}' at '{}'",
                    device,
                    tempdir.path().display()
                );
                mount(device, tempdir.path(), None, &[])?;

                Ok(EnsureMounted {
                    device: device.to_owned(),
                    mount_point: tempdir.path().to_owned(),
                    tempdir: Some(tempdir),
                })
            }
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for EnsureMounted {
    fn drop(&mut self) {
        if self.tempdir.is_some() {
            if let Err(e) = umount(&self.device, &self.mount_point) {
                warn!(
                    "Failed to unmount '{}' from '{}': {}",
                    self.device,
                    self.mount_point.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mockup::{self, Mode};

    #[test]
    fn test_ensure_mounted_reuses_existing() {
        // No mount commands must run when a mount point already exists.
        let existing = Path::new("/mnt/data");
        let guard = EnsureMounted::new("/dev/sdx1", Some(existing)).unwrap();
        assert_eq!(guard.mount_point(), existing);
        drop(guard);
    }

    #[test]
    fn test_ensure_mounted_unmounts_on_drop() {
        let _state = crate::testing::playback_lock();
        mockup::set_mode(Mode::Playback);
        mockup::clear();
        mockup::set_command("mount (device:/dev/sdx2)", mockup::Command::default());
        mockup::set_command("umount (device:/dev/sdx2)", mockup::Command::default());

        {
            let guard = EnsureMounted::new("/dev/sdx2", None).unwrap();
            assert!(guard.mount_point().exists());
        }

        // Both entries were used, the umount came from the drop path.
        assert!(mockup::occams_razor().is_ok());
        mockup::set_mode(Mode::None);
    }
}
