use serde::Deserialize;

use crate::{dependencies::Dependency, errors::CmdError};

const OUTPUT_COLUMNS: &str =
    "NAME,KNAME,TYPE,SIZE,FSTYPE,LABEL,UUID,PTTYPE,PTUUID,PARTUUID,PKNAME,MOUNTPOINT,RO,ROTA,LOG-SEC";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LsblkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

/// A block device as reported by `lsblk --json --bytes --paths`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BlockDevice {
    /// Device path (`--paths` makes NAME a full path)
    pub name: String,

    /// Internal kernel device name
    pub kname: Option<String>,

    /// Device type: disk, part, crypt, lvm, raid1, mpath, ...
    #[serde(rename = "type")]
    pub blkdev_type: String,

    /// Size in bytes
    #[serde(default)]
    pub size: u64,

    /// Filesystem type
    pub fstype: Option<String>,

    /// Filesystem label
    pub label: Option<String>,

    /// Filesystem UUID
    pub uuid: Option<String>,

    /// Partition table type
    pub pttype: Option<String>,

    /// Partition table UUID
    pub ptuuid: Option<String>,

    /// Partition UUID
    pub partuuid: Option<String>,

    /// Parent kernel device name
    pub pkname: Option<String>,

    /// Where the device is mounted
    pub mountpoint: Option<String>,

    /// Read-only device
    #[serde(default, rename = "ro")]
    pub readonly: bool,

    /// Rotational device
    #[serde(default)]
    pub rota: bool,

    /// Logical sector size
    #[serde(default = "default_sector_size", rename = "log-sec")]
    pub logical_sector_size: u64,

    /// Child devices, e.g. the partitions of a disk
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

fn default_sector_size() -> u64 {
    512
}

impl BlockDevice {
    pub fn is_disk(&self) -> bool {
        self.blkdev_type == "disk"
    }

    pub fn is_partition(&self) -> bool {
        self.blkdev_type == "part"
    }

    /// This device and all its descendants, depth first.
    pub fn self_and_descendants(&self) -> Vec<&BlockDevice> {
        let mut all = vec![self];
        for child in &self.children {
            all.extend(child.self_and_descendants());
        }
        all
    }
}

impl LsblkOutput {
    pub fn all_devices(&self) -> Vec<&BlockDevice> {
        self.blockdevices
            .iter()
            .flat_map(|d| d.self_and_descendants())
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&BlockDevice> {
        self.all_devices().into_iter().find(|d| d.name == name)
    }
}

pub fn parse(output: &str) -> Result<LsblkOutput, CmdError> {
    serde_json::from_str(output).map_err(|e| {
        crate::errors::ParseError::new(
            format!("failed to parse lsblk json: {e}"),
            output.chars().take(80).collect::<String>(),
            "lsblk --json output",
        )
        .into()
    })
}

/// List all block devices of the system.
pub fn run_all() -> Result<LsblkOutput, CmdError> {
    let output = Dependency::Lsblk
        .cmd()
        .arg("--json")
        .arg("--bytes")
        .arg("--paths")
        .arg("--output")
        .arg(OUTPUT_COLUMNS)
        .run()?;
    parse(&output.stdout_joined())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse_disk_with_partitions() {
        let output = indoc! {r#"
            {
               "blockdevices": [
                  {"name": "/dev/sda", "kname": "/dev/sda", "type": "disk", "size": 34359738368,
                   "fstype": null, "label": null, "uuid": null, "pttype": "gpt",
                   "ptuuid": "8e382fb6-8fb0-4e5c-ac6e-4cb05af3a92f", "partuuid": null,
                   "pkname": null, "mountpoint": null, "ro": false, "rota": true, "log-sec": 512,
                   "children": [
                      {"name": "/dev/sda1", "kname": "/dev/sda1", "type": "part", "size": 1073741824,
                       "fstype": "btrfs", "label": "data", "uuid": "ea108250-d02c-41dd-b4d8-d4a707a5c649",
                       "pttype": null, "ptuuid": null, "partuuid": "f3a1ce94-0ee5-4872-9bbd-bb2ae6d9ac4c",
                       "pkname": "/dev/sda", "mountpoint": "/data", "ro": false, "rota": true, "log-sec": 512}
                   ]}
               ]
            }
        "#};

        let parsed = parse(output).unwrap();
        assert_eq!(parsed.blockdevices.len(), 1);

        let disk = &parsed.blockdevices[0];
        assert!(disk.is_disk());
        assert_eq!(disk.pttype.as_deref(), Some("gpt"));
        assert_eq!(disk.size, 34359738368);
        assert_eq!(disk.children.len(), 1);

        let part = &disk.children[0];
        assert!(part.is_partition());
        assert_eq!(part.fstype.as_deref(), Some("btrfs"));
        assert_eq!(part.mountpoint.as_deref(), Some("/data"));

        assert_eq!(parsed.all_devices().len(), 2);
        assert!(parsed.find_by_name("/dev/sda1").is_some());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse("not json").is_err());
    }
}
