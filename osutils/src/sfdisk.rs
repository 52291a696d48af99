use serde::Deserialize;

use crate::{
    dependencies::Dependency,
    errors::{CmdError, ParseError},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfDisk,
}

/// A partition table as reported by `sfdisk --json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SfDisk {
    /// Disk label type: gpt or dos
    pub label: String,

    /// Disk UUID (gpt) or 32-bit id (dos)
    pub id: String,

    /// Disk device path
    pub device: String,

    /// Size unit, always "sectors"
    pub unit: String,

    #[serde(default)]
    pub firstlba: u64,

    #[serde(default)]
    pub lastlba: u64,

    #[serde(default = "SfDisk::default_sectorsize")]
    pub sectorsize: u64,

    #[serde(default)]
    pub partitions: Vec<SfPartition>,
}

impl SfDisk {
    fn default_sectorsize() -> u64 {
        512
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SfPartition {
    /// Partition device path
    pub node: String,

    /// Start offset in sectors
    pub start: u64,

    /// Size in sectors
    pub size: u64,

    /// Partition type: GUID (gpt) or hex id (dos)
    #[serde(rename = "type")]
    pub partition_type: String,

    /// Partition UUID (gpt)
    #[serde(default)]
    pub uuid: Option<String>,

    /// Partition name (gpt)
    #[serde(default)]
    pub name: Option<String>,

    /// Legacy boot flag
    #[serde(default)]
    pub bootable: bool,
}

impl SfPartition {
    /// Partition number derived from the device node.
    pub fn number(&self) -> Option<u32> {
        let digits: String = self
            .node
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.chars().rev().collect::<String>().parse().ok()
    }
}

pub fn parse(output: &str) -> Result<SfDisk, CmdError> {
    let parsed: SfdiskOutput = serde_json::from_str(output).map_err(|e| {
        ParseError::new(
            format!("failed to parse sfdisk json: {e}"),
            output.chars().take(80).collect::<String>(),
            "sfdisk --json output",
        )
    })?;
    Ok(parsed.partitiontable)
}

/// Read the partition table of a device.
pub fn run(device: &str) -> Result<SfDisk, CmdError> {
    let output = Dependency::Sfdisk.cmd().arg("--json").arg(device).run()?;
    parse(&output.stdout_joined())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse_gpt() {
        let output = indoc! {r#"
            {
               "partitiontable": {
                  "label": "gpt",
                  "id": "8E382FB6-8FB0-4E5C-AC6E-4CB05AF3A92F",
                  "device": "/dev/sda",
                  "unit": "sectors",
                  "firstlba": 2048,
                  "lastlba": 67108830,
                  "sectorsize": 512,
                  "partitions": [
                     {"node": "/dev/sda1", "start": 2048, "size": 2097152,
                      "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
                      "uuid": "F3A1CE94-0EE5-4872-9BBD-BB2AE6D9AC4C", "name": "data"},
                     {"node": "/dev/sda2", "start": 2099200, "size": 1048576,
                      "type": "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F",
                      "uuid": "E34FFF45-4A5C-4EE8-B2A9-EC1C69FFD471", "bootable": true}
                  ]
               }
            }
        "#};

        let table = parse(output).unwrap();
        assert_eq!(table.label, "gpt");
        assert_eq!(table.device, "/dev/sda");
        assert_eq!(table.firstlba, 2048);
        assert_eq!(table.partitions.len(), 2);
        assert_eq!(table.partitions[0].number(), Some(1));
        assert_eq!(table.partitions[0].name.as_deref(), Some("data"));
        assert!(table.partitions[1].bootable);
    }

    #[test]
    fn test_parse_dos() {
        let output = indoc! {r#"
            {
               "partitiontable": {
                  "label": "dos",
                  "id": "0x000c0a5a",
                  "device": "/dev/sdb",
                  "unit": "sectors",
                  "partitions": [
                     {"node": "/dev/sdb1", "start": 2048, "size": 41941679, "type": "83"}
                  ]
               }
            }
        "#};

        let table = parse(output).unwrap();
        assert_eq!(table.label, "dos");
        assert_eq!(table.sectorsize, 512);
        assert_eq!(table.partitions[0].partition_type, "83");
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse("nope").is_err());
    }
}
