use log::trace;

use crate::{
    dependencies::Dependency,
    errors::{CmdError, ParseError},
};

/// Device information from `udevadm info`, including the persistent link
/// families below `/dev/disk/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdevadmInfo {
    /// The queried device node, e.g. `/dev/sda`
    pub file: String,

    /// Sysfs path (`E: DEVPATH`)
    pub path: String,

    /// Kernel device name (`N:`)
    pub name: String,

    /// `disk` or `partition` (`E: DEVTYPE`)
    pub device_type: String,

    /// Major and minor number
    pub majorminor: (u32, u32),

    pub by_path_links: Vec<String>,
    pub by_id_links: Vec<String>,
    pub by_label_links: Vec<String>,
    pub by_uuid_links: Vec<String>,
}

pub fn settle() -> Result<(), CmdError> {
    Dependency::Udevadm.cmd().arg("settle").run()?;
    Ok(())
}

pub fn trigger() -> Result<(), CmdError> {
    Dependency::Udevadm.cmd().arg("trigger").run()?;
    Ok(())
}

/// Query udev information for one device node. Runs `udevadm settle` first
/// so link information is complete.
pub fn info(file: &str) -> Result<UdevadmInfo, CmdError> {
    settle()?;

    let output = Dependency::Udevadm.cmd().arg("info").arg(file).run()?;
    Ok(parse(file, &output.stdout)?)
}

pub fn parse(file: &str, lines: &[String]) -> Result<UdevadmInfo, ParseError> {
    let mut info = UdevadmInfo {
        file: file.to_owned(),
        ..Default::default()
    };

    let mut major = None;
    let mut minor = None;

    for line in lines {
        if let Some(rest) = line.strip_prefix("N: ") {
            info.name = rest.trim().to_owned();
        } else if let Some(rest) = line.strip_prefix("S: ") {
            let rest = rest.trim();
            if let Some(link) = rest.strip_prefix("disk/by-path/") {
                info.by_path_links.push(link.to_owned());
            } else if let Some(link) = rest.strip_prefix("disk/by-id/") {
                info.by_id_links.push(link.to_owned());
            } else if let Some(link) = rest.strip_prefix("disk/by-label/") {
                info.by_label_links.push(link.to_owned());
            } else if let Some(link) = rest.strip_prefix("disk/by-uuid/") {
                info.by_uuid_links.push(link.to_owned());
            }
        } else if let Some(rest) = line.strip_prefix("E: ") {
            match rest.split_once('=') {
                Some(("DEVPATH", value)) => info.path = value.to_owned(),
                Some(("DEVTYPE", value)) => info.device_type = value.to_owned(),
                Some(("MAJOR", value)) => major = value.parse::<u32>().ok(),
                Some(("MINOR", value)) => minor = value.parse::<u32>().ok(),
                _ => {}
            }
        }
    }

    if info.path.is_empty() || info.name.is_empty() {
        return Err(ParseError::new(
            "incomplete udevadm info output",
            lines.first().cloned().unwrap_or_default(),
            "P:, N:, S: and E: lines",
        ));
    }

    match (major, minor) {
        (Some(major), Some(minor)) => info.majorminor = (major, minor),
        _ => {
            return Err(ParseError::new(
                "missing MAJOR/MINOR in udevadm info output",
                file,
                "E: MAJOR=... and E: MINOR=...",
            ))
        }
    }

    // Deterministic link order, tool output order is arbitrary.
    info.by_path_links.sort();
    info.by_id_links.sort();
    info.by_label_links.sort();
    info.by_uuid_links.sort();

    trace!("udevadm info for {}: {:?}", file, info);

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_disk() {
        let input = lines(&[
            "P: /devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "N: sda",
            "S: disk/by-id/ata-WDC_WD10EADS-00M2B0_WD-WCAV52321683",
            "S: disk/by-id/wwn-0x50014ee203733bb5",
            "S: disk/by-path/pci-0000:00:1f.2-ata-1",
            "E: DEVLINKS=/dev/disk/by-id/ata-WDC_WD10EADS-00M2B0_WD-WCAV52321683",
            "E: DEVNAME=/dev/sda",
            "E: DEVPATH=/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "E: DEVTYPE=disk",
            "E: ID_PART_TABLE_TYPE=dos",
            "E: MAJOR=8",
            "E: MINOR=0",
            "E: SUBSYSTEM=block",
            "",
        ]);

        let info = parse("/dev/sda", &input).unwrap();
        assert_eq!(
            info.path,
            "/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda"
        );
        assert_eq!(info.name, "sda");
        assert_eq!(info.device_type, "disk");
        assert_eq!(info.majorminor, (8, 0));
        assert_eq!(info.by_path_links, vec!["pci-0000:00:1f.2-ata-1"]);
        assert_eq!(
            info.by_id_links,
            vec![
                "ata-WDC_WD10EADS-00M2B0_WD-WCAV52321683",
                "wwn-0x50014ee203733bb5"
            ]
        );
        assert!(info.by_label_links.is_empty());
        assert!(info.by_uuid_links.is_empty());
    }

    #[test]
    fn test_parse_partition_links() {
        let input = lines(&[
            "P: /devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda/sda1",
            "N: sda1",
            "S: disk/by-label/BOOT",
            "S: disk/by-uuid/14875716-b8e3-4ab8-b903-b1289bc9568d",
            "S: disk/by-id/ata-WDC_WD10EADS-00M2B0_WD-WCAV52321683-part1",
            "E: DEVPATH=/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda/sda1",
            "E: DEVTYPE=partition",
            "E: MAJOR=8",
            "E: MINOR=1",
        ]);

        let info = parse("/dev/sda1", &input).unwrap();
        assert_eq!(info.device_type, "partition");
        assert_eq!(info.by_label_links, vec!["BOOT"]);
        assert_eq!(
            info.by_uuid_links,
            vec!["14875716-b8e3-4ab8-b903-b1289bc9568d"]
        );
    }

    #[test]
    fn test_parse_incomplete() {
        let input = lines(&["E: DEVTYPE=disk"]);
        assert!(parse("/dev/sda", &input).is_err());
    }
}
