use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::{dependencies::Dependency, errors::CmdError};

/// Tags reported by `blkid` for one device, e.g. UUID, TYPE, LABEL,
/// PARTUUID. External journal devices show up with their own TYPE
/// (`xfs_external_log`) and are linked by uuid.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blkid {
    pub devices: BTreeMap<String, Tags>,
}

impl Blkid {
    pub fn tags(&self, device: &str) -> Option<&Tags> {
        self.devices.get(device)
    }

    /// Find the device holding the external journal with the given uuid.
    pub fn find_by_journal_uuid(&self, uuid: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|(_, tags)| {
                tags.get("TYPE").map(String::as_str) == Some("xfs_external_log")
                    && tags.get("UUID").map(String::as_str) == Some(uuid)
            })
            .map(|(name, _)| name.as_str())
    }
}

/// Run `blkid` over all devices. Exit code 2 means nothing was found,
/// which is fine when probing.
pub fn run() -> Result<Blkid, CmdError> {
    let output = Dependency::Blkid
        .cmd()
        .verify(|code| code == 0 || code == 2)
        .run()?;
    Ok(parse(&output.stdout))
}

pub fn parse(lines: &[String]) -> Blkid {
    lazy_static! {
        static ref TAG: Regex = Regex::new("([A-Z_]+)=\"([^\"]*)\"").unwrap();
    }

    let mut blkid = Blkid::default();

    for line in lines {
        let Some((device, rest)) = line.split_once(':') else {
            continue;
        };

        let mut tags = Tags::new();
        for captures in TAG.captures_iter(rest) {
            tags.insert(captures[1].to_owned(), captures[2].to_owned());
        }

        blkid.devices.insert(device.to_owned(), tags);
    }

    blkid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse() {
        let input = lines(&[
            "/dev/sda1: UUID=\"14875716-b8e3-4ab8-b903-b1289bc9568d\" TYPE=\"ext4\" \
             PARTUUID=\"f3a1ce94-01\"",
            "/dev/sda2: UUID=\"0f6f4a9d-1f8b-4d7a-8b37-4a1d42f1b2a3\" TYPE=\"xfs\"",
            "/dev/sdb1: UUID=\"3e2f1c6a-7d4e-4a6b-9b7a-2f6c3d4e5f6a\" TYPE=\"xfs_external_log\"",
        ]);

        let blkid = parse(&input);
        assert_eq!(blkid.devices.len(), 3);
        assert_eq!(
            blkid.tags("/dev/sda1").unwrap().get("TYPE").unwrap(),
            "ext4"
        );
        assert_eq!(
            blkid.find_by_journal_uuid("3e2f1c6a-7d4e-4a6b-9b7a-2f6c3d4e5f6a"),
            Some("/dev/sdb1")
        );
        assert_eq!(blkid.find_by_journal_uuid("no-such"), None);
    }
}
