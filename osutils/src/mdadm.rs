use lazy_static::lazy_static;
use log::info;
use regex::Regex;

use sysdefs::raid::MdLevel;

use crate::{
    dependencies::Dependency,
    errors::{CmdError, ParseError},
    files,
};

pub const METADATA_VERSION: &str = "1.0";

/// One array from `mdadm --detail --scan`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdadmDetail {
    pub raid_path: String,
    pub level: String,
    pub uuid: String,
    pub devices: Vec<String>,
}

pub fn detail_scan() -> Result<Vec<MdadmDetail>, CmdError> {
    let output = Dependency::Mdadm
        .cmd()
        .arg("--detail")
        .arg("--scan")
        .arg("-v")
        .run()?;
    Ok(parse_detail_scan(&output.stdout)?)
}

pub fn parse_detail_scan(lines: &[String]) -> Result<Vec<MdadmDetail>, ParseError> {
    lazy_static! {
        static ref ARRAY: Regex = Regex::new(
            "^ARRAY (\\S+) level=(\\S+) num-devices=\\d+ metadata=\\S+ name=\\S+ UUID=(\\S+)"
        )
        .unwrap();
    }

    let mut details = Vec::new();

    for line in lines {
        if let Some(captures) = ARRAY.captures(line) {
            details.push(MdadmDetail {
                raid_path: captures[1].to_owned(),
                level: captures[2].to_owned(),
                uuid: captures[3].to_owned(),
                devices: Vec::new(),
            });
        } else if let Some(devices) = line.trim().strip_prefix("devices=") {
            let detail = details.last_mut().ok_or_else(|| {
                ParseError::new("devices= line without ARRAY line", line, "ARRAY ...")
            })?;
            detail.devices = devices.split(',').map(str::to_owned).collect();
        }
    }

    Ok(details)
}

/// One member device of an array in `/proc/mdstat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdstatDevice {
    pub name: String,
    pub spare: bool,
    pub faulty: bool,
}

/// One array in `/proc/mdstat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdstatEntry {
    pub name: String,
    pub level: MdLevel,
    pub blocks: u64,
    pub devices: Vec<MdstatDevice>,
}

pub fn mdstat() -> Result<Vec<MdstatEntry>, CmdError> {
    let lines = files::read_lines_if_exists("/proc/mdstat")
        .map_err(|e| CmdError::CouldNotExecute {
            command: "read /proc/mdstat".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
    Ok(parse_mdstat(&lines)?)
}

pub fn parse_mdstat(lines: &[String]) -> Result<Vec<MdstatEntry>, ParseError> {
    lazy_static! {
        static ref HEADER: Regex =
            Regex::new("^(md\\d+) : (active|inactive)( \\(read-only\\)| \\(auto-read-only\\))?( \\S+)?(.*)$")
                .unwrap();
        static ref DEVICE: Regex = Regex::new("^(\\S+?)\\[(\\d+)\\](\\(S\\))?(\\(F\\))?$").unwrap();
        static ref BLOCKS: Regex = Regex::new("^ *(\\d+) blocks").unwrap();
    }

    let mut entries = Vec::new();

    for line in lines {
        if let Some(captures) = HEADER.captures(line) {
            let mut entry = MdstatEntry {
                name: format!("/dev/{}", &captures[1]),
                level: captures
                    .get(4)
                    .map(|m| m.as_str().trim())
                    .and_then(|l| l.parse::<MdLevel>().ok())
                    .unwrap_or_default(),
                ..Default::default()
            };

            for word in captures.get(5).map(|m| m.as_str()).unwrap_or("").split_whitespace() {
                let captures = DEVICE.captures(word).ok_or_else(|| {
                    ParseError::new("bad device in /proc/mdstat", word, "name[slot](S)(F)")
                })?;
                entry.devices.push(MdstatDevice {
                    name: format!("/dev/{}", &captures[1]),
                    spare: captures.get(3).is_some(),
                    faulty: captures.get(4).is_some(),
                });
            }

            entries.push(entry);
        } else if let Some(captures) = BLOCKS.captures(line) {
            if let Some(entry) = entries.last_mut() {
                entry.blocks = captures[1].parse::<u64>().unwrap_or(0);
            }
        }
    }

    Ok(entries)
}

pub fn create(
    raid_path: &str,
    level: MdLevel,
    device_paths: &[String],
    spares: usize,
) -> Result<(), CmdError> {
    info!("Creating RAID array '{raid_path}'");

    let mut cmd = Dependency::Mdadm
        .cmd()
        .arg("--create")
        .arg(raid_path)
        .arg("--run")
        .arg(format!("--level={level}"))
        .arg(format!("--raid-devices={}", device_paths.len() - spares));

    if spares > 0 {
        cmd = cmd.arg(format!("--spare-devices={spares}"));
    }

    cmd.args(device_paths.iter().cloned())
        .arg(format!("--metadata={METADATA_VERSION}"))
        .run()?;
    Ok(())
}

pub fn stop(raid_path: &str) -> Result<(), CmdError> {
    info!("Stopping RAID array '{raid_path}'");

    Dependency::Mdadm.cmd().arg("--stop").arg(raid_path).run()?;
    Ok(())
}

pub fn add(raid_path: &str, device: &str) -> Result<(), CmdError> {
    info!("Adding RAID device '{device}' to '{raid_path}'");

    Dependency::Mdadm.cmd().arg(raid_path).arg("--add").arg(device).run()?;
    Ok(())
}

pub fn remove(raid_path: &str, device: &str) -> Result<(), CmdError> {
    info!("Removing RAID device '{device}' from '{raid_path}'");

    Dependency::Mdadm
        .cmd()
        .arg(raid_path)
        .arg("--fail")
        .arg(device)
        .arg("--remove")
        .arg(device)
        .run()?;
    Ok(())
}

pub fn zero_superblock(device: &str) -> Result<(), CmdError> {
    Dependency::Mdadm
        .cmd()
        .arg("--zero-superblock")
        .arg(device)
        .run()?;
    Ok(())
}
