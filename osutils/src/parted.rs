//! Emitters for `parted --script`. Probing reads `sfdisk --json` instead,
//! see the sfdisk module.

use log::info;

use crate::{dependencies::Dependency, errors::CmdError, exe::Cmd};

fn parted(device: &str) -> Cmd {
    Dependency::Parted.cmd().arg("--script").arg(device)
}

pub fn mklabel(device: &str, label: &str) -> Result<(), CmdError> {
    info!("Creating {label} partition table on '{device}'");

    parted(device).arg("mklabel").arg(label).run()?;
    Ok(())
}

/// Create a partition covering the sector range [start, end).
pub fn mkpart(
    device: &str,
    part_type: &str,
    start_sector: u64,
    end_sector: u64,
) -> Result<(), CmdError> {
    info!("Creating partition on '{device}' at sector {start_sector}");

    parted(device)
        .arg("unit")
        .arg("s")
        .arg("mkpart")
        .arg(part_type)
        .arg(format!("{start_sector}s"))
        .arg(format!("{}s", end_sector - 1))
        .run()?;
    Ok(())
}

pub fn rm(device: &str, number: u32) -> Result<(), CmdError> {
    info!("Removing partition {number} from '{device}'");

    parted(device).arg("rm").arg(number.to_string()).run()?;
    Ok(())
}

/// Move the end of partition `number` to `end_sector` (exclusive).
pub fn resizepart(device: &str, number: u32, end_sector: u64) -> Result<(), CmdError> {
    parted(device)
        .arg("unit")
        .arg("s")
        .arg("resizepart")
        .arg(number.to_string())
        .arg(format!("{}s", end_sector - 1))
        .run()?;
    Ok(())
}

pub fn set_flag(device: &str, number: u32, flag: &str, on: bool) -> Result<(), CmdError> {
    parted(device)
        .arg("set")
        .arg(number.to_string())
        .arg(flag)
        .arg(if on { "on" } else { "off" })
        .run()?;
    Ok(())
}

/// Set the gpt partition name.
pub fn name(device: &str, number: u32, name: &str) -> Result<(), CmdError> {
    parted(device)
        .arg("name")
        .arg(number.to_string())
        .arg(name)
        .run()?;
    Ok(())
}
