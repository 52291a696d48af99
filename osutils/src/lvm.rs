//! Wrappers for the LVM reporting and provisioning tools. The reporting
//! commands emit JSON (`--reportformat json`); all sizes are requested in
//! plain bytes (`--units b --nosuffix`).

use serde::Deserialize;

use crate::{
    dependencies::Dependency,
    errors::{CmdError, ParseError},
    exe::Cmd,
};

const CONFIG: &str = "log { command_names = 0 prefix = \"\" }";

fn report_cmd(dependency: Dependency, options: &str) -> Cmd {
    dependency
        .cmd()
        .arg("--reportformat")
        .arg("json")
        .arg("--config")
        .arg(CONFIG)
        .arg("--units")
        .arg("b")
        .arg("--nosuffix")
        .arg("--all")
        .arg("--options")
        .arg(options)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct Report<T> {
    report: Vec<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PvReport {
    #[serde(default)]
    pub pv: Vec<Pv>,
}

/// A physical volume as reported by `pvs`. LVM renders every value as a
/// string, numbers included.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Pv {
    pub pv_name: String,
    pub pv_uuid: String,
    pub vg_name: String,
    pub vg_uuid: String,
    #[serde(default)]
    pub pv_attr: String,
    #[serde(default)]
    pub pe_start: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VgReport {
    #[serde(default)]
    pub vg: Vec<Vg>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Vg {
    pub vg_name: String,
    pub vg_uuid: String,
    #[serde(default)]
    pub vg_attr: String,
    #[serde(default)]
    pub vg_extent_size: String,
    #[serde(default)]
    pub vg_extent_count: String,
    #[serde(default)]
    pub vg_free_count: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LvReport {
    #[serde(default)]
    pub lv: Vec<Lv>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Lv {
    pub lv_name: String,
    pub lv_uuid: String,
    pub vg_name: String,
    #[serde(default)]
    pub vg_uuid: String,
    #[serde(default)]
    pub lv_attr: String,
    #[serde(default)]
    pub lv_size: String,
}

pub fn number(text: &str) -> Result<u64, ParseError> {
    text.parse::<u64>()
        .map_err(|_| ParseError::new("bad number in LVM report", text, "integer"))
}

fn parse_report<T: for<'de> Deserialize<'de>>(tool: &str, output: &str) -> Result<Vec<T>, CmdError> {
    let report: Report<T> = serde_json::from_str(output).map_err(|e| {
        ParseError::new(
            format!("failed to parse {tool} json: {e}"),
            output.chars().take(80).collect::<String>(),
            "--reportformat json output",
        )
    })?;
    Ok(report.report)
}

pub fn pvs() -> Result<Vec<Pv>, CmdError> {
    let output = report_cmd(
        Dependency::Pvs,
        "pv_name,pv_uuid,vg_name,vg_uuid,pv_attr,pe_start",
    )
    .run()?;
    let reports: Vec<PvReport> = parse_report("pvs", &output.stdout_joined())?;
    Ok(reports.into_iter().flat_map(|r| r.pv).collect())
}

pub fn vgs() -> Result<Vec<Vg>, CmdError> {
    let output = report_cmd(
        Dependency::Vgs,
        "vg_name,vg_uuid,vg_attr,vg_extent_size,vg_extent_count,vg_free_count",
    )
    .run()?;
    let reports: Vec<VgReport> = parse_report("vgs", &output.stdout_joined())?;
    Ok(reports.into_iter().flat_map(|r| r.vg).collect())
}

pub fn lvs() -> Result<Vec<Lv>, CmdError> {
    let output = report_cmd(
        Dependency::Lvs,
        "lv_name,lv_uuid,vg_name,vg_uuid,lv_attr,lv_size",
    )
    .run()?;
    let reports: Vec<LvReport> = parse_report("lvs", &output.stdout_joined())?;
    Ok(reports.into_iter().flat_map(|r| r.lv).collect())
}

pub fn pvcreate(device: &str) -> Result<(), CmdError> {
    Dependency::Pvcreate.cmd().arg(device).run()?;
    Ok(())
}

pub fn pvremove(device: &str) -> Result<(), CmdError> {
    Dependency::Pvremove.cmd().arg(device).run()?;
    Ok(())
}

pub fn vgcreate(vg_name: &str, devices: &[String]) -> Result<(), CmdError> {
    Dependency::Vgcreate
        .cmd()
        .arg(vg_name)
        .args(devices.iter().cloned())
        .run()?;
    Ok(())
}

pub fn vgextend(vg_name: &str, device: &str) -> Result<(), CmdError> {
    Dependency::Vgextend.cmd().arg(vg_name).arg(device).run()?;
    Ok(())
}

pub fn vgreduce(vg_name: &str, device: &str) -> Result<(), CmdError> {
    Dependency::Vgreduce.cmd().arg(vg_name).arg(device).run()?;
    Ok(())
}

pub fn vgremove(vg_name: &str) -> Result<(), CmdError> {
    Dependency::Vgremove.cmd().arg(vg_name).run()?;
    Ok(())
}

pub fn vgrename(old_name: &str, new_name: &str) -> Result<(), CmdError> {
    Dependency::Vgrename.cmd().arg(old_name).arg(new_name).run()?;
    Ok(())
}

pub fn lvcreate(vg_name: &str, lv_name: &str, size_bytes: u64) -> Result<(), CmdError> {
    Dependency::Lvcreate
        .cmd()
        .arg("--yes")
        .arg("--wipesignatures")
        .arg("y")
        .arg("--name")
        .arg(lv_name)
        .arg("--size")
        .arg(format!("{size_bytes}b"))
        .arg(vg_name)
        .run()?;
    Ok(())
}

pub fn lvremove(vg_name: &str, lv_name: &str) -> Result<(), CmdError> {
    Dependency::Lvremove
        .cmd()
        .arg("--force")
        .arg(format!("{vg_name}/{lv_name}"))
        .run()?;
    Ok(())
}

pub fn lvresize(vg_name: &str, lv_name: &str, size_bytes: u64) -> Result<(), CmdError> {
    Dependency::Lvresize
        .cmd()
        .arg("--force")
        .arg("--size")
        .arg(format!("{size_bytes}b"))
        .arg(format!("{vg_name}/{lv_name}"))
        .run()?;
    Ok(())
}

pub fn lvrename(vg_name: &str, old_name: &str, new_name: &str) -> Result<(), CmdError> {
    Dependency::Lvrename
        .cmd()
        .arg(vg_name)
        .arg(old_name)
        .arg(new_name)
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse_pvs() {
        let output = indoc! {r#"
            {
                "report": [
                    {
                        "pv": [
                            {"pv_name":"/dev/sda2", "pv_uuid":"Qp8CNU-0am3-9vlB-5kHm-WZ6f-qKuT-fDwRUh",
                             "vg_name":"system", "vg_uuid":"TBWVkO-WfCP-W9nb-GDAc-KDXS-FBd2-aerRzQ",
                             "pv_attr":"a--", "pe_start":"1048576"}
                        ]
                    }
                ]
            }
        "#};

        let reports: Vec<PvReport> = parse_report("pvs", output).unwrap();
        let pvs: Vec<Pv> = reports.into_iter().flat_map(|r| r.pv).collect();
        assert_eq!(pvs.len(), 1);
        assert_eq!(pvs[0].pv_name, "/dev/sda2");
        assert_eq!(pvs[0].vg_name, "system");
        assert_eq!(number(&pvs[0].pe_start).unwrap(), 1048576);
    }

    #[test]
    fn test_parse_vgs_and_lvs() {
        let vg_output = indoc! {r#"
            {
                "report": [
                    {
                        "vg": [
                            {"vg_name":"system", "vg_uuid":"TBWVkO-WfCP-W9nb-GDAc-KDXS-FBd2-aerRzQ",
                             "vg_attr":"wz--n-", "vg_extent_size":"4194304",
                             "vg_extent_count":"7677", "vg_free_count":"1021"}
                        ]
                    }
                ]
            }
        "#};

        let reports: Vec<VgReport> = parse_report("vgs", vg_output).unwrap();
        let vgs: Vec<Vg> = reports.into_iter().flat_map(|r| r.vg).collect();
        assert_eq!(vgs.len(), 1);
        assert_eq!(number(&vgs[0].vg_extent_size).unwrap(), 4194304);
        assert_eq!(number(&vgs[0].vg_free_count).unwrap(), 1021);

        let lv_output = indoc! {r#"
            {
                "report": [
                    {
                        "lv": [
                            {"lv_name":"root", "lv_uuid":"S5hPCi-SEdo-WUcV-V6qJ-tLvC-hJ3gP2-T9qWcB",
                             "vg_name":"system", "vg_uuid":"TBWVkO-WfCP-W9nb-GDAc-KDXS-FBd2-aerRzQ",
                             "lv_attr":"-wi-ao----", "lv_size":"21474836480"}
                        ]
                    }
                ]
            }
        "#};

        let reports: Vec<LvReport> = parse_report("lvs", lv_output).unwrap();
        let lvs: Vec<Lv> = reports.into_iter().flat_map(|r| r.lv).collect();
        assert_eq!(lvs.len(), 1);
        assert_eq!(lvs[0].lv_name, "root");
        assert_eq!(number(&lvs[0].lv_size).unwrap(), 21474836480);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_report::<PvReport>("pvs", "whatever").is_err());
    }
}
