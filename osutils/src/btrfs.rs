//! Wrappers and parsers for the `btrfs` and `mkfs.btrfs` tools.
//!
//! Commands operating on a mounted filesystem take an explicit mockup key
//! built from the device instead of the (ephemeral) mount point, so recorded
//! sessions replay independently of temp directory names.

use lazy_static::lazy_static;
use log::{trace, warn};
use regex::Regex;

use sysdefs::raid::BtrfsRaidLevel;

use crate::{
    dependencies::Dependency,
    errors::{CmdError, ParseError},
};

pub const UUID_REGEX: &str =
    "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

/// A btrfs quota group address: level and id. Level-0 qgroups shadow
/// subvolumes, so their id is the subvolume id.
pub type QgroupId = (u32, u64);

pub fn parse_qgroup_id(text: &str) -> Result<QgroupId, ParseError> {
    let (level, id) = text.split_once('/').ok_or_else(|| {
        ParseError::new("bad qgroup id", text, "<level>/<id>")
    })?;
    let level = level
        .parse::<u32>()
        .map_err(|_| ParseError::new("bad qgroup level", text, "<level>/<id>"))?;
    let id = id
        .parse::<u64>()
        .map_err(|_| ParseError::new("bad qgroup id", text, "<level>/<id>"))?;
    Ok((level, id))
}

pub fn format_qgroup_id(id: QgroupId) -> String {
    format!("{}/{}", id.0, id.1)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowDevice {
    pub id: u64,
    pub name: String,
}

/// One filesystem in the output of `btrfs filesystem show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowEntry {
    pub uuid: String,
    /// "FS bytes used", in bytes
    pub used: u64,
    pub devices: Vec<ShowDevice>,
}

/// Parse a pretty-printed size like `138.38MiB` into bytes.
pub fn parse_pretty_size(text: &str) -> Option<u64> {
    let (number, factor) = if let Some(p) = text.strip_suffix("TiB") {
        (p, 1u64 << 40)
    } else if let Some(p) = text.strip_suffix("GiB") {
        (p, 1 << 30)
    } else if let Some(p) = text.strip_suffix("MiB") {
        (p, 1 << 20)
    } else if let Some(p) = text.strip_suffix("KiB") {
        (p, 1 << 10)
    } else if let Some(p) = text.strip_suffix('B') {
        (p, 1)
    } else {
        (text, 1)
    };
    let value: f64 = number.parse().ok()?;
    Some((value * factor as f64) as u64)
}

/// List all btrfs filesystems with their member devices.
///
/// `btrfs filesystem show` exits nonzero when there is no btrfs at all,
/// which is not an error when probing; stderr output is.
pub fn filesystem_show() -> Result<Vec<ShowEntry>, CmdError> {
    let output = Dependency::Btrfs
        .cmd()
        .arg("filesystem")
        .arg("show")
        .verify(|_| true)
        .run()?;

    if output.exit_code == 0 && !output.stdout.is_empty() {
        Ok(parse_filesystem_show(&output.stdout)?)
    } else if !output.stderr.is_empty() {
        Err(CmdError::Failed {
            command: "btrfs filesystem show".into(),
            stderr: output.stderr.join("\n"),
            code: output.exit_code,
        })
    } else {
        Ok(Vec::new())
    }
}

pub fn parse_filesystem_show(lines: &[String]) -> Result<Vec<ShowEntry>, ParseError> {
    lazy_static! {
        static ref UUID_LINE: Regex = Regex::new(&format!("uuid: ({UUID_REGEX})")).unwrap();
    }

    let mut entries = Vec::new();
    let mut it = lines.iter().peekable();

    while let Some(line) = it.next() {
        if !line.contains(" uuid: ") {
            continue;
        }

        let captures = UUID_LINE.captures(line).ok_or_else(|| {
            ParseError::new("did not find uuid", line.clone(), "uuid: <uuid>")
        })?;

        let mut entry = ShowEntry {
            uuid: captures[1].to_owned(),
            ..Default::default()
        };

        // Device lines follow until the next filesystem. A line such as
        // "*** Some devices missing" is skipped without producing a device.
        while let Some(next) = it.peek() {
            if next.contains(" uuid: ") {
                break;
            }
            let line = it.next().unwrap();
            if line.contains("FS bytes used ") {
                if let Some(word) = line.split_whitespace().last() {
                    entry.used = parse_pretty_size(word).unwrap_or(0);
                }
            }
            if !line.contains("devid ") {
                continue;
            }

            let words: Vec<&str> = line.split_whitespace().collect();
            let id = words
                .get(1)
                .and_then(|w| w.parse::<u64>().ok())
                .ok_or_else(|| {
                    ParseError::new("bad devid", line.clone(), "devid <n> ... path <dev>")
                })?;
            let name = words.get(7).copied().unwrap_or_default().to_owned();
            if !name.contains("/dev/") {
                return Err(ParseError::new("not a valid device name", name, "/dev/..."));
            }

            entry.devices.push(ShowDevice { id, name });
        }

        if entry.devices.is_empty() {
            return Err(ParseError::new(
                format!("no devices for uuid {}", entry.uuid),
                "",
                "devid  1 size 40.00GiB used 16.32GiB path /dev/sda2",
            ));
        }

        entries.push(entry);
    }

    trace!("btrfs filesystem show: {:?}", entries);

    Ok(entries)
}

/// One subvolume in the output of `btrfs subvolume list -a -puq`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubvolumeListEntry {
    pub id: u64,
    pub parent_id: u64,
    pub path: String,
    pub uuid: String,
    /// Uuid of the snapshot origin, if this subvolume is a snapshot.
    pub parent_uuid: Option<String>,
}

pub fn subvolume_list(mount_point: &str, key: &str) -> Result<Vec<SubvolumeListEntry>, CmdError> {
    let output = Dependency::Btrfs
        .cmd()
        .arg("subvolume")
        .arg("list")
        .arg("-a")
        .arg("-puq")
        .arg(mount_point)
        .mockup_key(format!("btrfs subvolume list -a -puq (device:{key})"))
        .run()?;
    Ok(parse_subvolume_list(&output.stdout)?)
}

pub fn parse_subvolume_list(lines: &[String]) -> Result<Vec<SubvolumeListEntry>, ParseError> {
    fn field<'a>(line: &'a str, tag: &str) -> Result<&'a str, ParseError> {
        let pos = line.find(tag).ok_or_else(|| {
            ParseError::new(
                format!("could not find '{}' in 'btrfs subvolume list' output", tag.trim()),
                line,
                tag,
            )
        })?;
        Ok(line[pos + tag.len()..].split_whitespace().next().unwrap_or(""))
    }

    let mut entries = Vec::new();

    for line in lines {
        let id = field(line, "ID ")?.parse::<u64>().unwrap_or(0);

        let parent_id = field(line, " parent ")?.parse::<u64>().unwrap_or(0);

        // A subvolume can already be deleted, in which case parent is 0 and
        // path is "DELETED". That is a temporary state.
        if parent_id == 0 {
            continue;
        }

        let pos = line.find(" path ").ok_or_else(|| {
            ParseError::new(
                "could not find 'path' in 'btrfs subvolume list' output",
                line,
                " path ",
            )
        })?;
        let mut path = line[pos + " path ".len()..].to_owned();
        if let Some(stripped) = path.strip_prefix("<FS_TREE>/") {
            path = stripped.to_owned();
        }

        let uuid = field(line, " uuid ")?.to_owned();

        let parent_uuid = match field(line, " parent_uuid ")? {
            "-" => None,
            value => Some(value.to_owned()),
        };

        entries.push(SubvolumeListEntry { id, parent_id, path, uuid, parent_uuid });
    }

    Ok(entries)
}

/// Uuid of the subvolume mounted at `mount_point`, probed with
/// `btrfs subvolume show`.
pub fn subvolume_show(mount_point: &str, key: &str) -> Result<String, CmdError> {
    let output = Dependency::Btrfs
        .cmd()
        .arg("subvolume")
        .arg("show")
        .arg(mount_point)
        .mockup_key(format!("btrfs subvolume show (device:{key})"))
        .run()?;
    Ok(parse_subvolume_show(&output.stdout)?)
}

pub fn parse_subvolume_show(lines: &[String]) -> Result<String, ParseError> {
    lazy_static! {
        static ref UUID_LINE: Regex =
            Regex::new(&format!("^[ \t]*UUID:[ \t]*({UUID_REGEX}|-)[ \t]*$")).unwrap();
    }

    let mut uuid = None;

    for line in lines {
        if let Some(captures) = UUID_LINE.captures(line) {
            uuid = Some(captures[1].to_owned());
        }
    }

    let uuid = uuid.ok_or_else(|| {
        ParseError::new(
            "could not find 'uuid' in 'btrfs subvolume show' output",
            lines.first().cloned().unwrap_or_default(),
            "UUID: <uuid>",
        )
    })?;

    if uuid == "-" {
        // The top-level subvolume of a btrfs created with an old kernel has
        // no uuid; siblings still carry theirs.
        warn!("'btrfs subvolume show' reported 'UUID: -', leaving uuid empty");
        return Ok(String::new());
    }

    Ok(uuid)
}

pub fn subvolume_get_default(mount_point: &str, key: &str) -> Result<u64, CmdError> {
    let output = Dependency::Btrfs
        .cmd()
        .arg("subvolume")
        .arg("get-default")
        .arg(mount_point)
        .mockup_key(format!("btrfs subvolume get-default (device:{key})"))
        .run()?;
    Ok(parse_subvolume_get_default(&output.stdout)?)
}

pub fn parse_subvolume_get_default(lines: &[String]) -> Result<u64, ParseError> {
    if lines.len() != 1 {
        return Err(ParseError::new(
            "output has wrong number of lines",
            lines.join("\n"),
            "ID <n> ...",
        ));
    }

    let line = &lines[0];
    let id = line
        .strip_prefix("ID ")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|word| word.parse::<u64>().ok());

    id.ok_or_else(|| ParseError::new("output does not start with ID", line, "ID <n> ..."))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemDf {
    pub data_raid_level: BtrfsRaidLevel,
    pub metadata_raid_level: BtrfsRaidLevel,
}

pub fn filesystem_df(mount_point: &str, key: &str) -> Result<FilesystemDf, CmdError> {
    let output = Dependency::Btrfs
        .cmd()
        .arg("filesystem")
        .arg("df")
        .arg(mount_point)
        .mockup_key(format!("btrfs filesystem df (device:{key})"))
        .run()?;
    Ok(parse_filesystem_df(&output.stdout))
}

pub fn parse_filesystem_df(lines: &[String]) -> FilesystemDf {
    lazy_static! {
        static ref DATA: Regex = Regex::new("^Data, ([A-Za-z0-9]+):.*").unwrap();
        static ref METADATA: Regex = Regex::new("^Metadata, ([A-Za-z0-9]+):.*").unwrap();
        static ref MIXED: Regex = Regex::new("^Data\\+Metadata, ([A-Za-z0-9]+):.*").unwrap();
    }

    let mut df = FilesystemDf {
        data_raid_level: BtrfsRaidLevel::Unknown,
        metadata_raid_level: BtrfsRaidLevel::Unknown,
    };

    let level = |s: &str| s.parse::<BtrfsRaidLevel>().unwrap_or(BtrfsRaidLevel::Unknown);

    for line in lines {
        if let Some(captures) = DATA.captures(line) {
            df.data_raid_level = level(&captures[1]);
        }
        if let Some(captures) = METADATA.captures(line) {
            df.metadata_raid_level = level(&captures[1]);
        }
        if let Some(captures) = MIXED.captures(line) {
            df.data_raid_level = level(&captures[1]);
            df.metadata_raid_level = df.data_raid_level;
        }
    }

    df
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QgroupEntry {
    pub id: QgroupId,
    pub referenced: u64,
    pub exclusive: u64,
    pub referenced_limit: Option<u64>,
    pub exclusive_limit: Option<u64>,
    pub parents: Vec<QgroupId>,
}

/// Query qgroups. `None` means quota is not enabled: there is no direct way
/// to ask, so a failing `btrfs qgroup show` (exit code 1) is taken as
/// quota-off.
pub fn qgroup_show(mount_point: &str, key: &str) -> Result<Option<Vec<QgroupEntry>>, CmdError> {
    let output = Dependency::Btrfs
        .cmd()
        .arg("qgroup")
        .arg("show")
        .arg("-rep")
        .arg("--raw")
        .arg(mount_point)
        .mockup_key(format!("btrfs qgroup show -rep --raw (device:{key})"))
        .verify(|code| code == 0 || code == 1)
        .run()?;

    if output.exit_code != 0 {
        return Ok(None);
    }

    Ok(Some(parse_qgroup_show(&output.stdout)?))
}

pub fn parse_qgroup_show(lines: &[String]) -> Result<Vec<QgroupEntry>, ParseError> {
    let mut entries = Vec::new();

    for line in lines {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.is_empty() {
            continue;
        }

        if columns.len() < 6 {
            return Err(ParseError::new(
                "failed to parse qgroup output",
                line,
                "qgroupid referenced exclusive max_referenced max_exclusive parent",
            ));
        }

        // Header changed slightly between btrfs-progs 6.0.0 and 6.0.2.
        if columns[0] == "qgroupid" || columns[0] == "Qgroupid" || columns[0] == "--------" {
            continue;
        }

        let parse_u64 = |text: &str| -> Result<u64, ParseError> {
            text.parse::<u64>()
                .map_err(|_| ParseError::new("bad qgroup number", line.clone(), "integer"))
        };

        let mut entry = QgroupEntry {
            id: parse_qgroup_id(columns[0])?,
            referenced: parse_u64(columns[1])?,
            exclusive: parse_u64(columns[2])?,
            ..Default::default()
        };

        if columns[3] != "none" {
            entry.referenced_limit = Some(parse_u64(columns[3])?);
        }
        if columns[4] != "none" {
            entry.exclusive_limit = Some(parse_u64(columns[4])?);
        }
        if columns[5] != "---" && columns[5] != "-" {
            for parent in columns[5].split(',').filter(|p| !p.is_empty()) {
                entry.parents.push(parse_qgroup_id(parent)?);
            }
        }

        entries.push(entry);
    }

    Ok(entries)
}

/// Create a btrfs. Returns the filesystem uuid: the requested one when
/// given, otherwise the uuid parsed back from the mkfs output.
pub fn mkfs(
    devices: &[String],
    metadata_raid_level: BtrfsRaidLevel,
    data_raid_level: BtrfsRaidLevel,
    uuid: Option<&str>,
    mkfs_options: &[String],
) -> Result<String, CmdError> {
    let mut cmd = Dependency::MkfsBtrfs.cmd().arg("--force");

    if metadata_raid_level != BtrfsRaidLevel::Default {
        cmd = cmd.arg(format!("--metadata={metadata_raid_level}"));
    }
    if data_raid_level != BtrfsRaidLevel::Default {
        cmd = cmd.arg(format!("--data={data_raid_level}"));
    }
    if let Some(uuid) = uuid {
        cmd = cmd.arg(format!("--uuid={uuid}"));
    }

    // Deterministic device order keeps recorded sessions replayable.
    let mut devices = devices.to_vec();
    devices.sort();

    let output = cmd.args(mkfs_options.iter().cloned()).args(devices).run()?;

    match uuid {
        Some(uuid) => Ok(uuid.to_owned()),
        None => Ok(parse_mkfs_output(&output.stdout)?),
    }
}

pub fn parse_mkfs_output(lines: &[String]) -> Result<String, ParseError> {
    lazy_static! {
        static ref UUID_LINE: Regex =
            Regex::new(&format!("^UUID:[ \t]+({UUID_REGEX})")).unwrap();
    }

    for line in lines {
        if let Some(captures) = UUID_LINE.captures(line) {
            return Ok(captures[1].to_owned());
        }
    }

    Err(ParseError::new(
        "UUID not found in output of mkfs.btrfs",
        lines.first().cloned().unwrap_or_default(),
        "UUID: <uuid>",
    ))
}

/// Resize the member device `devid`; `None` grows to the maximum.
pub fn filesystem_resize(
    devid: u64,
    size: Option<u64>,
    mount_point: &str,
    key: &str,
) -> Result<(), CmdError> {
    let amount = match size {
        Some(bytes) => bytes.to_string(),
        None => "max".to_owned(),
    };
    Dependency::Btrfs
        .cmd()
        .arg("filesystem")
        .arg("resize")
        .arg(format!("{devid}:{amount}"))
        .arg(mount_point)
        .mockup_key(format!("btrfs filesystem resize {devid}:{amount} (device:{key})"))
        .run()?;
    Ok(())
}

pub fn device_add(device: &str, mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("device")
        .arg("add")
        .arg(device)
        .arg(mount_point)
        .mockup_key(format!("btrfs device add {device} (device:{key})"))
        .run()?;
    Ok(())
}

pub fn device_remove(device: &str, mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("device")
        .arg("remove")
        .arg(device)
        .arg(mount_point)
        .mockup_key(format!("btrfs device remove {device} (device:{key})"))
        .run()?;
    Ok(())
}

pub fn set_label(device: &str, label: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("filesystem")
        .arg("label")
        .arg(device)
        .arg(label)
        .run()?;
    Ok(())
}

pub fn quota_enable(mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("quota")
        .arg("enable")
        .arg(mount_point)
        .mockup_key(format!("btrfs quota enable (device:{key})"))
        .run()?;
    Ok(())
}

pub fn quota_disable(mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("quota")
        .arg("disable")
        .arg(mount_point)
        .mockup_key(format!("btrfs quota disable (device:{key})"))
        .run()?;
    Ok(())
}

pub fn subvolume_create(path: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("subvolume")
        .arg("create")
        .arg(path)
        .mockup_key(format!("btrfs subvolume create {key}"))
        .run()?;
    Ok(())
}

pub fn subvolume_delete(path: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("subvolume")
        .arg("delete")
        .arg(path)
        .mockup_key(format!("btrfs subvolume delete {key}"))
        .run()?;
    Ok(())
}

pub fn subvolume_set_default(id: u64, mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("subvolume")
        .arg("set-default")
        .arg(id.to_string())
        .arg(mount_point)
        .mockup_key(format!("btrfs subvolume set-default {id} (device:{key})"))
        .run()?;
    Ok(())
}

pub fn qgroup_create(id: QgroupId, mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("qgroup")
        .arg("create")
        .arg(format_qgroup_id(id))
        .arg(mount_point)
        .mockup_key(format!("btrfs qgroup create {} (device:{key})", format_qgroup_id(id)))
        .run()?;
    Ok(())
}

pub fn qgroup_destroy(id: QgroupId, mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("qgroup")
        .arg("destroy")
        .arg(format_qgroup_id(id))
        .arg(mount_point)
        .mockup_key(format!("btrfs qgroup destroy {} (device:{key})", format_qgroup_id(id)))
        .run()?;
    Ok(())
}

pub fn qgroup_assign(
    child: QgroupId,
    parent: QgroupId,
    mount_point: &str,
    key: &str,
) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("qgroup")
        .arg("assign")
        .arg(format_qgroup_id(child))
        .arg(format_qgroup_id(parent))
        .arg(mount_point)
        .mockup_key(format!(
            "btrfs qgroup assign {} {} (device:{key})",
            format_qgroup_id(child),
            format_qgroup_id(parent)
        ))
        .run()?;
    Ok(())
}

pub fn qgroup_remove(
    child: QgroupId,
    parent: QgroupId,
    mount_point: &str,
    key: &str,
) -> Result<(), CmdError> {
    Dependency::Btrfs
        .cmd()
        .arg("qgroup")
        .arg("remove")
        .arg(format_qgroup_id(child))
        .arg(format_qgroup_id(parent))
        .arg(mount_point)
        .mockup_key(format!(
            "btrfs qgroup remove {} {} (device:{key})",
            format_qgroup_id(child),
            format_qgroup_id(parent)
        ))
        .run()?;
    Ok(())
}

/// Set qgroup limits; `None` lifts the limit.
pub fn qgroup_limit(
    id: QgroupId,
    referenced: Option<u64>,
    exclusive: Option<u64>,
    mount_point: &str,
    key: &str,
) -> Result<(), CmdError> {
    let referenced_text = referenced.map_or("none".to_owned(), |v| v.to_string());
    Dependency::Btrfs
        .cmd()
        .arg("qgroup")
        .arg("limit")
        .arg(&referenced_text)
        .arg(format_qgroup_id(id))
        .arg(mount_point)
        .mockup_key(format!(
            "btrfs qgroup limit {} {} (device:{key})",
            referenced_text,
            format_qgroup_id(id)
        ))
        .run()?;

    if let Some(exclusive) = exclusive {
        Dependency::Btrfs
            .cmd()
            .arg("qgroup")
            .arg("limit")
            .arg("-e")
            .arg(exclusive.to_string())
            .arg(format_qgroup_id(id))
            .arg(mount_point)
            .mockup_key(format!(
                "btrfs qgroup limit -e {} {} (device:{key})",
                exclusive,
                format_qgroup_id(id)
            ))
            .run()?;
    }
    Ok(())
}
