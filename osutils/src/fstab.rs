use std::fs;

use log::{info, warn};

use crate::{errors::FileError, files, mockup};

/// One line of `/etc/fstab`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FstabEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub freq: u32,
    pub passno: u32,
}

impl FstabEntry {
    fn render(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.device,
            self.mount_point,
            self.fs_type,
            if self.options.is_empty() {
                "defaults".to_owned()
            } else {
                self.options.join(",")
            },
            self.freq,
            self.passno
        )
    }
}

pub fn parse(lines: &[String]) -> Vec<FstabEntry> {
    let mut entries = Vec::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }

        entries.push(FstabEntry {
            device: fields[0].to_owned(),
            mount_point: fields[1].to_owned(),
            fs_type: fields[2].to_owned(),
            options: fields
                .get(3)
                .map(|o| o.split(',').map(str::to_owned).collect())
                .unwrap_or_default(),
            freq: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
            passno: fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(0),
        });
    }

    entries
}

pub fn read(path: &str) -> Result<Vec<FstabEntry>, FileError> {
    Ok(parse(&files::read_lines_if_exists(path)?))
}

/// Append an entry. Under playback the write is suppressed, the mockup is a
/// read-only view of the recorded system.
pub fn add_entry(path: &str, entry: &FstabEntry) -> Result<(), FileError> {
    if mockup::mode() == mockup::Mode::Playback {
        info!("Playback mode, not writing to '{path}'");
        return Ok(());
    }

    let mut lines = files::read_lines_if_exists(path)?;
    lines.push(entry.render());
    write_lines(path, &lines)
}

/// Drop the entries mounting `mount_point`.
pub fn remove_entry(path: &str, mount_point: &str) -> Result<(), FileError> {
    if mockup::mode() == mockup::Mode::Playback {
        info!("Playback mode, not writing to '{path}'");
        return Ok(());
    }

    let lines = files::read_lines_if_exists(path)?;
    let kept: Vec<String> = lines
        .iter()
        .filter(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields.len() < 2 || fields[0].starts_with('#') || fields[1] != mount_point
        })
        .cloned()
        .collect();

    if kept.len() == lines.len() {
        warn!("No entry for '{mount_point}' found in '{path}'");
    }

    write_lines(path, &kept)
}

fn write_lines(path: &str, lines: &[String]) -> Result<(), FileError> {
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text).map_err(|source| FileError::Io {
        path: path.to_owned(),
        source,
    })
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
            "# /etc/fstab",
            "",
            "UUID=14875716-b8e3-4ab8-b903-b1289bc9568d / btrfs defaults 0 0",
            "/dev/sda2 /home xfs defaults,noatime 0 2",
            "/dev/sda3 none swap sw 0 0",
        ]);

        let entries = parse(&input);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].fs_type, "btrfs");
        assert_eq!(entries[1].options, vec!["defaults", "noatime"]);
        assert_eq!(entries[1].passno, 2);
        assert_eq!(entries[2].mount_point, "none");
    }

    #[test]
    fn test_render() {
        let entry = FstabEntry {
            device: "/dev/sda2".into(),
            mount_point: "/home".into(),
            fs_type: "xfs".into(),
            options: vec!["noatime".into()],
            freq: 0,
            passno: 2,
        };
        assert_eq!(entry.render(), "/dev/sda2 /home xfs noatime 0 2");
    }
}
