use lazy_static::lazy_static;
use log::trace;
use regex::Regex;

use crate::{
    dependencies::Dependency,
    errors::{CmdError, ParseError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

/// Parsed `cryptsetup luksDump` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksDump {
    pub name: String,
    pub version: LuksVersion,
    pub uuid: String,
    /// Combined cipher spec, e.g. `aes-xts-plain64`
    pub cipher: String,
    /// Key size in bytes
    pub key_size: u64,
    /// LUKS2 header label, when set
    pub label: Option<String>,
    /// PBKDF of the first key slot (LUKS2)
    pub pbkdf: Option<String>,
    /// Integrity mode of the data segment (LUKS2), e.g. `aead`
    pub integrity: Option<String>,
}

pub fn luks_dump(name: &str) -> Result<LuksDump, CmdError> {
    let output = Dependency::Cryptsetup
        .cmd()
        .arg("luksDump")
        .arg(name)
        .run()?;
    Ok(parse_luks_dump(name, &output.stdout)?)
}

fn value_of<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.trim_start()
        .strip_prefix(tag)
        .map(|rest| rest.trim())
        .filter(|rest| !rest.is_empty())
}

pub fn parse_luks_dump(name: &str, lines: &[String]) -> Result<LuksDump, ParseError> {
    lazy_static! {
        static ref BITS: Regex = Regex::new("^([0-9]+)( bits)?$").unwrap();
    }

    let mut version = None;
    let mut uuid = None;
    let mut cipher_name = None;
    let mut cipher_mode = None;
    let mut cipher = None;
    let mut key_bits = None;
    let mut label = None;
    let mut pbkdf = None;
    let mut integrity = None;

    for line in lines {
        if let Some(value) = value_of(line, "Version:") {
            version = match value {
                "1" => Some(LuksVersion::Luks1),
                "2" => Some(LuksVersion::Luks2),
                _ => {
                    return Err(ParseError::new(
                        "unknown LUKS version",
                        line,
                        "Version: 1 or 2",
                    ))
                }
            };
        } else if let Some(value) = value_of(line, "UUID:") {
            uuid = Some(value.to_owned());
        } else if let Some(value) = value_of(line, "Label:") {
            if value != "(no label)" {
                label = Some(value.to_owned());
            }
        } else if let Some(value) = value_of(line, "Cipher name:") {
            cipher_name = Some(value.to_owned());
        } else if let Some(value) = value_of(line, "Cipher mode:") {
            cipher_mode = Some(value.to_owned());
        } else if let Some(value) = value_of(line, "MK bits:") {
            key_bits = value.parse::<u64>().ok();
        } else if let Some(value) = value_of(line, "cipher:") {
            // Data segment of a LUKS2 header.
            cipher.get_or_insert_with(|| value.to_owned());
        } else if let Some(value) = value_of(line, "integrity:") {
            integrity.get_or_insert_with(|| value.to_owned());
        } else if let Some(value) = value_of(line, "PBKDF:") {
            // Only the first key slot is of interest.
            pbkdf.get_or_insert_with(|| value.to_owned());
        } else if let Some(value) = value_of(line, "Key:") {
            if key_bits.is_none() {
                if let Some(captures) = BITS.captures(value) {
                    key_bits = captures[1].parse::<u64>().ok();
                }
            }
        }
    }

    let version = version.ok_or_else(|| {
        ParseError::new("missing LUKS version", name, "Version: 1 or 2")
    })?;

    let cipher = match version {
        LuksVersion::Luks1 => match (cipher_name, cipher_mode) {
            (Some(name), Some(mode)) => format!("{name}-{mode}"),
            _ => {
                return Err(ParseError::new(
                    "missing cipher in LUKS1 header",
                    name,
                    "Cipher name: and Cipher mode:",
                ))
            }
        },
        LuksVersion::Luks2 => cipher.ok_or_else(|| {
            ParseError::new("missing cipher in LUKS2 data segment", name, "cipher: <spec>")
        })?,
    };

    let dump = LuksDump {
        name: name.to_owned(),
        version,
        uuid: uuid.unwrap_or_default(),
        cipher,
        key_size: key_bits.unwrap_or(0) / 8,
        label,
        pbkdf,
        integrity,
    };

    trace!("cryptsetup luksDump for {}: {:?}", name, dump);

    Ok(dump)
}

pub fn luks_format(
    device: &str,
    luks2: bool,
    cipher: Option<&str>,
    key_size_bytes: Option<u64>,
    label: Option<&str>,
    uuid: Option<&str>,
) -> Result<(), CmdError> {
    let mut cmd = Dependency::Cryptsetup
        .cmd()
        .arg("luksFormat")
        .arg("--batch-mode")
        .arg("--type")
        .arg(if luks2 { "luks2" } else { "luks1" });

    if let Some(cipher) = cipher {
        cmd = cmd.arg("--cipher").arg(cipher);
    }
    if let Some(key_size_bytes) = key_size_bytes {
        cmd = cmd.arg("--key-size").arg((key_size_bytes * 8).to_string());
    }
    if let Some(label) = label {
        // Labels exist in LUKS2 headers only.
        if luks2 {
            cmd = cmd.arg("--label").arg(label);
        }
    }
    if let Some(uuid) = uuid {
        cmd = cmd.arg("--uuid").arg(uuid);
    }

    cmd.arg(device).run()?;
    Ok(())
}

pub fn luks_open(device: &str, dm_name: &str) -> Result<(), CmdError> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksOpen")
        .arg(device)
        .arg(dm_name)
        .run()?;
    Ok(())
}

pub fn close(dm_name: &str) -> Result<(), CmdError> {
    Dependency::Cryptsetup.cmd().arg("close").arg(dm_name).run()?;
    Ok(())
}

/// Open a BitLocker volume with cryptsetup. Only used when explicitly
/// enabled, see the engine's environment toggles.
pub fn bitlk_open(device: &str, dm_name: &str) -> Result<(), CmdError> {
    Dependency::Cryptsetup
        .cmd()
        .arg("bitlkOpen")
        .arg(device)
        .arg(dm_name)
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_luks1() {
        let input = lines(&[
            "LUKS header information for /dev/sdc1",
            "",
            "Version:       \t1",
            "Cipher name:   \taes",
            "Cipher mode:   \txts-plain64",
            "Hash spec:     \tsha256",
            "Payload offset:\t4096",
            "MK bits:       \t512",
            "MK iterations: \t139586",
            "UUID:          \tf0b3c940-6bf1-4afa-8ba4-fa4d97b026b6",
            "",
            "Key Slot 0: ENABLED",
            "Key Slot 1: DISABLED",
        ]);

        let dump = parse_luks_dump("/dev/sdc1", &input).unwrap();
        assert_eq!(dump.version, LuksVersion::Luks1);
        assert_eq!(dump.uuid, "f0b3c940-6bf1-4afa-8ba4-fa4d97b026b6");
        assert_eq!(dump.cipher, "aes-xts-plain64");
        assert_eq!(dump.key_size, 64);
        assert_eq!(dump.label, None);
        assert_eq!(dump.pbkdf, None);
    }

    #[test]
    fn test_parse_luks2() {
        let input = lines(&[
            "LUKS header information",
            "Version:       \t2",
            "Epoch:         \t3",
            "UUID:          \tc8338763-450d-4143-92b2-dff843aff1ac",
            "Label:         \tLUKS-TEST",
            "Subsystem:     \t(no subsystem)",
            "",
            "Data segments:",
            "  0: crypt",
            "\toffset: 16777216 [bytes]",
            "\tlength: (whole device)",
            "\tcipher: aes-xts-plain64",
            "\tsector: 512 [bytes]",
            "\tintegrity: aead",
            "",
            "Keyslots:",
            "  0: luks2",
            "\tKey:        512 bits",
            "\tPriority:   normal",
            "\tCipher:     aes-xts-plain64",
            "\tPBKDF:      argon2i",
            "\tTime cost:  9",
        ]);

        let dump = parse_luks_dump("/dev/sdc1", &input).unwrap();
        assert_eq!(dump.version, LuksVersion::Luks2);
        assert_eq!(dump.uuid, "c8338763-450d-4143-92b2-dff843aff1ac");
        assert_eq!(dump.cipher, "aes-xts-plain64");
        assert_eq!(dump.key_size, 64);
        assert_eq!(dump.label.as_deref(), Some("LUKS-TEST"));
        assert_eq!(dump.pbkdf.as_deref(), Some("argon2i"));
        assert_eq!(dump.integrity.as_deref(), Some("aead"));
    }

    #[test]
    fn test_parse_luks2_without_integrity() {
        let input = lines(&[
            "Version:       \t2",
            "UUID:          \tc8338763-450d-4143-92b2-dff843aff1ac",
            "Data segments:",
            "  0: crypt",
            "\tcipher: aes-xts-plain64",
            "Keyslots:",
            "  0: luks2",
            "\tKey:        256 bits",
            "\tPBKDF:      pbkdf2",
        ]);

        let dump = parse_luks_dump("/dev/sdc1", &input).unwrap();
        assert_eq!(dump.key_size, 32);
        assert_eq!(dump.integrity, None);
        assert_eq!(dump.pbkdf.as_deref(), Some("pbkdf2"));
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(parse_luks_dump("/dev/sdc1", &lines(&["Cipher name: aes"])).is_err());
        assert!(parse_luks_dump("/dev/sdc1", &lines(&["Version: \t1"])).is_err());
    }
}
