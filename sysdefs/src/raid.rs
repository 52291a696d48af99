use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// RAID profiles of a btrfs, used for both data and metadata. The spellings
/// are the ones `mkfs.btrfs --data/--metadata` accepts and `btrfs filesystem
/// df` reports (upper-cased there).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BtrfsRaidLevel {
    #[default]
    Default,
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid1c3,
    Raid1c4,
    Raid5,
    Raid6,
    Raid10,
    Unknown,
}

impl BtrfsRaidLevel {
    /// Minimum number of member devices the profile needs.
    pub fn min_devices(self) -> usize {
        match self {
            BtrfsRaidLevel::Default
            | BtrfsRaidLevel::Single
            | BtrfsRaidLevel::Dup
            | BtrfsRaidLevel::Unknown => 1,
            BtrfsRaidLevel::Raid0 | BtrfsRaidLevel::Raid1 | BtrfsRaidLevel::Raid5 => 2,
            BtrfsRaidLevel::Raid1c3 | BtrfsRaidLevel::Raid6 => 3,
            BtrfsRaidLevel::Raid1c4 | BtrfsRaidLevel::Raid10 => 4,
        }
    }
}

/// MD RAID levels as understood by `mdadm --level`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MdLevel {
    #[default]
    Unknown,
    Linear,
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
    Container,
}

impl MdLevel {
    pub fn min_devices(self) -> usize {
        match self {
            MdLevel::Unknown | MdLevel::Linear | MdLevel::Container => 1,
            MdLevel::Raid0 | MdLevel::Raid1 | MdLevel::Raid10 => 2,
            MdLevel::Raid4 | MdLevel::Raid5 => 3,
            MdLevel::Raid6 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spellings() {
        assert_eq!(BtrfsRaidLevel::Raid1c3.to_string(), "raid1c3");
        assert_eq!(
            "RAID10".parse::<BtrfsRaidLevel>().unwrap(),
            BtrfsRaidLevel::Raid10
        );
        assert_eq!("raid6".parse::<MdLevel>().unwrap(), MdLevel::Raid6);
    }

    #[test]
    fn test_min_devices() {
        assert_eq!(BtrfsRaidLevel::Single.min_devices(), 1);
        assert_eq!(BtrfsRaidLevel::Raid6.min_devices(), 3);
        assert_eq!(MdLevel::Raid5.min_devices(), 3);
    }
}
