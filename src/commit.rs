//! The commit engine: runs the ordered actions of an action graph and
//! reports progress and failures through callbacks.

use std::collections::BTreeSet;

use log::{info, warn};

use crate::{
    actiongraph::ActionGraph,
    actions::{CommitData, Tense},
    error::Result,
};

/// Progress and error reporting during commit. `error` decides how to go
/// on: `true` skips everything depending on the failed action but keeps
/// independent branches running, `false` stops the commit.
pub trait CommitCallbacks {
    fn message(&self, _text: &str) {}

    fn error(&self, _message: &str, _what: &str) -> bool {
        false
    }
}

/// Callbacks that log and give up on the first error.
#[derive(Debug, Default)]
pub struct SimpleCommitCallbacks;

impl CommitCallbacks for SimpleCommitCallbacks {
    fn message(&self, text: &str) {
        info!("commit: {text}");
    }
}

pub fn commit(
    data: CommitData,
    actiongraph: &ActionGraph,
    callbacks: &dyn CommitCallbacks,
) -> Result<()> {
    let mut skipped = BTreeSet::new();

    for node in actiongraph.ordered_nodes() {
        let action = actiongraph.action(*node);

        if skipped.contains(node) {
            warn!(
                "skipping '{}', it depends on a failed action",
                action.text(Tense::SimplePresent, data)
            );
            continue;
        }

        callbacks.message(&action.text(Tense::ContinuousPresent, data));

        if let Err(error) = action.execute(data) {
            let message = format!("Failed to {}", decapitalize(&action.text(Tense::SimplePresent, data)));
            if !callbacks.error(&message, &error.to_string()) {
                return Err(error);
            }
            skipped.extend(actiongraph.dependents(*node));
        }
    }

    Ok(())
}

fn decapitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        actiongraph::ActionGraph,
        devicegraph::{device::PtType, DeviceGraph},
        error::StorageError,
    };
    use osutils::mockup::{self, Command, Mode};
    use sysdefs::bytes::{ByteCount, GIB};
    use sysdefs::filesystems::FsType;
    use sysdefs::region::Region;

    #[derive(Default)]
    struct Recorder {
        messages: RefCell<Vec<String>>,
        errors: RefCell<Vec<(String, String)>>,
        skip_on_error: bool,
    }

    impl CommitCallbacks for Recorder {
        fn message(&self, text: &str) {
            self.messages.borrow_mut().push(text.to_owned());
        }

        fn error(&self, message: &str, what: &str) -> bool {
            self.errors
                .borrow_mut()
                .push((message.to_owned(), what.to_owned()));
            self.skip_on_error
        }
    }

    fn staging_with_new_filesystem() -> (DeviceGraph, DeviceGraph) {
        let mut lhs = DeviceGraph::new();
        let disk = lhs.create_disk("/dev/sdb", ByteCount(32 * GIB));
        let mut rhs = lhs.clone();

        let table = rhs.create_partition_table(disk, PtType::Gpt).unwrap();
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = rhs.create_partition(table, region).unwrap();
        let filesystem = rhs.create_filesystem(partition, FsType::Ext4).unwrap();
        let mount_point = rhs.create_mount_point(filesystem, "/data").unwrap();
        rhs.device_mut(mount_point)
            .unwrap()
            .as_mount_point_mut()
            .unwrap()
            .active = true;
        (lhs, rhs)
    }

    #[test]
    fn test_commit_runs_all_actions_in_order() {
        let _guard = osutils::testing::playback_lock();
        mockup::set_mode(Mode::Playback);
        mockup::clear();
        mockup::set_command("parted --script /dev/sdb mklabel gpt", Command::default());
        mockup::set_command(
            "parted --script /dev/sdb unit s mkpart primary 2048s 2099199s",
            Command::default(),
        );
        mockup::set_command("udevadm settle", Command::default());
        mockup::set_command("mkfs.ext4 -F /dev/sdb1", Command::default());
        mockup::set_command("mount (device:/dev/sdb1)", Command::default());

        let (lhs, rhs) = staging_with_new_filesystem();
        let data = CommitData { lhs: &lhs, rhs: &rhs };
        let actiongraph = ActionGraph::build(&lhs, &rhs).unwrap();

        let recorder = Recorder::default();
        commit(data, &actiongraph, &recorder).unwrap();

        let messages = recorder.messages.borrow();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0], "Creating gpt partition table");
        assert_eq!(messages[1], "Creating /dev/sdb1");
        assert_eq!(messages[2], "Creating ext4 on /dev/sdb1");
        assert_eq!(messages[3], "Mounting ext4 at /data");
        assert_eq!(messages[4], "Adding ext4 at /data to /etc/fstab");
        assert!(recorder.errors.borrow().is_empty());

        mockup::set_mode(Mode::None);
    }

    #[test]
    fn test_commit_error_skips_dependents() {
        let _guard = osutils::testing::playback_lock();
        mockup::set_mode(Mode::Playback);
        mockup::clear();
        mockup::set_command("parted --script /dev/sdb mklabel gpt", Command::default());
        // The mkpart entry is missing, so creating the partition fails;
        // everything downstream of it must be skipped.
        mockup::set_command("udevadm settle", Command::default());

        let (lhs, rhs) = staging_with_new_filesystem();
        let data = CommitData { lhs: &lhs, rhs: &rhs };
        let actiongraph = ActionGraph::build(&lhs, &rhs).unwrap();

        let recorder = Recorder { skip_on_error: true, ..Default::default() };
        commit(data, &actiongraph, &recorder).unwrap();

        let errors = recorder.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.starts_with("Failed to create /dev/sdb1"));

        // Only the partition table creation ran to completion; the
        // messages after the failure are not emitted for skipped actions.
        let messages = recorder.messages.borrow();
        assert_eq!(messages.len(), 2);

        mockup::set_mode(Mode::None);
    }

    #[test]
    fn test_commit_error_stops_when_callback_says_so() {
        let _guard = osutils::testing::playback_lock();
        mockup::set_mode(Mode::Playback);
        mockup::clear();

        let (lhs, rhs) = staging_with_new_filesystem();
        let data = CommitData { lhs: &lhs, rhs: &rhs };
        let actiongraph = ActionGraph::build(&lhs, &rhs).unwrap();

        let recorder = Recorder::default();
        let result = commit(data, &actiongraph, &recorder);
        assert!(matches!(result, Err(StorageError::Cmd(_))));
        assert_eq!(recorder.errors.borrow().len(), 1);

        mockup::set_mode(Mode::None);
    }
}
