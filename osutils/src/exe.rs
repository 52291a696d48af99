use std::process::Command as StdCommand;

use log::trace;

use crate::{
    errors::CmdError,
    mockup::{self, Mode},
};

/// Captured output of an external tool, line-buffered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn stdout_joined(&self) -> String {
        self.stdout.join("\n")
    }
}

/// A prepared external tool invocation. Every invocation goes through the
/// mockup: under `Playback` the output is served from the store, under
/// `Record` the real output is captured into it.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    mockup_key: Option<String>,
    verify: fn(i32) -> bool,
}

fn exit_code_zero(code: i32) -> bool {
    code == 0
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            mockup_key: None,
            verify: exit_code_zero,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Override the mockup key. Needed when the command line contains
    /// unstable parts such as ephemeral mount points.
    pub fn mockup_key(mut self, key: impl Into<String>) -> Self {
        self.mockup_key = Some(key.into());
        self
    }

    /// Accept exit codes beyond zero.
    pub fn verify(mut self, verify: fn(i32) -> bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn render(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                rendered.push('\'');
                rendered.push_str(arg);
                rendered.push('\'');
            } else {
                rendered.push_str(arg);
            }
        }
        rendered
    }

    fn key(&self) -> String {
        self.mockup_key.clone().unwrap_or_else(|| self.render())
    }

    /// Run the command and check its exit code.
    pub fn run(self) -> Result<CmdOutput, CmdError> {
        let rendered = self.render();
        let key = self.key();

        let output = match mockup::mode() {
            Mode::Playback => {
                trace!("Playing back '{key}'");
                match mockup::command(&key) {
                    Some(entry) => CmdOutput {
                        stdout: entry.stdout,
                        stderr: entry.stderr,
                        exit_code: entry.exit_code,
                    },
                    None => return Err(CmdError::NoMockup { key }),
                }
            }
            mode => {
                trace!("Executing '{rendered}'");
                let output = StdCommand::new(&self.program)
                    .args(&self.args)
                    .output()
                    .map_err(|source| CmdError::CouldNotExecute {
                        command: rendered.clone(),
                        source,
                    })?;

                let output = CmdOutput {
                    stdout: lines(&output.stdout),
                    stderr: lines(&output.stderr),
                    exit_code: output.status.code().unwrap_or(-1),
                };

                if mode == Mode::Record {
                    mockup::set_command(
                        key,
                        mockup::Command {
                            stdout: output.stdout.clone(),
                            stderr: output.stderr.clone(),
                            exit_code: output.exit_code,
                        },
                    );
                }

                output
            }
        };

        trace!(
            "Executed '{rendered}', exit code {}, {} stdout lines",
            output.exit_code,
            output.stdout.len()
        );

        if !(self.verify)(output.exit_code) {
            return Err(CmdError::Failed {
                command: rendered,
                stderr: output.stderr.join("\n"),
                code: output.exit_code,
            });
        }

        Ok(output)
    }
}

fn lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_quotes_whitespace() {
        let cmd = Cmd::new("btrfs")
            .arg("filesystem")
            .arg("label")
            .arg("/dev/sda1")
            .arg("hello world");
        assert_eq!(cmd.render(), "btrfs filesystem label /dev/sda1 'hello world'");
    }
}
