/*
    callscope  -  a library call tracing tool
    Copyright (C) 2023  Matt Kimball

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::collections::VecDeque;
use std::error::Error;

// Parsed commandline arguments.
pub struct CommandLineArguments {
    // Filename for the trace output; stdout when absent.
    pub output_filename: Option<String>,

    // The commandline for the process to spawn and trace.
    pub command: Vec<String>,

    // Running processes to attach the trace to.  Repeatable.
    pub target_pids: Vec<u32>,

    // If true, print the version of the tool and exit.
    pub report_version: bool,

    // If true, print the commandline help text and exit.
    pub show_help: bool,
}

// Print the commandline help text.
pub fn show_help() {
    println!(
        "Usage: callscope-trace [OPTIONS] [COMMAND]

    -o, --output FILE   Write call trace to given filename
    -p, --pid TARGET    Attach to running process (repeatable)
    -v, --version       Report version
"
    );
}

// Print the version of the build.
pub fn report_version() {
    println!("callscope-trace {}", env!("CARGO_PKG_VERSION"));
}

impl CommandLineArguments {
    // Parse the commandline.  Options are recognized up to the first
    // bare word; that word and everything after it form the command to
    // trace, so the target keeps its own flags untouched.
    pub fn parse(
        args: &mut dyn Iterator<Item = String>,
    ) -> Result<CommandLineArguments, Box<dyn Error>> {
        let mut parsed = CommandLineArguments {
            output_filename: None,
            command: Vec::new(),
            target_pids: Vec::new(),
            report_version: false,
            show_help: false,
        };

        let mut pending: VecDeque<String> = args.skip(1).collect();
        while let Some(word) = pending.pop_front() {
            match word.as_str() {
                "-h" | "--help" => parsed.show_help = true,
                "-v" | "--version" => parsed.report_version = true,
                "-p" | "--pid" => {
                    let value = pending.pop_front().ok_or("-p wants a process id")?;
                    match value.parse() {
                        Ok(pid) => parsed.target_pids.push(pid),
                        Err(_) => Err(format!("not a process id: {}", value))?,
                    }
                }
                "-o" | "--output" => {
                    let value = pending.pop_front().ok_or("-o wants a filename")?;
                    parsed.output_filename = Some(value);
                }
                other if other.starts_with('-') => {
                    eprintln!("unknown option: {}", other);
                    parsed.show_help = true;
                }
                _ => {
                    parsed.command.push(word);
                    parsed.command.extend(pending.drain(..));
                }
            }
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(tokens: &[&str]) -> CommandLineArguments {
        let mut args = std::iter::once("callscope-trace".to_string())
            .chain(tokens.iter().map(|t| t.to_string()));
        CommandLineArguments::parse(&mut args).unwrap()
    }

    #[test]
    fn pid_flag_is_repeatable() {
        let args = parse(&["-p", "1000", "-p", "1001"]);
        assert_eq!(args.target_pids, vec![1000, 1001]);
        assert!(args.command.is_empty());
    }

    #[test]
    fn command_swallows_later_flags() {
        let args = parse(&["-o", "out.txt", "ls", "-l", "/tmp"]);
        assert_eq!(args.output_filename.as_deref(), Some("out.txt"));
        assert_eq!(args.command, vec!["ls", "-l", "/tmp"]);
    }

    #[test]
    fn invalid_pid_is_an_error() {
        let mut args = ["callscope-trace", "-p", "soon"]
            .iter()
            .map(|t| t.to_string());
        assert!(CommandLineArguments::parse(&mut args).is_err());
    }

    #[test]
    fn missing_flag_value_is_an_error() {
        let mut args = ["callscope-trace", "-o"].iter().map(|t| t.to_string());
        assert!(CommandLineArguments::parse(&mut args).is_err());
    }
}
