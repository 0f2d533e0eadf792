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

use callscope_trace::commandline;
use callscope_trace::trace;
use std::error::Error;
use std::io::Write;

// The main entry point for callscope-trace.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = commandline::CommandLineArguments::parse(&mut std::env::args())?;
    if args.report_version {
        commandline::report_version();
        return Ok(());
    }
    if args.show_help {
        commandline::show_help();
        return Ok(());
    }

    let output: Box<dyn Write> = match &args.output_filename {
        Some(filename) => Box::new(std::fs::File::create(filename)?),
        None => Box::new(std::io::stdout()),
    };

    if !args.target_pids.is_empty() {
        trace::trace_pids(&args.target_pids, output)?;
    } else if !args.command.is_empty() {
        trace::trace_command(&args.command, output)?;
    } else {
        commandline::show_help();
    }

    Ok(())
}
