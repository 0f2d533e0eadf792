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

pub mod arch;
pub mod backend;
pub mod breakpoint;
pub mod commandline;
pub mod context;
pub mod events;
pub mod exiting;
pub mod plt;
pub mod process;
pub mod process_map;
pub mod ptrace;
pub mod stopping;
pub mod symbols;
pub mod trace;
pub mod vfork;
