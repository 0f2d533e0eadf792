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

use std::error::Error;

// An entry for a mapped region in the traced process.
#[derive(Debug)]
pub struct ProcessMapEntry {
    // The memory address at which the mapping starts.
    pub begin: u64,

    // The memory address at which the mapping ends.
    pub end: u64,

    // The permission flags, e.g. "r-xp".
    pub perms: String,

    // The offset within the mapped file for this mapping.
    pub offset: u64,

    // The filename of the mapped file.
    pub filename: Option<String>,
}

// A snapshot of the mapped regions of a traced process.
#[derive(Debug)]
pub struct ProcessMap {
    pub entries: Vec<ProcessMapEntry>,
}

fn hex_field(field: &str) -> Result<u64, Box<dyn Error>> {
    u64::from_str_radix(field, 16).map_err(|_| format!("bad hex field: {}", field).into())
}

// One /proc maps line has whitespace-separated columns in a fixed order:
// range, permissions, offset, device, inode, and an optional pathname.
fn parse_maps_line(line: &str) -> Result<ProcessMapEntry, Box<dyn Error>> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 5 {
        Err(format!("short maps line: {}", line))?;
    }

    let (begin, end) = columns[0]
        .split_once('-')
        .ok_or_else(|| format!("bad maps range: {}", columns[0]))?;

    Ok(ProcessMapEntry {
        begin: hex_field(begin)?,
        end: hex_field(end)?,
        perms: columns[1].to_string(),
        offset: hex_field(columns[2])?,
        filename: columns.get(5).map(|name| name.to_string()),
    })
}

impl ProcessMap {
    // Build a ProcessMap for the current state of a process, using the
    // /proc filesystem entry for that process.
    pub fn new(pid: u32) -> Result<ProcessMap, Box<dyn Error>> {
        let maps = std::fs::read_to_string(format!("/proc/{}/maps", pid))?;

        let mut entries = Vec::new();
        for line in maps.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_maps_line(line)?);
        }
        Ok(ProcessMap { entries })
    }

    // Find the mapped region containing a particular address in the
    // traced process.
    pub fn entry_for_address(&self, address: u64) -> Option<&ProcessMapEntry> {
        self.entries
            .iter()
            .find(|entry| address >= entry.begin && address < entry.end)
    }

    // The load base of a file in this address space: the lowest address
    // at which any part of it is mapped.
    pub fn base_for_file(&self, path: &str) -> Option<u64> {
        self.entries
            .iter()
            .filter(|entry| entry.filename.as_deref() == Some(path))
            .map(|entry| entry.begin - entry.offset)
            .min()
    }
}
