//!
//! Event-table reader: the concrete source of per-read event streams.
//!
//! The upstream signal container is out of scope here; this module
//! consumes its exported form, a (possibly gzipped) per-read text
//! table:
//!
//! ```text
//! #read_id ch117_file42
//! strand  mean    stdv    start   length
//! 0       53.12   0.92    0.000   0.010
//! 1       47.80   1.10    12.40   0.008
//! ```
//!
//! Comment lines start with `#`; `#read_id` names the read (the file
//! stem otherwise). Data rows are `strand mean stdv start length` with
//! strand 0 or 1. Strand bounds are the row-index span of each strand.
//!
use crate::error::{Error, Result};
use crate::events::Event;
use crate::io::open_text;
use std::io::BufRead;
use std::path::Path;

const EXTENSIONS: [&str; 4] = [".events", ".events.tsv", ".events.gz", ".events.tsv.gz"];

///
/// Everything the pipeline needs from one read.
///
#[derive(Debug, Clone, Default)]
pub struct ReadRecord {
    pub read_id: String,
    pub have_ed_events: bool,
    pub events: [Vec<Event>; 2],
    /// inclusive start / exclusive end row index per strand
    pub strand_bounds: [[usize; 2]; 2],
}

///
/// Cheap check used while scanning input directories and fofn lines.
///
pub fn is_valid_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    EXTENSIONS.iter().any(|ext| name.ends_with(ext)) && path.is_file()
}

fn read_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .map(|stem| stem.to_string())
        .unwrap_or(name)
}

///
/// Parse the whole table.
///
pub fn load(path: &Path) -> Result<ReadRecord> {
    let reader = open_text(path)?;
    let mut record = ReadRecord {
        read_id: read_id_from_path(path),
        ..ReadRecord::default()
    };
    let mut row = 0usize;
    let mut bounds: [Option<[usize; 2]>; 2] = [None, None];
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('#') {
            let mut fields = rest.split_whitespace();
            if fields.next() == Some("read_id") {
                if let Some(id) = fields.next() {
                    record.read_id = id.to_string();
                }
            }
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 5 {
            // one header line of column names is tolerated up front
            if row == 0 && fields[0].parse::<u8>().is_err() {
                continue;
            }
            return Err(Error::parse(path, lineno + 1, "expected: strand mean stdv start length"));
        }
        let parse_err = |what: &str| Error::parse(path, lineno + 1, format!("bad {}", what));
        let st: usize = match fields[0] {
            "0" => 0,
            "1" => 1,
            _ => {
                if row == 0 {
                    // column-name header
                    continue;
                }
                return Err(parse_err("strand"));
            }
        };
        let ev = Event {
            mean: fields[1].parse().map_err(|_| parse_err("mean"))?,
            stdv: fields[2].parse().map_err(|_| parse_err("stdv"))?,
            start: fields[3].parse().map_err(|_| parse_err("start"))?,
            length: fields[4].parse().map_err(|_| parse_err("length"))?,
        };
        record.events[st].push(ev);
        match &mut bounds[st] {
            Some(b) => b[1] = row + 1,
            None => bounds[st] = Some([row, row + 1]),
        }
        row += 1;
    }
    for st in 0..2 {
        record.strand_bounds[st] = bounds[st].unwrap_or([0, 0]);
    }
    record.have_ed_events = row > 0;
    Ok(record)
}
