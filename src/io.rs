//!
//! Byte-stream helpers: transparent gzip on text inputs, FASTA output.
//!
use crate::error::Result;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

///
/// Open a text file, decompressing on the fly when the gzip magic is
/// present.
///
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    let head = reader.fill_buf()?;
    if head.len() >= 2 && head[..2] == GZIP_MAGIC {
        Ok(Box::new(BufReader::new(GzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

///
/// Output sink: a file when a path is given, stdout otherwise.
///
pub fn create_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    match path {
        Some(p) => Ok(Box::new(File::create(p)?)),
        None => Ok(Box::new(io::stdout())),
    }
}

///
/// One FASTA record, sequence wrapped at `width` characters.
///
pub fn write_fasta<W: Write>(w: &mut W, name: &str, seq: &str, width: usize) -> io::Result<()> {
    writeln!(w, ">{}", name)?;
    let width = width.max(1);
    let bytes = seq.as_bytes();
    for chunk in bytes.chunks(width) {
        w.write_all(chunk)?;
        writeln!(w)?;
    }
    Ok(())
}
