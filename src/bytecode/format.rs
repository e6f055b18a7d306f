//! The linked binary: a link-table header followed by code.
//!
//! ```text
//! u32            byte count of the link table
//! per entry:     u32 index, u32 name length, name bytes (UTF-8)
//! ...            code
//! ```
//!
//! The artifact written by `cinder compile` prepends the entry offset as one more
//! `u32`. All integers are little-endian.

use thiserror::Error;

use crate::bytecode::emit::LinkEntry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("binary is truncated: expected {expected} more bytes for the {what}")]
    Truncated { what: &'static str, expected: usize },
    #[error("link table entry {index} has a name that is not valid UTF-8")]
    InvalidName { index: u32 },
    #[error("link table entry at byte {used} overruns the {claimed}-byte table")]
    TableMismatch { claimed: usize, used: usize },
    #[error("entry offset {entry} is outside the code ({len} bytes)")]
    EntryOutOfBounds { entry: u32, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub externals: Vec<LinkEntry>,
    pub code: Vec<u8>,
    /// Code offset of the start routine.
    pub entry: u32,
}

impl Program {
    /// Header and code, without the entry offset.
    pub fn image(&self) -> Vec<u8> {
        let mut table = Vec::new();
        for entry in &self.externals {
            table.extend_from_slice(&entry.index.to_le_bytes());
            table.extend_from_slice(&(entry.name.len() as u32).to_le_bytes());
            table.extend_from_slice(entry.name.as_bytes());
        }

        let mut out = Vec::with_capacity(4 + table.len() + self.code.len());
        out.extend_from_slice(&(table.len() as u32).to_le_bytes());
        out.extend_from_slice(&table);
        out.extend_from_slice(&self.code);
        out
    }

    /// Reads an image produced by [`Program::image`].
    pub fn from_image(bytes: &[u8], entry: u32) -> Result<Program, FormatError> {
        let mut reader = Reader { bytes, pos: 0 };
        let claimed = reader.u32("link table size")? as usize;
        let table = reader.take(claimed, "link table")?;
        let code = bytes[reader.pos..].to_vec();

        let mut externals = Vec::new();
        let mut table = Reader {
            bytes: table,
            pos: 0,
        };
        while table.pos < table.bytes.len() {
            let start = table.pos;
            let overrun = |_| FormatError::TableMismatch {
                claimed,
                used: start,
            };
            let index = table.u32("link index").map_err(overrun)?;
            let len = table.u32("name length").map_err(overrun)? as usize;
            let name = table.take(len, "external name").map_err(overrun)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| FormatError::InvalidName { index })?;
            externals.push(LinkEntry { index, name });
        }

        if entry as usize >= code.len() && !code.is_empty() {
            return Err(FormatError::EntryOutOfBounds {
                entry,
                len: code.len(),
            });
        }
        Ok(Program {
            externals,
            code,
            entry,
        })
    }

    /// The on-disk form: entry offset, then the image.
    pub fn to_artifact(&self) -> Vec<u8> {
        let mut out = self.entry.to_le_bytes().to_vec();
        out.extend_from_slice(&self.image());
        out
    }

    pub fn from_artifact(bytes: &[u8]) -> Result<Program, FormatError> {
        let mut reader = Reader { bytes, pos: 0 };
        let entry = reader.u32("entry offset")?;
        Program::from_image(&bytes[reader.pos..], entry)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], FormatError> {
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(FormatError::Truncated {
                what,
                expected: n - remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FormatError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        Program {
            externals: vec![
                LinkEntry {
                    index: 0,
                    name: "print_int".to_string(),
                },
                LinkEntry {
                    index: 1,
                    name: "io.write".to_string(),
                },
            ],
            code: vec![0x01, 0, 0, 0, 0, 0x04, 0, 0, 0, 0, 0, 0, 0, 0],
            entry: 0,
        }
    }

    #[test]
    fn test_header_layout() {
        let image = program().image();
        // 2 entries: 4 + 4 + 9 and 4 + 4 + 8
        assert_eq!(&image[..4], &33u32.to_le_bytes());
        assert_eq!(&image[4..8], &0u32.to_le_bytes());
        assert_eq!(&image[8..12], &9u32.to_le_bytes());
        assert_eq!(&image[12..21], b"print_int");
        assert_eq!(&image[37..], &program().code[..]);
    }

    #[test]
    fn test_artifact_round_trip() {
        let mut original = program();
        original.entry = 5;
        let read = Program::from_artifact(&original.to_artifact()).unwrap();
        assert_eq!(read, original);
    }

    #[test]
    fn test_empty_table() {
        let program = Program {
            externals: Vec::new(),
            code: vec![0x04, 0, 0, 0, 0, 0, 0, 0, 0],
            entry: 0,
        };
        let image = program.image();
        assert_eq!(&image[..4], &[0, 0, 0, 0]);
        assert_eq!(Program::from_image(&image, 0).unwrap(), program);
    }

    #[test]
    fn test_truncated_inputs() {
        assert!(matches!(
            Program::from_artifact(&[1, 0]),
            Err(FormatError::Truncated { what: "entry offset", .. })
        ));

        let mut image = program().image();
        image.truncate(15);
        assert!(matches!(
            Program::from_image(&image, 0),
            Err(FormatError::Truncated { what: "link table", .. })
        ));
    }

    #[test]
    fn test_entry_overrunning_table() {
        let mut image = program().image();
        image[..4].copy_from_slice(&30u32.to_le_bytes());
        assert_eq!(
            Program::from_image(&image, 0),
            Err(FormatError::TableMismatch {
                claimed: 30,
                used: 17
            })
        );
    }

    #[test]
    fn test_bad_name_and_entry() {
        let mut image = program().image();
        image[12] = 0xFF;
        assert_eq!(
            Program::from_image(&image, 0),
            Err(FormatError::InvalidName { index: 0 })
        );
        assert!(matches!(
            Program::from_image(&program().image(), 400),
            Err(FormatError::EntryOutOfBounds { entry: 400, .. })
        ));
    }
}
