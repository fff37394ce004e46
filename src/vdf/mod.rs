//! Binary reader/writer for Steam's `shortcuts.vdf`.
//!
//! The format has no length prefixes, so every tag byte is checked and a
//! mismatch aborts the read instead of guessing.

use std::path::Path;

use crate::error::VdfError;

pub const START_OF_SET: u8 = 0x00;
pub const START_OF_HEADER: u8 = 0x01;
pub const START_OF_TEXT: u8 = 0x02;
pub const END_OF_SET: u8 = 0x08;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VdfEntry {
    Header { name: String, value: String },
    /// Named value followed by exactly four raw bytes.
    Text { name: String, data: [u8; 4] },
    Set { name: String, values: Vec<(String, String)> },
}

impl VdfEntry {
    pub fn header(name: &str, value: impl Into<String>) -> Self {
        Self::Header {
            name: name.to_owned(),
            value: value.into(),
        }
    }

    pub fn text(name: &str, data: [u8; 4]) -> Self {
        Self::Text {
            name: name.to_owned(),
            data,
        }
    }

    pub fn zeroed_text(name: &str) -> Self {
        Self::text(name, [0; 4])
    }

    pub fn set(name: &str) -> Self {
        Self::Set {
            name: name.to_owned(),
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Header { name, .. } | Self::Text { name, .. } | Self::Set { name, .. } => name,
        }
    }
}

/// Entries of a single shortcut.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VdfEntryList(pub Vec<VdfEntry>);

impl VdfEntryList {
    pub fn try_get_header(&self, name: &str) -> Option<&str> {
        self.0.iter().find_map(|entry| match entry {
            VdfEntry::Header { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn push(&mut self, entry: VdfEntry) {
        self.0.push(entry);
    }
}

impl FromIterator<VdfEntry> for VdfEntryList {
    fn from_iter<I: IntoIterator<Item = VdfEntry>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortcutsFile {
    pub name: String,
    pub values: Vec<(String, VdfEntryList)>,
}

impl ShortcutsFile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            values: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let bytes =
            std::fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        Self::parse(&bytes).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    pub fn write_file(&self, path: &Path) -> Result<(), String> {
        std::fs::write(path, self.to_bytes())
            .map_err(|e| format!("failed to write {}: {e}", path.display()))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, VdfError> {
        let mut reader = Reader { bytes, offset: 0 };
        reader.expect(START_OF_SET)?;
        let mut file = Self::new(&reader.string()?);

        loop {
            match reader.byte()? {
                START_OF_SET => {}
                END_OF_SET => break,
                found => {
                    return Err(VdfError::UnexpectedByte {
                        offset: reader.offset - 1,
                        expected: END_OF_SET,
                        found,
                    });
                }
            }
            let key = reader.string()?;
            let mut entries = VdfEntryList::default();
            loop {
                let offset = reader.offset;
                match reader.byte()? {
                    START_OF_HEADER => {
                        let name = reader.string()?;
                        let value = reader.string()?;
                        entries.push(VdfEntry::Header { name, value });
                    }
                    START_OF_TEXT => {
                        let name = reader.string()?;
                        let data = reader.four()?;
                        entries.push(VdfEntry::Text { name, data });
                    }
                    START_OF_SET => {
                        let name = reader.string()?;
                        let mut values = Vec::new();
                        loop {
                            match reader.byte()? {
                                START_OF_HEADER => {
                                    let k = reader.string()?;
                                    let v = reader.string()?;
                                    values.push((k, v));
                                }
                                END_OF_SET => break,
                                found => {
                                    return Err(VdfError::UnexpectedByte {
                                        offset: reader.offset - 1,
                                        expected: END_OF_SET,
                                        found,
                                    });
                                }
                            }
                        }
                        entries.push(VdfEntry::Set { name, values });
                    }
                    END_OF_SET => break,
                    tag => return Err(VdfError::UnknownTag { offset, tag }),
                }
            }
            file.values.push((key, entries));
        }

        // Steam writes one more end-of-set byte than the structure needs.
        reader.expect(END_OF_SET)?;
        Ok(file)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![START_OF_SET];
        write_string(&mut out, &self.name);
        for (key, entries) in &self.values {
            out.push(START_OF_SET);
            write_string(&mut out, key);
            for entry in &entries.0 {
                match entry {
                    VdfEntry::Header { name, value } => {
                        out.push(START_OF_HEADER);
                        write_string(&mut out, name);
                        write_string(&mut out, value);
                    }
                    VdfEntry::Text { name, data } => {
                        out.push(START_OF_TEXT);
                        write_string(&mut out, name);
                        out.extend_from_slice(data);
                    }
                    VdfEntry::Set { name, values } => {
                        out.push(START_OF_SET);
                        write_string(&mut out, name);
                        for (k, v) in values {
                            out.push(START_OF_HEADER);
                            write_string(&mut out, k);
                            write_string(&mut out, v);
                        }
                        out.push(END_OF_SET);
                    }
                }
            }
            out.push(END_OF_SET);
        }
        out.push(END_OF_SET);
        out.push(END_OF_SET);
        out
    }

    /// Append a shortcut under the next free numeric key.
    ///
    /// Keys that are not numbers are ignored when picking the next key.
    pub fn add_entry(&mut self, entries: VdfEntryList) -> String {
        let used: Vec<u32> = self
            .values
            .iter()
            .filter_map(|(key, _)| key.parse::<u32>().ok())
            .collect();
        let max = used.iter().copied().max().unwrap_or(0);
        // At the top of the range, reuse the lowest free key instead.
        let next = max
            .checked_add(1)
            .unwrap_or_else(|| (0..).find(|key| !used.contains(key)).unwrap_or(0));
        let key = next.to_string();
        self.values.push((key.clone(), entries));
        key
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8, VdfError> {
        let byte = *self
            .bytes
            .get(self.offset)
            .ok_or(VdfError::UnexpectedEof(self.offset))?;
        self.offset += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), VdfError> {
        let offset = self.offset;
        let found = self.byte()?;
        if found != expected {
            return Err(VdfError::UnexpectedByte {
                offset,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn four(&mut self) -> Result<[u8; 4], VdfError> {
        let end = self.offset + 4;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(VdfError::UnexpectedEof(self.bytes.len()))?;
        let mut data = [0; 4];
        data.copy_from_slice(slice);
        self.offset = end;
        Ok(data)
    }

    fn string(&mut self) -> Result<String, VdfError> {
        let start = self.offset;
        let rest = self.bytes.get(start..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(VdfError::UnexpectedEof(self.bytes.len()))?;
        let value = std::str::from_utf8(&rest[..len])
            .map_err(|_| VdfError::InvalidString(start))?
            .to_owned();
        self.offset = start + len + 1;
        Ok(value)
    }
}
