//! Simple binary key/value store used to persist baker state between sessions.
//!
//! Keys are hashes of dotted path names (see [`string_hash`]). Numeric values occupy an 8-byte
//! slot with an explicit little-endian encoding per type, strings are stored separately.
//!
//! File layout, all integers little-endian:
//!
//! ```text
//! u64 value count
//! value count * (u64 key, u64 value)
//! u64 string count
//! string count * (u64 key, u64 byte length, UTF-8 bytes)
//! ```

use fxhash::FxHashMap;
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

/// Multiplicative string hash used for property keys.
pub fn string_hash(path: &str) -> u64 {
    path.bytes()
        .fold(0u64, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as u64))
}

/// A value that fits into the 8-byte slot of a property bag.
pub trait PropertyValue: Sized {
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_integer_property {
    ($($ty:ty),*) => {
        $(
            impl PropertyValue for $ty {
                fn to_bits(self) -> u64 {
                    self as i64 as u64
                }

                fn from_bits(bits: u64) -> Self {
                    bits as i64 as $ty
                }
            }
        )*
    };
}

impl_integer_property!(i8, i16, i32, i64, u8, u16, u32, u64);

impl PropertyValue for bool {
    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

impl PropertyValue for f32 {
    fn to_bits(self) -> u64 {
        f32::to_bits(self) as u64
    }

    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl PropertyValue for f64 {
    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyBag {
    values: FxHashMap<u64, u64>,
    strings: FxHashMap<u64, String>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: PropertyValue>(&self, path: &str) -> Option<T> {
        self.values.get(&string_hash(path)).map(|bits| T::from_bits(*bits))
    }

    pub fn get_or<T: PropertyValue>(&self, path: &str, default: T) -> T {
        self.get(path).unwrap_or(default)
    }

    pub fn set<T: PropertyValue>(&mut self, path: &str, value: T) {
        self.values.insert(string_hash(path), value.to_bits());
    }

    pub fn get_string(&self, path: &str) -> Option<&str> {
        self.strings.get(&string_hash(path)).map(|s| s.as_str())
    }

    pub fn set_string(&mut self, path: &str, value: impl Into<String>) {
        self.strings.insert(string_hash(path), value.into());
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // Sorted so that saving the same bag twice produces identical files.
        let mut values = self.values.iter().collect::<Vec<_>>();
        values.sort_unstable_by_key(|(key, _)| **key);
        writer.write_all(&(values.len() as u64).to_le_bytes())?;
        for (key, value) in values {
            writer.write_all(&key.to_le_bytes())?;
            writer.write_all(&value.to_le_bytes())?;
        }

        let mut strings = self.strings.iter().collect::<Vec<_>>();
        strings.sort_unstable_by_key(|(key, _)| **key);
        writer.write_all(&(strings.len() as u64).to_le_bytes())?;
        for (key, value) in strings {
            writer.write_all(&key.to_le_bytes())?;
            writer.write_all(&(value.len() as u64).to_le_bytes())?;
            writer.write_all(value.as_bytes())?;
        }
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut bag = Self::default();

        let count = read_u64(reader)?;
        for _ in 0..count {
            let key = read_u64(reader)?;
            let value = read_u64(reader)?;
            bag.values.insert(key, value);
        }

        let count = read_u64(reader)?;
        for _ in 0..count {
            let key = read_u64(reader)?;
            let len = read_u64(reader)?;
            let mut bytes = Vec::new();
            reader.by_ref().take(len).read_to_end(&mut bytes)?;
            if bytes.len() as u64 != len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated string in property bag",
                ));
            }
            let value = String::from_utf8(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            bag.strings.insert(key, value);
        }

        Ok(bag)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(&mut writer)?;
        writer.flush()
    }

    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read(&mut reader)
    }
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
