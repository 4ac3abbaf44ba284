use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// One primitive component of a [`Key`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub enum KeyPart {
    Int(i64),
    UInt(u64),
    Str(String),
    Bytes(Vec<u8>),
}

macro_rules! impl_part_from {
    ($variant:ident as $target:ty: $($source:ty),*) => {
        $(
            impl From<$source> for KeyPart {
                fn from(value: $source) -> Self {
                    KeyPart::$variant(value as $target)
                }
            }
        )*
    };
}

impl_part_from!(Int as i64: i8, i16, i32, i64, isize);
impl_part_from!(UInt as u64: u8, u16, u32, u64, usize);

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Str(value.clone())
    }
}

impl From<&[u8]> for KeyPart {
    fn from(value: &[u8]) -> Self {
        KeyPart::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(value: Vec<u8>) -> Self {
        KeyPart::Bytes(value)
    }
}

impl<const N: usize> From<[u8; N]> for KeyPart {
    fn from(value: [u8; N]) -> Self {
        KeyPart::Bytes(value.to_vec())
    }
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(value) => write!(f, "{value}"),
            KeyPart::UInt(value) => write!(f, "{value}"),
            KeyPart::Str(value) => f.write_str(value),
            KeyPart::Bytes(value) => write!(f, "0x{}", crate::utils::hex(value)),
        }
    }
}

/// The name of a piece of data, independent of its version.
///
/// A key is an ordered sequence of primitive parts. Two keys are equal if and
/// only if their parts are equal, so the same sequence always names the same
/// data on every rank. Integer parts remember their signedness: `3i32` and
/// `3u32` produce different keys.
///
/// ```rust
/// use nagare::make_key;
///
/// let rank = 2;
/// let a = make_key!("temperature", rank);
/// let b = make_key!("temperature", 2);
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "temperature:2");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Key {
    parts: Vec<KeyPart>,
}

impl Key {
    pub fn from_parts<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = KeyPart>,
    {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns a new key with `part` appended.
    pub fn with(&self, part: impl Into<KeyPart>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(part.into());
        Self { parts }
    }

    /// Encodes the key as CBOR, the form transports use on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)?;
        Ok(buffer)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }

    /// BLAKE3 fingerprint of the wire form.
    pub fn digest(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        for part in &self.parts {
            // Tag every part so that ("ab", "c") and ("a", "bc") differ.
            match part {
                KeyPart::Int(value) => {
                    hasher.update(&[0]);
                    hasher.update(&value.to_le_bytes());
                }
                KeyPart::UInt(value) => {
                    hasher.update(&[1]);
                    hasher.update(&value.to_le_bytes());
                }
                KeyPart::Str(value) => {
                    hasher.update(&[2]);
                    hasher.update(&(value.len() as u64).to_le_bytes());
                    hasher.update(value.as_bytes());
                }
                KeyPart::Bytes(value) => {
                    hasher.update(&[3]);
                    hasher.update(&(value.len() as u64).to_le_bytes());
                    hasher.update(value);
                }
            }
        }
        hasher.finalize().into()
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl From<KeyPart> for Key {
    fn from(value: KeyPart) -> Self {
        Key { parts: vec![value] }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::from(KeyPart::from(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::from(KeyPart::from(value))
    }
}

/// Builds a [`Key`] from any number of primitive parts.
#[macro_export]
macro_rules! make_key {
    ($($part:expr),* $(,)?) => {
        $crate::Key::from_parts([$($crate::KeyPart::from($part)),*])
    };
}

/// Identifies one version of a key.
///
/// Versions created by the engine are `Auto` counters. Publish and fetch may
/// name a version explicitly, either with a number or with a key. Every `Auto`
/// tag sorts before every `Named` tag.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub enum VersionTag {
    Auto(u64),
    Named(Key),
}

impl VersionTag {
    /// The tag used by publish and fetch when no version is given.
    pub fn unversioned() -> Self {
        VersionTag::Named(Key::default())
    }
}

impl Default for VersionTag {
    fn default() -> Self {
        Self::unversioned()
    }
}

impl Display for VersionTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VersionTag::Auto(counter) => write!(f, "#{counter}"),
            VersionTag::Named(key) if key.is_empty() => f.write_str("unversioned"),
            VersionTag::Named(key) => write!(f, "'{key}'"),
        }
    }
}

impl From<u64> for VersionTag {
    fn from(value: u64) -> Self {
        VersionTag::Auto(value)
    }
}

impl From<u32> for VersionTag {
    fn from(value: u32) -> Self {
        VersionTag::Auto(value as u64)
    }
}

impl From<usize> for VersionTag {
    fn from(value: usize) -> Self {
        VersionTag::Auto(value as u64)
    }
}

impl From<Key> for VersionTag {
    fn from(value: Key) -> Self {
        VersionTag::Named(value)
    }
}

impl From<&str> for VersionTag {
    fn from(value: &str) -> Self {
        VersionTag::Named(Key::from(value))
    }
}

impl From<String> for VersionTag {
    fn from(value: String) -> Self {
        VersionTag::Named(Key::from(value))
    }
}
