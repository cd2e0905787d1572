//! Object-graph encoding for managed and shared-managed component values.
//!
//! Values implement [`Persist`] and are written as little-endian binary through
//! an [`ObjectWriter`]. Three field kinds never hit the stream as raw values:
//! [`Entity`], [`BlobAssetReference`] and [`WeakAssetRef`]. Their encoding is
//! routed through a relocator so the caller decides how each is translated
//! (entity remap, blob offset, side-table index).

use std::{fmt, io};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::{blob::BlobAssetReference, entity::Entity};

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("entity references are not allowed in this value")]
    EntityNotAllowed,
    #[error("blob asset reference {0:#x} does not resolve to a live blob")]
    UnknownBlob(u64),
    #[error("blob offset {0} is outside the loaded blob batch")]
    BlobOffsetOutOfRange(i64),
    #[error("weak asset index {index} out of range ({len} referenced objects)")]
    WeakAssetOutOfRange { index: i32, len: usize },
    #[error("length {0} is negative or too large")]
    InvalidLength(i64),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid tag {tag} for {ty}")]
    InvalidTag { ty: &'static str, tag: u8 },
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

pub type ObjectResult<T> = Result<T, ObjectError>;

/// Reference to an asset that lives outside the world, resolved by the host.
///
/// Never stored in a file directly: capture collects every distinct
/// reference into a side table and writes its index instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Pod, Zeroable)]
#[repr(C)]
pub struct WeakAssetRef {
    pub lo: u64,
    pub hi: u64,
}

impl WeakAssetRef {
    pub const NULL: Self = Self { lo: 0, hi: 0 };

    #[must_use]
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.lo == 0 && self.hi == 0
    }
}

impl fmt::Debug for WeakAssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakAssetRef({:016x}{:016x})", self.hi, self.lo)
    }
}

/// Translates runtime-only values while writing.
pub trait WriteRelocator {
    /// Map a live entity to the entity written to the stream.
    fn entity(&mut self, entity: Entity) -> ObjectResult<Entity>;
    /// Map a live blob reference to a batch offset, or −1 for null.
    fn blob(&mut self, blob: BlobAssetReference) -> ObjectResult<i64>;
    /// Map a weak reference to a side-table slot; 0 is null.
    fn weak_asset(&mut self, asset: WeakAssetRef) -> ObjectResult<i32>;
}

/// Translates stream values back into runtime values while reading.
pub trait ReadRelocator {
    fn entity(&mut self, entity: Entity) -> ObjectResult<Entity>;
    fn blob(&mut self, offset: i64) -> ObjectResult<BlobAssetReference>;
    fn weak_asset(&mut self, index: i32) -> ObjectResult<WeakAssetRef>;
}

/// Binary writer for object graphs.
pub struct ObjectWriter<'a> {
    out: Vec<u8>,
    relocator: &'a mut dyn WriteRelocator,
    allow_entities: bool,
}

impl<'a> ObjectWriter<'a> {
    #[must_use]
    pub fn new(relocator: &'a mut dyn WriteRelocator) -> Self {
        Self {
            out: Vec::new(),
            relocator,
            allow_entities: true,
        }
    }

    /// Forbid entity fields; writing one fails with [`ObjectError::EntityNotAllowed`].
    #[must_use]
    pub fn with_entities_allowed(mut self, allowed: bool) -> Self {
        self.allow_entities = allowed;
        self
    }

    /// Write any persistable value.
    pub fn write<T: Persist + ?Sized>(&mut self, value: &T) -> ObjectResult<()> {
        value.write(self)
    }

    pub fn write_u8(&mut self, value: u8) -> ObjectResult<()> {
        self.out.write_u8(value)?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> ObjectResult<()> {
        self.out.write_u32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> ObjectResult<()> {
        self.out.write_i32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> ObjectResult<()> {
        self.out.write_u64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> ObjectResult<()> {
        self.out.write_i64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> ObjectResult<()> {
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a length prefix.
    pub fn write_len(&mut self, len: usize) -> ObjectResult<()> {
        let len = u32::try_from(len).map_err(|_| ObjectError::InvalidLength(len as i64))?;
        self.write_u32(len)
    }

    pub fn write_entity(&mut self, entity: Entity) -> ObjectResult<()> {
        if !self.allow_entities {
            return Err(ObjectError::EntityNotAllowed);
        }
        let mapped = self.relocator.entity(entity)?;
        self.write_u64(mapped.to_bits())
    }

    pub fn write_blob(&mut self, blob: BlobAssetReference) -> ObjectResult<()> {
        let offset = self.relocator.blob(blob)?;
        self.write_i64(offset)
    }

    pub fn write_weak_asset(&mut self, asset: WeakAssetRef) -> ObjectResult<()> {
        let index = self.relocator.weak_asset(asset)?;
        self.write_i32(index)
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

/// Binary reader for object graphs.
pub struct ObjectReader<'a> {
    input: &'a [u8],
    relocator: &'a mut dyn ReadRelocator,
}

impl<'a> ObjectReader<'a> {
    #[must_use]
    pub fn new(input: &'a [u8], relocator: &'a mut dyn ReadRelocator) -> Self {
        Self { input, relocator }
    }

    pub fn read<T: Persist>(&mut self) -> ObjectResult<T> {
        T::read(self)
    }

    pub fn read_u8(&mut self) -> ObjectResult<u8> {
        Ok(self.input.read_u8()?)
    }

    pub fn read_u32(&mut self) -> ObjectResult<u32> {
        Ok(self.input.read_u32::<LittleEndian>()?)
    }

    pub fn read_i32(&mut self) -> ObjectResult<i32> {
        Ok(self.input.read_i32::<LittleEndian>()?)
    }

    pub fn read_u64(&mut self) -> ObjectResult<u64> {
        Ok(self.input.read_u64::<LittleEndian>()?)
    }

    pub fn read_i64(&mut self) -> ObjectResult<i64> {
        Ok(self.input.read_i64::<LittleEndian>()?)
    }

    pub fn read_bytes(&mut self, len: usize) -> ObjectResult<&'a [u8]> {
        if len > self.input.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let (head, tail) = self.input.split_at(len);
        self.input = tail;
        Ok(head)
    }

    /// Read a length prefix, bounded by the remaining input.
    pub fn read_len(&mut self) -> ObjectResult<usize> {
        let len = self.read_u32()? as usize;
        if len > self.input.len() {
            return Err(ObjectError::InvalidLength(len as i64));
        }
        Ok(len)
    }

    pub fn read_entity(&mut self) -> ObjectResult<Entity> {
        let raw = Entity::from_bits(self.read_u64()?);
        self.relocator.entity(raw)
    }

    pub fn read_blob(&mut self) -> ObjectResult<BlobAssetReference> {
        let offset = self.read_i64()?;
        self.relocator.blob(offset)
    }

    pub fn read_weak_asset(&mut self) -> ObjectResult<WeakAssetRef> {
        let index = self.read_i32()?;
        self.relocator.weak_asset(index)
    }

    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    /// Fail if any input is left over.
    pub fn finish(self) -> ObjectResult<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(ObjectError::TrailingBytes(self.input.len()))
        }
    }
}

/// A value that can be written to and read from an object stream.
pub trait Persist: Sized {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()>;
    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self>;
}

macro_rules! persist_le {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Persist for $ty {
                fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
                    writer.out.$write::<LittleEndian>(*self)?;
                    Ok(())
                }

                fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
                    Ok(reader.input.$read::<LittleEndian>()?)
                }
            }
        )*
    };
}

persist_le! {
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl Persist for u8 {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_u8(*self)
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        reader.read_u8()
    }
}

impl Persist for i8 {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_u8(*self as u8)
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        Ok(reader.read_u8()? as i8)
    }
}

impl Persist for bool {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_u8(u8::from(*self))
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        match reader.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(ObjectError::InvalidTag { ty: "bool", tag }),
        }
    }
}

impl Persist for String {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_len(self.len())?;
        writer.write_bytes(self.as_bytes())
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        let len = reader.read_len()?;
        let bytes = reader.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl<T: Persist> Persist for Vec<T> {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_len(self.len())?;
        for item in self {
            item.write(writer)?;
        }
        Ok(())
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        let len = reader.read_len()?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::read(reader)?);
        }
        Ok(items)
    }
}

impl<T: Persist> Persist for Option<T> {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        match self {
            Some(value) => {
                writer.write_u8(1)?;
                value.write(writer)
            }
            None => writer.write_u8(0),
        }
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        match reader.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::read(reader)?)),
            tag => Err(ObjectError::InvalidTag { ty: "Option", tag }),
        }
    }
}

impl<A: Persist, B: Persist> Persist for (A, B) {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        self.0.write(writer)?;
        self.1.write(writer)
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        Ok((A::read(reader)?, B::read(reader)?))
    }
}

impl Persist for Entity {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_entity(*self)
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        reader.read_entity()
    }
}

impl Persist for BlobAssetReference {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_blob(*self)
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        reader.read_blob()
    }
}

impl Persist for WeakAssetRef {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        writer.write_weak_asset(*self)
    }

    fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
        reader.read_weak_asset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Remaps entity indices by +100 and records weak assets.
    #[derive(Default)]
    struct Recorder {
        weak: Vec<WeakAssetRef>,
    }

    impl WriteRelocator for Recorder {
        fn entity(&mut self, entity: Entity) -> ObjectResult<Entity> {
            Ok(Entity::new(entity.index() + 100, 1))
        }

        fn blob(&mut self, blob: BlobAssetReference) -> ObjectResult<i64> {
            Ok(if blob.is_null() { -1 } else { 32 })
        }

        fn weak_asset(&mut self, asset: WeakAssetRef) -> ObjectResult<i32> {
            self.weak.push(asset);
            Ok(self.weak.len() as i32)
        }
    }

    struct Loader {
        base: u64,
        weak: Vec<WeakAssetRef>,
    }

    impl ReadRelocator for Loader {
        fn entity(&mut self, entity: Entity) -> ObjectResult<Entity> {
            Ok(entity)
        }

        fn blob(&mut self, offset: i64) -> ObjectResult<BlobAssetReference> {
            Ok(if offset < 0 {
                BlobAssetReference::NULL
            } else {
                BlobAssetReference {
                    ptr: self.base + offset as u64 + 16,
                }
            })
        }

        fn weak_asset(&mut self, index: i32) -> ObjectResult<WeakAssetRef> {
            if index == 0 {
                return Ok(WeakAssetRef::NULL);
            }
            self.weak
                .get(index as usize - 1)
                .copied()
                .ok_or(ObjectError::WeakAssetOutOfRange {
                    index,
                    len: self.weak.len(),
                })
        }
    }

    #[test]
    fn test_special_fields_go_through_relocators() {
        let mut recorder = Recorder::default();
        let mut writer = ObjectWriter::new(&mut recorder);
        writer.write(&Entity::new(3, 7)).unwrap();
        writer.write(&BlobAssetReference { ptr: 0xdead }).unwrap();
        writer.write(&BlobAssetReference::NULL).unwrap();
        writer.write(&WeakAssetRef::new(5, 6)).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 8 + 8 + 8 + 4);

        let mut loader = Loader {
            base: 0x1000,
            weak: recorder.weak,
        };
        let mut reader = ObjectReader::new(&bytes, &mut loader);
        assert_eq!(reader.read::<Entity>().unwrap(), Entity::new(103, 1));
        assert_eq!(reader.read::<BlobAssetReference>().unwrap().ptr, 0x1000 + 32 + 16);
        assert!(reader.read::<BlobAssetReference>().unwrap().is_null());
        assert_eq!(reader.read::<WeakAssetRef>().unwrap(), WeakAssetRef::new(5, 6));
        reader.finish().unwrap();
    }

    #[test]
    fn test_entities_can_be_forbidden() {
        let mut relocator = Recorder::default();
        let mut writer = ObjectWriter::new(&mut relocator).with_entities_allowed(false);
        assert!(matches!(
            writer.write(&Entity::new(1, 1)),
            Err(ObjectError::EntityNotAllowed)
        ));
        writer.write(&5u32).unwrap();
    }

    #[test]
    fn test_collections() {
        let value = (
            vec![String::from("a"), String::from("bc")],
            Some(vec![1.5f32, -2.0]),
        );
        let mut relocator = Recorder::default();
        let mut writer = ObjectWriter::new(&mut relocator);
        writer.write(&value).unwrap();
        let bytes = writer.into_bytes();

        let mut loader = Loader {
            base: 0,
            weak: Vec::new(),
        };
        let mut reader = ObjectReader::new(&bytes, &mut loader);
        let back: (Vec<String>, Option<Vec<f32>>) = reader.read().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut loader = Loader {
            base: 0,
            weak: Vec::new(),
        };
        let mut reader = ObjectReader::new(&[5, 0, 0, 0, b'a'], &mut loader);
        assert!(reader.read::<String>().is_err());
    }
}
