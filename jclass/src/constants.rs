//! The constant pool: decode, tag-checked access, extension with
//! de-duplication, in-place `MethodHandle` patching, and re-emission.
//!
//! [The Constant Pool](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=86)
//!
//! The pool keeps a single owned byte image: the original entries as they
//! appeared in the classfile, followed by every entry added after
//! [`ConstantPool::extend`]. Indices handed out by the `add_*` operations are
//! stable until [`ConstantPool::write_to`].

use fxhash::FxHashMap;

use crate::buffer::{ByteBuf, Reader};
use crate::errors::{ClassFileError, FormatCause, Result};
use crate::member::{MemberRef, RefKind};

pub const TAG_UTF8: u8 = 1;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_FLOAT: u8 = 4;
pub const TAG_LONG: u8 = 5;
pub const TAG_DOUBLE: u8 = 6;
pub const TAG_CLASS: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_FIELDREF: u8 = 9;
pub const TAG_METHODREF: u8 = 10;
pub const TAG_INTERFACE_METHODREF: u8 = 11;
pub const TAG_NAME_AND_TYPE: u8 = 12;
pub const TAG_METHOD_HANDLE: u8 = 15;
pub const TAG_METHOD_TYPE: u8 = 16;
pub const TAG_DYNAMIC: u8 = 17;
pub const TAG_INVOKE_DYNAMIC: u8 = 18;
pub const TAG_MODULE: u8 = 19;
pub const TAG_PACKAGE: u8 = 20;

/// One decoded constant. `Utf8` points into the pool image rather than
/// owning its bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    Utf8 { pos: u32, len: u16 },
    Integer { bytes: u32 },
    Float { bytes: u32 },
    Long { high: u32, low: u32 },
    Double { high: u32, low: u32 },
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

/// Structural identity used by the dedup map: tag plus referenced
/// sub-indices, UTF-8 by its bytes. Only the kinds the `add_*` operations
/// can produce are keyed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PoolKey {
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    Str(u16),
    NameAndType(u16, u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
}

pub struct ConstantPool {
    /// `constant_pool_count`: live entries plus one, wide entries counting
    /// two. Grows as entries are added.
    count: u16,
    /// Original image followed by added entries.
    data: ByteBuf,
    image_len: usize,
    /// Entry index to offset of its tag byte within `data`; `u32::MAX` for
    /// index 0 and the second halves of wide entries.
    offsets: Vec<u32>,
    entries: Vec<Option<Entry>>,
    /// Built on first `add_*`; maps structural identity to index.
    dedup: Option<FxHashMap<PoolKey, u16>>,
    /// Indices of `MethodHandle` entries, in pool order.
    method_handles: Vec<u16>,
    name_seed: u32,
}

impl ConstantPool {
    /// Decode `constant_pool_count` and every entry, verifying tags and
    /// recording the byte offset of each entry.
    pub fn decode(reader: &mut Reader) -> Result<ConstantPool> {
        let count = reader.read_u2()?;
        if count == 0 {
            return Err(FormatCause::InvalidIndex(0).into());
        }
        let start = reader.position();
        let mut offsets = vec![u32::MAX; count as usize];
        let mut entries: Vec<Option<Entry>> = vec![None; count as usize];
        let mut method_handles = Vec::new();
        let mut i: u32 = 1;
        while i < count as u32 {
            let offset = (reader.position() - start) as u32;
            let tag = reader.read_u1()?;
            let mut wide = false;
            let entry = match tag {
                TAG_UTF8 => {
                    let len = reader.read_u2()?;
                    let pos = (reader.position() - start) as u32;
                    reader.skip(len as usize)?;
                    Entry::Utf8 { pos, len }
                }
                TAG_INTEGER => Entry::Integer { bytes: reader.read_u4()? },
                TAG_FLOAT => Entry::Float { bytes: reader.read_u4()? },
                TAG_LONG => {
                    wide = true;
                    Entry::Long { high: reader.read_u4()?, low: reader.read_u4()? }
                }
                TAG_DOUBLE => {
                    wide = true;
                    Entry::Double { high: reader.read_u4()?, low: reader.read_u4()? }
                }
                TAG_CLASS => Entry::Class { name_index: reader.read_u2()? },
                TAG_STRING => Entry::String { string_index: reader.read_u2()? },
                TAG_FIELDREF => Entry::FieldRef {
                    class_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                TAG_METHODREF => Entry::MethodRef {
                    class_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                TAG_INTERFACE_METHODREF => Entry::InterfaceMethodRef {
                    class_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                TAG_NAME_AND_TYPE => Entry::NameAndType {
                    name_index: reader.read_u2()?,
                    descriptor_index: reader.read_u2()?,
                },
                TAG_METHOD_HANDLE => {
                    let kind = reader.read_u1()?;
                    if !(1..=9).contains(&kind) {
                        return Err(FormatCause::InvalidReferenceKind(kind).into());
                    }
                    method_handles.push(i as u16);
                    Entry::MethodHandle { kind, reference_index: reader.read_u2()? }
                }
                TAG_METHOD_TYPE => Entry::MethodType { descriptor_index: reader.read_u2()? },
                TAG_DYNAMIC => Entry::Dynamic {
                    bootstrap_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                TAG_INVOKE_DYNAMIC => Entry::InvokeDynamic {
                    bootstrap_index: reader.read_u2()?,
                    name_and_type_index: reader.read_u2()?,
                },
                TAG_MODULE => Entry::Module { name_index: reader.read_u2()? },
                TAG_PACKAGE => Entry::Package { name_index: reader.read_u2()? },
                _ => return Err(FormatCause::InvalidTag { tag, index: i as u16 }.into()),
            };
            offsets[i as usize] = offset;
            entries[i as usize] = Some(entry);
            i += if wide { 2 } else { 1 };
        }
        if i != count as u32 {
            // A wide entry claimed the slot past the declared count.
            return Err(FormatCause::InvalidIndex(count).into());
        }
        let image = &reader.as_bytes()[start..reader.position()];
        let image_len = image.len();
        Ok(ConstantPool {
            count,
            data: ByteBuf::from(image.to_vec()),
            image_len,
            offsets,
            entries,
            dedup: None,
            method_handles,
            name_seed: (image_len as u32).wrapping_mul(0x9E37_79B9) | 1,
        })
    }

    /// Current `constant_pool_count`, added entries included.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Byte length of the original pool image within the classfile.
    pub fn image_len(&self) -> usize {
        self.image_len
    }

    /// Byte delta against the original pool.
    pub fn growth(&self) -> usize {
        self.data.len() - self.image_len
    }

    pub fn method_handles(&self) -> &[u16] {
        &self.method_handles
    }

    pub fn entry(&self, i: u16) -> Result<Entry> {
        self.entries
            .get(i as usize)
            .copied()
            .flatten()
            .ok_or_else(|| FormatCause::InvalidIndex(i).into())
    }

    pub fn utf8(&self, i: u16) -> Result<&[u8]> {
        match self.entry(i)? {
            Entry::Utf8 { pos, len } => {
                Ok(&self.data.as_slice()[pos as usize..pos as usize + len as usize])
            }
            _ => Err(FormatCause::WrongTag { index: i, expected: "Utf8" }.into()),
        }
    }

    /// Name of the class constant at `i`.
    pub fn class_name(&self, i: u16) -> Result<&[u8]> {
        match self.entry(i)? {
            Entry::Class { name_index } => self.utf8(name_index),
            _ => Err(FormatCause::WrongTag { index: i, expected: "Class" }.into()),
        }
    }

    pub fn name_and_type(&self, i: u16) -> Result<(u16, u16)> {
        match self.entry(i)? {
            Entry::NameAndType { name_index, descriptor_index } => {
                Ok((name_index, descriptor_index))
            }
            _ => Err(FormatCause::WrongTag { index: i, expected: "NameAndType" }.into()),
        }
    }

    /// `(class_index, name_and_type_index, is_interface)` of a field, method
    /// or interface-method reference.
    pub fn member_entry(&self, i: u16) -> Result<(u16, u16, bool)> {
        match self.entry(i)? {
            Entry::FieldRef { class_index, name_and_type_index }
            | Entry::MethodRef { class_index, name_and_type_index } => {
                Ok((class_index, name_and_type_index, false))
            }
            Entry::InterfaceMethodRef { class_index, name_and_type_index } => {
                Ok((class_index, name_and_type_index, true))
            }
            _ => Err(FormatCause::WrongTag { index: i, expected: "member reference" }.into()),
        }
    }

    /// Resolve a member-reference constant into a zero-copy view.
    pub fn member_ref(&self, i: u16) -> Result<MemberRef<'_>> {
        let (class_index, nat_index, interface) = self.member_entry(i)?;
        let owner = self.class_name(class_index)?;
        let (name_index, descriptor_index) = self.name_and_type(nat_index)?;
        let name = self.utf8(name_index)?;
        let descriptor = self.utf8(descriptor_index)?;
        Ok(MemberRef::new(owner, name, descriptor, interface))
    }

    pub fn method_handle(&self, i: u16) -> Result<(u8, u16)> {
        match self.entry(i)? {
            Entry::MethodHandle { kind, reference_index } => Ok((kind, reference_index)),
            _ => Err(FormatCause::WrongTag { index: i, expected: "MethodHandle" }.into()),
        }
    }

    /// Rewrite a `MethodHandle` entry in place; the entry width never
    /// changes, so no offsets move.
    pub fn patch_method_handle(&mut self, i: u16, kind: u8, reference_index: u16) -> Result<()> {
        self.method_handle(i)?;
        let offset = self.offsets[i as usize] as usize;
        self.data.patch_u1_at(offset + 1, kind);
        self.data.patch_u2_at(offset + 2, reference_index);
        self.entries[i as usize] = Some(Entry::MethodHandle { kind, reference_index });
        Ok(())
    }

    /// Snapshot the pool for de-duplicated extension. Implicit in the
    /// first `add_*`; calling it up front just moves the cost.
    pub fn extend(&mut self) {
        self.ensure_extended();
    }

    /// Snapshot existing entries into the structural-identity map. Called
    /// implicitly by the first `add_*`.
    fn ensure_extended(&mut self) {
        if self.dedup.is_some() {
            return;
        }
        let mut map = FxHashMap::default();
        for i in 1..self.count {
            let Some(entry) = self.entries[i as usize] else { continue };
            let key = match entry {
                Entry::Utf8 { pos, len } => PoolKey::Utf8(
                    self.data.as_slice()[pos as usize..pos as usize + len as usize].to_vec(),
                ),
                Entry::Integer { bytes } => PoolKey::Integer(bytes),
                Entry::Float { bytes } => PoolKey::Float(bytes),
                Entry::Long { high, low } => PoolKey::Long(((high as u64) << 32) | low as u64),
                Entry::Double { high, low } => PoolKey::Double(((high as u64) << 32) | low as u64),
                Entry::Class { name_index } => PoolKey::Class(name_index),
                Entry::String { string_index } => PoolKey::Str(string_index),
                Entry::NameAndType { name_index, descriptor_index } => {
                    PoolKey::NameAndType(name_index, descriptor_index)
                }
                Entry::FieldRef { class_index, name_and_type_index } => {
                    PoolKey::FieldRef(class_index, name_and_type_index)
                }
                Entry::MethodRef { class_index, name_and_type_index } => {
                    PoolKey::MethodRef(class_index, name_and_type_index)
                }
                Entry::InterfaceMethodRef { class_index, name_and_type_index } => {
                    PoolKey::InterfaceMethodRef(class_index, name_and_type_index)
                }
                Entry::MethodHandle { kind, reference_index } => {
                    PoolKey::MethodHandle(kind, reference_index)
                }
                Entry::MethodType { descriptor_index } => PoolKey::MethodType(descriptor_index),
                // Never produced by add_*; no need to key them.
                Entry::Dynamic { .. }
                | Entry::InvokeDynamic { .. }
                | Entry::Module { .. }
                | Entry::Package { .. } => continue,
            };
            map.entry(key).or_insert(i);
        }
        self.dedup = Some(map);
    }

    fn push(&mut self, key: PoolKey, entry: Entry, bytes: &[u8], wide: bool) -> Result<u16> {
        self.ensure_extended();
        let map = self.dedup.as_mut().expect("extended above");
        if let Some(&existing) = map.get(&key) {
            return Ok(existing);
        }
        let width: u32 = if wide { 2 } else { 1 };
        let new_count = self.count as u32 + width;
        if new_count > 65535 {
            return Err(ClassFileError::TooLarge("constant pool"));
        }
        let index = self.count;
        self.offsets.push(self.data.len() as u32);
        self.entries.push(Some(entry));
        if wide {
            self.offsets.push(u32::MAX);
            self.entries.push(None);
        }
        self.data.write_slice(bytes);
        self.count = new_count as u16;
        self.dedup.as_mut().expect("extended above").insert(key, index);
        Ok(index)
    }

    pub fn add_utf8(&mut self, s: &[u8]) -> Result<u16> {
        if s.len() > 0xFFFF {
            return Err(ClassFileError::TooLarge("UTF-8 constant"));
        }
        let mut bytes = Vec::with_capacity(3 + s.len());
        bytes.push(TAG_UTF8);
        bytes.extend_from_slice(&(s.len() as u16).to_be_bytes());
        bytes.extend_from_slice(s);
        let pos = self.data.len() as u32 + 3;
        self.push(
            PoolKey::Utf8(s.to_vec()),
            Entry::Utf8 { pos, len: s.len() as u16 },
            &bytes,
            false,
        )
    }

    pub fn add_class(&mut self, name: &[u8]) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let bytes = [TAG_CLASS, (name_index >> 8) as u8, name_index as u8];
        self.push(PoolKey::Class(name_index), Entry::Class { name_index }, &bytes, false)
    }

    pub fn add_string(&mut self, string_index: u16) -> Result<u16> {
        let bytes = [TAG_STRING, (string_index >> 8) as u8, string_index as u8];
        self.push(PoolKey::Str(string_index), Entry::String { string_index }, &bytes, false)
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16> {
        let raw = value as u32;
        let mut bytes = vec![TAG_INTEGER];
        bytes.extend_from_slice(&raw.to_be_bytes());
        self.push(PoolKey::Integer(raw), Entry::Integer { bytes: raw }, &bytes, false)
    }

    pub fn add_float(&mut self, value: f32) -> Result<u16> {
        let raw = value.to_bits();
        let mut bytes = vec![TAG_FLOAT];
        bytes.extend_from_slice(&raw.to_be_bytes());
        self.push(PoolKey::Float(raw), Entry::Float { bytes: raw }, &bytes, false)
    }

    pub fn add_long(&mut self, value: i64) -> Result<u16> {
        let raw = value as u64;
        let mut bytes = vec![TAG_LONG];
        bytes.extend_from_slice(&raw.to_be_bytes());
        let (high, low) = ((raw >> 32) as u32, raw as u32);
        self.push(PoolKey::Long(raw), Entry::Long { high, low }, &bytes, true)
    }

    pub fn add_double(&mut self, value: f64) -> Result<u16> {
        let raw = value.to_bits();
        let mut bytes = vec![TAG_DOUBLE];
        bytes.extend_from_slice(&raw.to_be_bytes());
        let (high, low) = ((raw >> 32) as u32, raw as u32);
        self.push(PoolKey::Double(raw), Entry::Double { high, low }, &bytes, true)
    }

    pub fn add_name_and_type(&mut self, name: &[u8], descriptor: &[u8]) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add_name_and_type_indices(name_index, descriptor_index)
    }

    pub fn add_name_and_type_indices(
        &mut self,
        name_index: u16,
        descriptor_index: u16,
    ) -> Result<u16> {
        let mut bytes = vec![TAG_NAME_AND_TYPE];
        bytes.extend_from_slice(&name_index.to_be_bytes());
        bytes.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push(
            PoolKey::NameAndType(name_index, descriptor_index),
            Entry::NameAndType { name_index, descriptor_index },
            &bytes,
            false,
        )
    }

    pub fn add_field_ref(&mut self, owner: &[u8], name: &[u8], descriptor: &[u8]) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let nat = self.add_name_and_type(name, descriptor)?;
        self.add_ref_indices(TAG_FIELDREF, class_index, nat)
    }

    pub fn add_method_ref(&mut self, owner: &[u8], name: &[u8], descriptor: &[u8]) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let nat = self.add_name_and_type(name, descriptor)?;
        self.add_ref_indices(TAG_METHODREF, class_index, nat)
    }

    pub fn add_interface_method_ref(
        &mut self,
        owner: &[u8],
        name: &[u8],
        descriptor: &[u8],
    ) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let nat = self.add_name_and_type(name, descriptor)?;
        self.add_ref_indices(TAG_INTERFACE_METHODREF, class_index, nat)
    }

    /// Member reference from already-interned `Class` and `NameAndType`
    /// entries.
    pub fn add_ref_indices(&mut self, tag: u8, class_index: u16, nat_index: u16) -> Result<u16> {
        let mut bytes = vec![tag];
        bytes.extend_from_slice(&class_index.to_be_bytes());
        bytes.extend_from_slice(&nat_index.to_be_bytes());
        let (key, entry) = match tag {
            TAG_FIELDREF => (
                PoolKey::FieldRef(class_index, nat_index),
                Entry::FieldRef { class_index, name_and_type_index: nat_index },
            ),
            TAG_METHODREF => (
                PoolKey::MethodRef(class_index, nat_index),
                Entry::MethodRef { class_index, name_and_type_index: nat_index },
            ),
            TAG_INTERFACE_METHODREF => (
                PoolKey::InterfaceMethodRef(class_index, nat_index),
                Entry::InterfaceMethodRef { class_index, name_and_type_index: nat_index },
            ),
            _ => return Err(FormatCause::InvalidTag { tag, index: self.count }.into()),
        };
        self.push(key, entry, &bytes, false)
    }

    /// Intern the descriptor that models `member` invoked through `kind` as
    /// if it were a static call (receiver lifted into the parameter list).
    pub fn add_with_static_signature(&mut self, kind: RefKind, member: &MemberRef) -> Result<u16> {
        let descriptor = member.static_descriptor(kind)?;
        self.add_utf8(&descriptor)
    }

    /// A `MethodRef` on `owner_class_index` with a freshly invented name:
    /// `$` followed by pseudo-random decimal digits, never colliding with an
    /// existing UTF-8 constant. Returns `(method_ref_index, name_index)`.
    pub fn add_unique_method(
        &mut self,
        owner_class_index: u16,
        descriptor_index: u16,
    ) -> Result<(u16, u16)> {
        self.ensure_extended();
        let mut digits = 1usize;
        let name = loop {
            let mut name = Vec::with_capacity(1 + digits);
            name.push(b'$');
            for _ in 0..digits {
                name.push(b'0' + (self.next_rand() % 10) as u8);
            }
            let taken = self
                .dedup
                .as_ref()
                .expect("extended above")
                .contains_key(&PoolKey::Utf8(name.clone()));
            if !taken {
                break name;
            }
            if digits < 9 {
                digits += 1;
            }
        };
        let name_index = self.add_utf8(&name)?;
        let nat = self.add_name_and_type_indices(name_index, descriptor_index)?;
        let ref_index = self.add_ref_indices(TAG_METHODREF, owner_class_index, nat)?;
        Ok((ref_index, name_index))
    }

    fn next_rand(&mut self) -> u32 {
        let mut x = self.name_seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.name_seed = x;
        x
    }

    /// Emit the adjusted count followed by the original image and every
    /// added entry, in allocation order.
    pub fn write_to(&self, out: &mut ByteBuf) {
        out.write_u2(self.count);
        out.write_slice(self.data.as_slice());
    }
}
