//! Member references.
//!
//! A [`MemberRef`] is a zero-copy view over the `(owner class, name,
//! descriptor)` triple of one member reference, borrowed from the pool
//! image. It knows how to slice the owner into package and plain class, how
//! to flatten itself into a cache key, and how to derive the static-shape
//! descriptor for any invocation or field-access kind.

use std::hash::Hasher;

use fxhash::FxHasher64;

use crate::descriptors;
use crate::errors::{ClassFileError, FormatCause, Result};
use crate::opcodes;

/// [Method handle bytecode behaviors](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=360)
///
/// Doubles as the operation selector for proxy synthesis: the four invoke
/// opcodes map onto their handle kinds.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    GetField = 1,
    GetStatic = 2,
    PutField = 3,
    PutStatic = 4,
    InvokeVirtual = 5,
    InvokeStatic = 6,
    InvokeSpecial = 7,
    NewInvokeSpecial = 8,
    InvokeInterface = 9,
}

impl RefKind {
    pub fn from_u8(kind: u8) -> Result<RefKind> {
        Ok(match kind {
            1 => RefKind::GetField,
            2 => RefKind::GetStatic,
            3 => RefKind::PutField,
            4 => RefKind::PutStatic,
            5 => RefKind::InvokeVirtual,
            6 => RefKind::InvokeStatic,
            7 => RefKind::InvokeSpecial,
            8 => RefKind::NewInvokeSpecial,
            9 => RefKind::InvokeInterface,
            _ => return Err(FormatCause::InvalidReferenceKind(kind).into()),
        })
    }

    pub fn from_invoke_op(op: u8) -> Option<RefKind> {
        match op {
            opcodes::INVOKEVIRTUAL => Some(RefKind::InvokeVirtual),
            opcodes::INVOKESPECIAL => Some(RefKind::InvokeSpecial),
            opcodes::INVOKESTATIC => Some(RefKind::InvokeStatic),
            opcodes::INVOKEINTERFACE => Some(RefKind::InvokeInterface),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The opcode that performs this operation directly.
    pub fn opcode(self) -> u8 {
        match self {
            RefKind::GetField => opcodes::GETFIELD,
            RefKind::GetStatic => opcodes::GETSTATIC,
            RefKind::PutField => opcodes::PUTFIELD,
            RefKind::PutStatic => opcodes::PUTSTATIC,
            RefKind::InvokeVirtual => opcodes::INVOKEVIRTUAL,
            RefKind::InvokeStatic => opcodes::INVOKESTATIC,
            RefKind::InvokeSpecial | RefKind::NewInvokeSpecial => opcodes::INVOKESPECIAL,
            RefKind::InvokeInterface => opcodes::INVOKEINTERFACE,
        }
    }

    pub fn is_field_access(self) -> bool {
        matches!(
            self,
            RefKind::GetField | RefKind::GetStatic | RefKind::PutField | RefKind::PutStatic
        )
    }

    /// Whether the operation takes no receiver.
    pub fn is_static_shape(self) -> bool {
        matches!(
            self,
            RefKind::GetStatic | RefKind::PutStatic | RefKind::InvokeStatic
                | RefKind::NewInvokeSpecial
        )
    }
}

/// Zero-copy `(owner class, name, descriptor)` view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberRef<'a> {
    owner: &'a [u8],
    name: &'a [u8],
    descriptor: &'a [u8],
    interface: bool,
}

impl<'a> MemberRef<'a> {
    pub fn new(owner: &'a [u8], name: &'a [u8], descriptor: &'a [u8], interface: bool) -> Self {
        MemberRef { owner, name, descriptor, interface }
    }

    /// Binary name of the owner in internal form, e.g. `java/lang/System`.
    pub fn owner_class(&self) -> &'a [u8] {
        self.owner
    }

    pub fn name(&self) -> &'a [u8] {
        self.name
    }

    pub fn descriptor(&self) -> &'a [u8] {
        self.descriptor
    }

    /// Whether the reference came from an `InterfaceMethodref` constant.
    pub fn is_interface(&self) -> bool {
        self.interface
    }

    /// Owner package: everything before the last `/`, empty for the unnamed
    /// package.
    pub fn package(&self) -> &'a [u8] {
        match self.owner.iter().rposition(|&b| b == b'/') {
            Some(slash) => &self.owner[..slash],
            None => &[],
        }
    }

    /// Owner class without its package prefix.
    pub fn plain_class(&self) -> &'a [u8] {
        match self.owner.iter().rposition(|&b| b == b'/') {
            Some(slash) => &self.owner[slash + 1..],
            None => self.owner,
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == b"<init>"
    }

    /// Flatten into a single key: `class;name;descriptor`.
    pub fn encode_full(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.owner.len() + self.name.len() + self.descriptor.len() + 2);
        key.extend_from_slice(self.owner);
        key.push(b';');
        key.extend_from_slice(self.name);
        key.push(b';');
        key.extend_from_slice(self.descriptor);
        key
    }

    /// Compare against an [`encode_full`](Self::encode_full) key without
    /// allocating.
    pub fn equals_full(&self, key: &[u8]) -> bool {
        let total = self.owner.len() + self.name.len() + self.descriptor.len() + 2;
        if key.len() != total {
            return false;
        }
        let (a, rest) = key.split_at(self.owner.len());
        if a != self.owner || rest[0] != b';' {
            return false;
        }
        let (b, rest) = rest[1..].split_at(self.name.len());
        b == self.name && rest[0] == b';' && &rest[1..] == self.descriptor
    }

    pub fn full_hash(&self) -> u64 {
        let mut hasher = FxHasher64::default();
        hasher.write(self.owner);
        hasher.write(&[b';']);
        hasher.write(self.name);
        hasher.write(&[b';']);
        hasher.write(self.descriptor);
        hasher.finish()
    }

    /// Field type of the owner as it appears in a descriptor: `L<owner>;`
    /// for classes, the owner itself when it is already an array descriptor.
    fn owner_type(&self, out: &mut Vec<u8>) {
        if self.owner.first() == Some(&b'[') {
            out.extend_from_slice(self.owner);
        } else {
            out.push(b'L');
            out.extend_from_slice(self.owner);
            out.push(b';');
        }
    }

    /// Descriptor that mirrors the operand-stack effect of performing
    /// `kind` on this member as a static call: for non-static operations
    /// the receiver becomes the first parameter; for `InvokeStatic` the
    /// descriptor is returned unchanged. For constructor handles the
    /// constructed type becomes the return type, and field accesses turn
    /// into getter/setter signatures.
    pub fn static_descriptor(&self, kind: RefKind) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.descriptor.len() + self.owner.len() + 4);
        match kind {
            RefKind::InvokeStatic => out.extend_from_slice(self.descriptor),
            RefKind::InvokeVirtual | RefKind::InvokeSpecial | RefKind::InvokeInterface => {
                let params = descriptors::parameters_slice(self.descriptor)?;
                let ret = descriptors::return_slice(self.descriptor)?;
                out.push(b'(');
                self.owner_type(&mut out);
                out.extend_from_slice(params);
                out.push(b')');
                out.extend_from_slice(ret);
            }
            RefKind::NewInvokeSpecial => {
                if !self.is_constructor() {
                    return Err(ClassFileError::invalid_descriptor(self.descriptor));
                }
                let params = descriptors::parameters_slice(self.descriptor)?;
                out.push(b'(');
                out.extend_from_slice(params);
                out.push(b')');
                self.owner_type(&mut out);
            }
            RefKind::GetField => {
                out.push(b'(');
                self.owner_type(&mut out);
                out.push(b')');
                out.extend_from_slice(self.descriptor);
            }
            RefKind::GetStatic => {
                out.extend_from_slice(b"()");
                out.extend_from_slice(self.descriptor);
            }
            RefKind::PutField => {
                out.push(b'(');
                self.owner_type(&mut out);
                out.extend_from_slice(self.descriptor);
                out.extend_from_slice(b")V");
            }
            RefKind::PutStatic => {
                out.push(b'(');
                out.extend_from_slice(self.descriptor);
                out.extend_from_slice(b")V");
            }
        }
        Ok(out)
    }

    /// Owned copy for use past the lifetime of the pool borrow.
    pub fn to_owned_parts(&self) -> OwnedMember {
        OwnedMember {
            owner: self.owner.to_vec(),
            name: self.name.to_vec(),
            descriptor: self.descriptor.to_vec(),
            interface: self.interface,
        }
    }
}

/// Owned `(owner, name, descriptor)` triple, used where a member outlives
/// the constant pool borrow it was resolved from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnedMember {
    pub owner: Vec<u8>,
    pub name: Vec<u8>,
    pub descriptor: Vec<u8>,
    pub interface: bool,
}

impl OwnedMember {
    pub fn as_ref(&self) -> MemberRef<'_> {
        MemberRef::new(&self.owner, &self.name, &self.descriptor, self.interface)
    }
}
