//! Top-level classfile rewriting.
//!
//! A [`ClassFileProcessor`] lives for exactly one classfile and is owned by
//! its caller; nothing here is shared. It decodes the header, skips the
//! field table, walks the methods dispatching each `Code` attribute to the
//! rewriter, rewrites denied `MethodHandle` constants, appends synthesized
//! proxies, and re-emits the classfile by splicing the collected
//! replacements into the original bytes in strictly increasing offset
//! order.

use jclass::access_flags::{ClassAccessFlags, MethodAccessFlags};
use jclass::buffer::{ByteBuf, Reader};
use jclass::constants::ConstantPool;
use jclass::errors::{FormatCause, Result};
use jclass::member::RefKind;
use jclass::opcodes;

use crate::proxy::{ProxySynthesizer, SECURITY_EXCEPTION};
use crate::rewriter;
use crate::rules::Rules;

const MAGIC: u32 = 0xCAFE_BABE;
/// Stack maps became mandatory in 51 (Java 7); older classfiles are not
/// transformed.
const MIN_MAJOR_VERSION: u16 = 51;

/// An ordered patch into the original classfile bytes.
#[derive(Clone, Debug)]
pub struct Replacement {
    pub offset: usize,
    pub len: usize,
    pub bytes: Vec<u8>,
}

impl Replacement {
    /// Signed: the sealed-class path shrinks code attributes.
    pub fn growth(&self) -> isize {
        self.bytes.len() as isize - self.len as isize
    }
}

pub struct ClassFileProcessor<'a> {
    bytes: &'a [u8],
}

impl<'a> ClassFileProcessor<'a> {
    pub fn new(bytes: &'a [u8]) -> ClassFileProcessor<'a> {
        ClassFileProcessor { bytes }
    }

    /// Transform one classfile under `rules`. `Ok(None)` means no changes
    /// were necessary.
    pub fn transform(self, rules: &Rules) -> Result<Option<Vec<u8>>> {
        let bytes = self.bytes;
        let mut reader = Reader::new(bytes);
        let magic = reader.read_u4()?;
        if magic != MAGIC {
            return Err(FormatCause::IncorrectMagic(magic).into());
        }
        let _minor = reader.read_u2()?;
        let major = reader.read_u2()?;
        if major < MIN_MAJOR_VERSION {
            return Err(FormatCause::UnsupportedVersion(major).into());
        }
        let mut pool = ConstantPool::decode(&mut reader)?;
        let pool_end = reader.position();
        let access_flags = ClassAccessFlags::from_u16(reader.read_u2()?);
        if access_flags.contains(ClassAccessFlags::MODULE) {
            // module-info carries no code.
            return Ok(None);
        }
        let this_class = reader.read_u2()?;
        let _super_class = reader.read_u2()?;
        let interfaces_count = reader.read_u2()?;
        reader.skip(interfaces_count as usize * 2)?;

        let this_name = pool.class_name(this_class)?.to_vec();
        let (package, plain) = match this_name.iter().rposition(|&b| b == b'/') {
            Some(slash) => (&this_name[..slash], &this_name[slash + 1..]),
            None => (&this_name[..0], &this_name[..]),
        };
        // Short-circuit: nothing can be checked for this class, on either
        // side. This also covers classes inaccessible to outsiders.
        let target = rules.for_target_class(package, plain);
        if !rules.has_caller_checks() && !target.any_checked() {
            return Ok(None);
        }

        // Fields are never rewritten.
        let field_count = reader.read_u2()?;
        for _ in 0..field_count {
            reader.skip(6)?;
            let attr_count = reader.read_u2()?;
            for _ in 0..attr_count {
                reader.skip(2)?;
                let len = reader.read_u4()? as usize;
                reader.skip(len)?;
            }
        }

        let methods_count_offset = reader.position();
        let methods_count = reader.read_u2()?;
        let mut replacements: Vec<Replacement> = Vec::new();
        let mut proxies = ProxySynthesizer::new();
        for _ in 0..methods_count {
            let _flags = MethodAccessFlags::from_u16(reader.read_u2()?);
            let name_index = reader.read_u2()?;
            let descriptor_index = reader.read_u2()?;
            let name = pool.utf8(name_index)?.to_vec();
            let descriptor = pool.utf8(descriptor_index)?.to_vec();
            let attr_count = reader.read_u2()?;
            for _ in 0..attr_count {
                let attr_start = reader.position();
                let attr_name_index = reader.read_u2()?;
                let attr_len = reader.read_u4()? as usize;
                reader.skip(attr_len)?;
                // Class initializers are exempt from every rewrite; all
                // attributes other than Code pass through unchanged.
                if name == b"<clinit>" || pool.utf8(attr_name_index)? != b"Code" {
                    continue;
                }
                let target_checked = if name == b"<init>" {
                    target.any_constructor_checked()
                } else {
                    target.method_checked(&name, &descriptor)
                };
                let attr = &bytes[attr_start..reader.position()];
                if let Some(replacement) = rewriter::rewrite_code(
                    attr,
                    attr_start,
                    &mut pool,
                    &mut proxies,
                    rules,
                    this_class,
                    &this_name,
                    &name,
                    &descriptor,
                    target_checked,
                )? {
                    replacements.push(replacement);
                }
            }
        }
        let methods_end = reader.position();

        // MethodHandle constants that close over a denied member are
        // re-pointed at a proxy of the matching kind; every invokedynamic
        // site using them inherits the check.
        if rules.has_caller_checks() {
            for handle in pool.method_handles().to_vec() {
                let (kind_raw, reference_index) = pool.method_handle(handle)?;
                let kind = RefKind::from_u8(kind_raw)?;
                let action = {
                    let member = pool.member_ref(reference_index)?;
                    if member.owner_class() == this_name.as_slice() {
                        None
                    } else if kind.is_field_access() {
                        rules.decision_for_field(&member).deny_caller_action().cloned()
                    } else if kind == RefKind::NewInvokeSpecial {
                        rules
                            .decision_for_constructor(&member)
                            .deny_caller_action()
                            .cloned()
                    } else {
                        rules.decision_for_method(&member).deny_caller_action().cloned()
                    }
                };
                if let Some(action) = action {
                    let proxy_ref =
                        proxies.proxy_for(&mut pool, this_class, kind, reference_index, &action)?;
                    pool.patch_method_handle(handle, RefKind::InvokeStatic.as_u8(), proxy_ref)?;
                }
            }
        }

        if proxies.count() > 0 {
            replacements.push(Replacement {
                offset: methods_end,
                len: 0,
                bytes: proxies.methods_bytes().to_vec(),
            });
        }
        if replacements.is_empty() {
            return Ok(None);
        }
        emit(
            bytes,
            &pool,
            pool_end,
            &replacements,
            methods_count_offset,
            methods_count + proxies.count(),
        )
        .map(Some)
    }
}

/// Splice `replacements` into the original bytes, emitting the extended
/// constant pool in place of the original one and patching the method
/// count.
fn emit(
    bytes: &[u8],
    pool: &ConstantPool,
    pool_end: usize,
    replacements: &[Replacement],
    methods_count_offset: usize,
    methods_count: u16,
) -> Result<Vec<u8>> {
    let growth: isize = replacements.iter().map(Replacement::growth).sum();
    let capacity = (bytes.len() + pool.growth()) as isize + growth;
    let mut out = ByteBuf::with_capacity(capacity.max(0) as usize);
    out.write_slice(&bytes[..8]);
    pool.write_to(&mut out);
    let mut cursor = pool_end;
    for replacement in replacements {
        if replacement.offset < cursor || replacement.offset + replacement.len > bytes.len() {
            return Err(FormatCause::NonMonotonicReplacement.into());
        }
        out.write_slice(&bytes[cursor..replacement.offset]);
        out.write_slice(&replacement.bytes);
        cursor = replacement.offset + replacement.len;
    }
    out.write_slice(&bytes[cursor..]);
    out.patch_u2_at(methods_count_offset + pool.growth(), methods_count);
    Ok(out.into_vec())
}

/// Fail-secure substitute: every concrete method of the class throws the
/// denial exception. The agent swaps this in when a transformation fails;
/// passing the input through untransformed would be a bypass.
pub fn seal(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::new(bytes);
    let magic = reader.read_u4()?;
    if magic != MAGIC {
        return Err(FormatCause::IncorrectMagic(magic).into());
    }
    let _minor = reader.read_u2()?;
    let major = reader.read_u2()?;
    if major < MIN_MAJOR_VERSION {
        return Err(FormatCause::UnsupportedVersion(major).into());
    }
    let mut pool = ConstantPool::decode(&mut reader)?;
    let pool_end = reader.position();
    reader.skip(6)?; // access_flags, this_class, super_class
    let interfaces_count = reader.read_u2()?;
    reader.skip(interfaces_count as usize * 2)?;
    let field_count = reader.read_u2()?;
    for _ in 0..field_count {
        reader.skip(6)?;
        let attr_count = reader.read_u2()?;
        for _ in 0..attr_count {
            reader.skip(2)?;
            let len = reader.read_u4()? as usize;
            reader.skip(len)?;
        }
    }
    let methods_count_offset = reader.position();
    let methods_count = reader.read_u2()?;

    let exception_class = pool.add_class(SECURITY_EXCEPTION)?;
    let exception_ctor = pool.add_method_ref(SECURITY_EXCEPTION, b"<init>", b"()V")?;
    let mut throw_code = Vec::with_capacity(8);
    throw_code.push(opcodes::NEW);
    throw_code.extend_from_slice(&exception_class.to_be_bytes());
    throw_code.push(opcodes::DUP);
    throw_code.push(opcodes::INVOKESPECIAL);
    throw_code.extend_from_slice(&exception_ctor.to_be_bytes());
    throw_code.push(opcodes::ATHROW);

    let mut replacements = Vec::new();
    for _ in 0..methods_count {
        reader.skip(6)?;
        let attr_count = reader.read_u2()?;
        for _ in 0..attr_count {
            let attr_start = reader.position();
            let attr_name_index = reader.read_u2()?;
            let attr_len = reader.read_u4()? as usize;
            reader.skip(attr_len)?;
            if pool.utf8(attr_name_index)? != b"Code" {
                continue;
            }
            let original = &bytes[attr_start..reader.position()];
            let max_locals =
                u16::from_be_bytes([original[8], original[9]]);
            let mut sealed = ByteBuf::with_capacity(6 + 20);
            sealed.write_u2(attr_name_index);
            sealed.write_u4(12 + throw_code.len() as u32);
            sealed.write_u2(2); // max_stack: new + dup
            sealed.write_u2(max_locals);
            sealed.write_u4(throw_code.len() as u32);
            sealed.write_slice(&throw_code);
            sealed.write_u2(0); // exception_table_length
            sealed.write_u2(0); // attributes_count
            replacements.push(Replacement {
                offset: attr_start,
                len: original.len(),
                bytes: sealed.into_vec(),
            });
        }
    }
    emit(bytes, &pool, pool_end, &replacements, methods_count_offset, methods_count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::RulesBuilder;

    #[test]
    fn bad_magic_is_class_format() {
        let rules = RulesBuilder::deny_all().build();
        let err = ClassFileProcessor::new(&[0, 0, 0, 0]).transform(&rules).unwrap_err();
        assert!(matches!(
            err,
            jclass::errors::ClassFileError::ClassFormat(FormatCause::IncorrectMagic(0))
        ));
    }

    #[test]
    fn old_versions_are_rejected() {
        let mut buf = ByteBuf::new();
        buf.write_u4(MAGIC);
        buf.write_u2(0);
        buf.write_u2(50);
        let rules = RulesBuilder::deny_all().build();
        let err = ClassFileProcessor::new(buf.as_slice()).transform(&rules).unwrap_err();
        assert!(matches!(
            err,
            jclass::errors::ClassFileError::ClassFormat(FormatCause::UnsupportedVersion(50))
        ));
    }

    #[test]
    fn replacement_growth() {
        let r = Replacement { offset: 10, len: 3, bytes: vec![0; 5] };
        assert_eq!(r.growth(), 2);
    }
}
