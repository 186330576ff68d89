//! Surgery on a single `Code` attribute.
//!
//! Two independent rewrites can apply. Caller-side: a denied invoke is
//! replaced in place by `invokestatic` to a synthetic proxy, `NOP`-padded
//! for `invokeinterface`, so no offset anywhere moves. Target-side: a fixed
//! check prologue is inserted at pc 0, which shifts every later pc by the
//! prologue size and forces the side tables (exception handlers, line
//! numbers, local variables, the first stack-map frame) to be re-aligned.

use jclass::buffer::{ByteBuf, Reader};
use jclass::constants::ConstantPool;
use jclass::errors::{ClassFileError, FormatCause, Result};
use jclass::member::RefKind;
use jclass::opcodes::{self, instruction_len};

use crate::processor::Replacement;
use crate::proxy::ProxySynthesizer;
use crate::rules::Rules;

/// Runtime-support class the target prologue calls into. Its `check`
/// implementation lives outside the core.
pub const AGENT_CLASS: &[u8] = b"boxtin/runtime/SecurityAgent";
const WALKER_NAME: &[u8] = b"WALKER";
const WALKER_DESC: &[u8] = b"Ljava/lang/StackWalker;";
const STACK_WALKER_CLASS: &[u8] = b"java/lang/StackWalker";
const GET_CALLER_NAME: &[u8] = b"getCallerClass";
const GET_CALLER_DESC: &[u8] = b"()Ljava/lang/Class;";
const CHECK_NAME: &[u8] = b"check";
const CHECK_DESC: &[u8] = b"(Ljava/lang/Class;Ljava/lang/Class;Ljava/lang/String;Ljava/lang/String;)V";

/// The prologue pushes caller class, this class, name and descriptor.
const PROLOGUE_STACK: u16 = 4;

/// Offset of the code array within a `Code` attribute.
const CODE_START: usize = 14;

#[allow(clippy::too_many_arguments)]
pub fn rewrite_code(
    attr: &[u8],
    attr_offset: usize,
    pool: &mut ConstantPool,
    proxies: &mut ProxySynthesizer,
    rules: &Rules,
    this_class_index: u16,
    this_class_name: &[u8],
    method_name: &[u8],
    method_descriptor: &[u8],
    target_checked: bool,
) -> Result<Option<Replacement>> {
    let mut reader = Reader::new(attr);
    let name_index = reader.read_u2()?;
    let attr_len = reader.read_u4()? as usize;
    if attr_len != attr.len() - 6 {
        return Err(FormatCause::LengthMismatch("Code").into());
    }
    let max_stack = reader.read_u2()?;
    let max_locals = reader.read_u2()?;
    let code_len = reader.read_u4()? as usize;
    let code = reader.read_slice(code_len)?;

    let patches = scan_invocations(code, pool, proxies, rules, this_class_index, this_class_name)?;
    let prologue = if target_checked {
        Some(build_prologue(pool, this_class_index, method_name, method_descriptor)?)
    } else {
        None
    };
    if patches.is_empty() && prologue.is_none() {
        return Ok(None);
    }

    // Caller-side replacement preserves instruction length, so it happens
    // inside the (possibly shifted) code window first.
    let mut new_code = code.to_vec();
    for (pc, bytes) in &patches {
        new_code[*pc..pc + bytes.len()].copy_from_slice(bytes);
    }

    let Some(prologue) = prologue else {
        let mut bytes = attr.to_vec();
        bytes[CODE_START..CODE_START + code_len].copy_from_slice(&new_code);
        return Ok(Some(Replacement { offset: attr_offset, len: attr.len(), bytes }));
    };

    let growth = prologue.len() as u16;
    let new_code_len = code_len + prologue.len();
    if new_code_len > i32::MAX as usize {
        return Err(ClassFileError::TooLarge("code attribute"));
    }

    // Exception table: every pc shifts by the prologue size, saturating.
    let exception_count = reader.read_u2()?;
    let mut exceptions = ByteBuf::with_capacity(exception_count as usize * 8);
    for _ in 0..exception_count {
        exceptions.write_u2(reader.read_u2()?.saturating_add(growth));
        exceptions.write_u2(reader.read_u2()?.saturating_add(growth));
        exceptions.write_u2(reader.read_u2()?.saturating_add(growth));
        exceptions.write_u2(reader.read_u2()?);
    }

    let sub_count = reader.read_u2()?;
    let mut subs = ByteBuf::new();
    for _ in 0..sub_count {
        let sub_name_index = reader.read_u2()?;
        let sub_len = reader.read_u4()? as usize;
        let payload = reader.read_slice(sub_len)?;
        let sub_name = pool.utf8(sub_name_index)?;
        let shifted: Vec<u8> = if sub_name == b"LineNumberTable" {
            shift_line_numbers(payload, growth)?
        } else if sub_name == b"LocalVariableTable" || sub_name == b"LocalVariableTypeTable" {
            shift_local_variables(payload, growth)?
        } else if sub_name == b"StackMapTable" {
            shift_stack_map(payload, growth)?
        } else {
            payload.to_vec()
        };
        subs.write_u2(sub_name_index);
        subs.write_u4(shifted.len() as u32);
        subs.write_slice(&shifted);
    }
    if reader.remaining() != 0 {
        return Err(FormatCause::LengthMismatch("Code").into());
    }

    let mut out = ByteBuf::with_capacity(attr.len() + prologue.len() + 2);
    out.write_u2(name_index);
    out.write_u4(0); // patched below
    out.write_u2(max_stack.max(PROLOGUE_STACK));
    out.write_u2(max_locals);
    out.write_u4(new_code_len as u32);
    out.write_slice(&prologue);
    out.write_slice(&new_code);
    out.write_u2(exception_count);
    out.write_slice(exceptions.as_slice());
    out.write_u2(sub_count);
    out.write_slice(subs.as_slice());
    let total = out.len();
    out.patch_u4_at(2, (total - 6) as u32);
    Ok(Some(Replacement { offset: attr_offset, len: attr.len(), bytes: out.into_vec() }))
}

/// Linear scan; every denied invoke produces an in-place patch of the same
/// byte length.
fn scan_invocations(
    code: &[u8],
    pool: &mut ConstantPool,
    proxies: &mut ProxySynthesizer,
    rules: &Rules,
    this_class_index: u16,
    this_class_name: &[u8],
) -> Result<Vec<(usize, Vec<u8>)>> {
    let mut patches = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let len = instruction_len(code, pc)?;
        if pc + len > code.len() {
            return Err(FormatCause::Truncated(pc).into());
        }
        let op = code[pc];
        if let Some(kind) = RefKind::from_invoke_op(op) {
            let index = u16::from_be_bytes([code[pc + 1], code[pc + 2]]);
            let action = {
                let member = pool.member_ref(index)?;
                // Same-class calls stay inside one module by construction,
                // and constructor calls cannot be re-routed through a
                // static proxy while the receiver is uninitialized.
                if member.owner_class() == this_class_name || member.is_constructor() {
                    None
                } else {
                    rules.decision_for_method(&member).deny_caller_action().cloned()
                }
            };
            if let Some(action) = action {
                let proxy_ref = proxies.proxy_for(pool, this_class_index, kind, index, &action)?;
                let mut bytes = vec![opcodes::INVOKESTATIC];
                bytes.extend_from_slice(&proxy_ref.to_be_bytes());
                if op == opcodes::INVOKEINTERFACE {
                    bytes.push(opcodes::NOP);
                    bytes.push(opcodes::NOP);
                }
                patches.push((pc, bytes));
            }
        }
        pc += len;
    }
    Ok(patches)
}

/// The fixed check-callback sequence inserted at pc 0 of a target-checked
/// method: 16 bytes for constructors (name slot is `aconst_null`), 20 for
/// named methods. Always a multiple of 4 so `tableswitch`/`lookupswitch`
/// padding stays valid.
fn build_prologue(
    pool: &mut ConstantPool,
    this_class_index: u16,
    method_name: &[u8],
    method_descriptor: &[u8],
) -> Result<Vec<u8>> {
    let walker = pool.add_field_ref(AGENT_CLASS, WALKER_NAME, WALKER_DESC)?;
    let get_caller = pool.add_method_ref(STACK_WALKER_CLASS, GET_CALLER_NAME, GET_CALLER_DESC)?;
    let check = pool.add_method_ref(AGENT_CLASS, CHECK_NAME, CHECK_DESC)?;
    let name_const = if method_name == b"<init>" {
        None
    } else {
        let utf = pool.add_utf8(method_name)?;
        Some(pool.add_string(utf)?)
    };
    let desc_utf = pool.add_utf8(method_descriptor)?;
    let desc_const = pool.add_string(desc_utf)?;

    let mut code = Vec::with_capacity(20);
    code.push(opcodes::GETSTATIC);
    code.extend_from_slice(&walker.to_be_bytes());
    code.push(opcodes::INVOKEVIRTUAL);
    code.extend_from_slice(&get_caller.to_be_bytes());
    code.push(opcodes::LDC_W);
    code.extend_from_slice(&this_class_index.to_be_bytes());
    match name_const {
        Some(index) => {
            code.push(opcodes::LDC_W);
            code.extend_from_slice(&index.to_be_bytes());
        }
        None => code.push(opcodes::ACONST_NULL),
    }
    code.push(opcodes::LDC_W);
    code.extend_from_slice(&desc_const.to_be_bytes());
    code.push(opcodes::INVOKESTATIC);
    code.extend_from_slice(&check.to_be_bytes());
    while code.len() % 4 != 0 {
        code.push(opcodes::NOP);
    }
    Ok(code)
}

fn shift_line_numbers(payload: &[u8], growth: u16) -> Result<Vec<u8>> {
    let mut reader = Reader::new(payload);
    let count = reader.read_u2()?;
    let mut out = ByteBuf::with_capacity(payload.len());
    out.write_u2(count);
    for _ in 0..count {
        out.write_u2(reader.read_u2()?.saturating_add(growth));
        out.write_u2(reader.read_u2()?);
    }
    if reader.remaining() != 0 {
        return Err(FormatCause::LengthMismatch("LineNumberTable").into());
    }
    Ok(out.into_vec())
}

/// Both local-variable tables share the entry layout: only `start_pc`
/// moves, `length` is unchanged.
fn shift_local_variables(payload: &[u8], growth: u16) -> Result<Vec<u8>> {
    let mut reader = Reader::new(payload);
    let count = reader.read_u2()?;
    let mut out = ByteBuf::with_capacity(payload.len());
    out.write_u2(count);
    for _ in 0..count {
        out.write_u2(reader.read_u2()?.saturating_add(growth));
        out.write_slice(reader.read_slice(8)?);
    }
    if reader.remaining() != 0 {
        return Err(FormatCause::LengthMismatch("LocalVariableTable").into());
    }
    Ok(out.into_vec())
}

fn read_verification_type(reader: &mut Reader) -> Result<Vec<u8>> {
    let tag = reader.read_u1()?;
    let mut bytes = vec![tag];
    if tag == 7 || tag == 8 {
        bytes.extend_from_slice(reader.read_slice(2)?);
    }
    Ok(bytes)
}

/// Only the first frame's `offset_delta` is measured from pc 0, so only it
/// shifts. A compact frame whose new delta no longer fits its tag range is
/// promoted to the extended form, growing the attribute by two bytes.
fn shift_stack_map(payload: &[u8], growth: u16) -> Result<Vec<u8>> {
    let mut reader = Reader::new(payload);
    let count = reader.read_u2()?;
    if count == 0 {
        return Ok(payload.to_vec());
    }
    let mut out = ByteBuf::with_capacity(payload.len() + 2);
    out.write_u2(count);
    let tag = reader.read_u1()?;
    match tag {
        0..=63 => {
            let delta = tag as u32 + growth as u32;
            if delta <= 63 {
                out.write_u1(delta as u8);
            } else {
                out.write_u1(251);
                out.write_u2(checked_delta(delta)?);
            }
        }
        64..=127 => {
            let info = read_verification_type(&mut reader)?;
            let delta = (tag - 64) as u32 + growth as u32;
            if delta <= 63 {
                out.write_u1(64 + delta as u8);
            } else {
                out.write_u1(247);
                out.write_u2(checked_delta(delta)?);
            }
            out.write_slice(&info);
        }
        247..=255 => {
            let delta = reader.read_u2()? as u32 + growth as u32;
            out.write_u1(tag);
            out.write_u2(checked_delta(delta)?);
        }
        128..=246 => return Err(FormatCause::InvalidFrameTag(tag).into()),
    }
    // Remaining frames (and the tail of the first) are delta-encoded
    // against their predecessor and pass through untouched.
    out.write_slice(&payload[reader.position()..]);
    Ok(out.into_vec())
}

fn checked_delta(delta: u32) -> Result<u16> {
    u16::try_from(delta).map_err(|_| ClassFileError::TooLarge("stack map offset"))
}
