//! Opcode constants and instruction sizing for the linear code scan.
//!
//! Only the opcodes the rewriter emits get named constants; everything else
//! is covered by the length table, which is what lets the scan step from one
//! instruction to the next without decoding operands.

use crate::errors::{FormatCause, Result};

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_0: u8 = 0x03;
pub const LCONST_0: u8 = 0x09;
pub const FCONST_0: u8 = 0x0B;
pub const DCONST_0: u8 = 0x0E;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const DUP: u8 = 0x59;
pub const IINC: u8 = 0x84;
pub const IFNE: u8 = 0x9A;
pub const IF_ACMPEQ: u8 = 0xA5;
pub const GOTO: u8 = 0xA7;
pub const TABLESWITCH: u8 = 0xAA;
pub const LOOKUPSWITCH: u8 = 0xAB;
pub const IRETURN: u8 = 0xAC;
pub const LRETURN: u8 = 0xAD;
pub const FRETURN: u8 = 0xAE;
pub const DRETURN: u8 = 0xAF;
pub const ARETURN: u8 = 0xB0;
pub const RETURN: u8 = 0xB1;
pub const GETSTATIC: u8 = 0xB2;
pub const PUTSTATIC: u8 = 0xB3;
pub const GETFIELD: u8 = 0xB4;
pub const PUTFIELD: u8 = 0xB5;
pub const INVOKEVIRTUAL: u8 = 0xB6;
pub const INVOKESPECIAL: u8 = 0xB7;
pub const INVOKESTATIC: u8 = 0xB8;
pub const INVOKEINTERFACE: u8 = 0xB9;
pub const INVOKEDYNAMIC: u8 = 0xBA;
pub const NEW: u8 = 0xBB;
pub const ATHROW: u8 = 0xBF;
pub const WIDE: u8 = 0xC4;

/// Sentinel in [`LENGTHS`] for `wide`, `tableswitch` and `lookupswitch`.
const VARIABLE: u8 = 0xFF;

/// Total instruction length (opcode included) per opcode; `0` marks opcodes
/// that must not appear in a classfile.
static LENGTHS: [u8; 256] = build_lengths();

const fn build_lengths() -> [u8; 256] {
    let mut t = [0u8; 256];
    let mut i: usize = 0;
    // nop through dconst_1
    while i <= 0x0F {
        t[i] = 1;
        i += 1;
    }
    t[0x10] = 2; // bipush
    t[0x11] = 3; // sipush
    t[0x12] = 2; // ldc
    t[0x13] = 3; // ldc_w
    t[0x14] = 3; // ldc2_w
    i = 0x15; // iload through aload
    while i <= 0x19 {
        t[i] = 2;
        i += 1;
    }
    i = 0x1A; // iload_0 through saload
    while i <= 0x35 {
        t[i] = 1;
        i += 1;
    }
    i = 0x36; // istore through astore
    while i <= 0x3A {
        t[i] = 2;
        i += 1;
    }
    i = 0x3B; // istore_0 through lxor
    while i <= 0x83 {
        t[i] = 1;
        i += 1;
    }
    t[0x84] = 3; // iinc
    i = 0x85; // i2l through dcmpg
    while i <= 0x98 {
        t[i] = 1;
        i += 1;
    }
    i = 0x99; // ifeq through jsr
    while i <= 0xA8 {
        t[i] = 3;
        i += 1;
    }
    t[0xA9] = 2; // ret
    t[TABLESWITCH as usize] = VARIABLE;
    t[LOOKUPSWITCH as usize] = VARIABLE;
    i = 0xAC; // ireturn through return
    while i <= 0xB1 {
        t[i] = 1;
        i += 1;
    }
    i = 0xB2; // getstatic through invokestatic
    while i <= 0xB8 {
        t[i] = 3;
        i += 1;
    }
    t[0xB9] = 5; // invokeinterface
    t[0xBA] = 5; // invokedynamic
    t[0xBB] = 3; // new
    t[0xBC] = 2; // newarray
    t[0xBD] = 3; // anewarray
    t[0xBE] = 1; // arraylength
    t[0xBF] = 1; // athrow
    t[0xC0] = 3; // checkcast
    t[0xC1] = 3; // instanceof
    t[0xC2] = 1; // monitorenter
    t[0xC3] = 1; // monitorexit
    t[WIDE as usize] = VARIABLE;
    t[0xC5] = 4; // multianewarray
    t[0xC6] = 3; // ifnull
    t[0xC7] = 3; // ifnonnull
    t[0xC8] = 5; // goto_w
    t[0xC9] = 5; // jsr_w
    t
}

fn read_i32(code: &[u8], at: usize) -> Result<i32> {
    if code.len() < at + 4 {
        return Err(FormatCause::Truncated(at).into());
    }
    Ok(i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]))
}

/// Length in bytes of the instruction starting at `pc`, switch padding and
/// `wide` forms included.
pub fn instruction_len(code: &[u8], pc: usize) -> Result<usize> {
    let op = code[pc];
    let len = LENGTHS[op as usize];
    if len == 0 {
        return Err(FormatCause::IllegalOpcode { op, pc: pc as u32 }.into());
    }
    if len != VARIABLE {
        return Ok(len as usize);
    }
    match op {
        WIDE => {
            if pc + 1 >= code.len() {
                return Err(FormatCause::Truncated(pc + 1).into());
            }
            Ok(if code[pc + 1] == IINC { 6 } else { 4 })
        }
        TABLESWITCH => {
            let pad = (4 - ((pc + 1) % 4)) % 4;
            let base = pc + 1 + pad;
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(FormatCause::IllegalOpcode { op, pc: pc as u32 }.into());
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            Ok(1 + pad + 12 + 4 * count)
        }
        LOOKUPSWITCH => {
            let pad = (4 - ((pc + 1) % 4)) % 4;
            let base = pc + 1 + pad;
            let npairs = read_i32(code, base + 4)?;
            if npairs < 0 {
                return Err(FormatCause::IllegalOpcode { op, pc: pc as u32 }.into());
            }
            Ok(1 + pad + 8 + 8 * npairs as usize)
        }
        _ => unreachable!("no other variable-length opcodes"),
    }
}
