//! Synthesis of the static proxy methods that caller-side denials route
//! through.
//!
//! A proxy compares the enclosing class's module against the target owner's
//! module at runtime; when they match the original instruction is replayed,
//! otherwise the configured deny action runs. The JVM's constant folder
//! elides the compare once both classes are loaded and proven identical, so
//! the steady-state cost of an allowed call is nil.

use fxhash::FxHashMap;

use jclass::buffer::ByteBuf;
use jclass::constants::ConstantPool;
use jclass::descriptors::{self, JavaType};
use jclass::errors::{ClassFileError, Result};
use jclass::member::RefKind;
use jclass::opcodes;

use crate::rules::{ConstValue, DenyAction, MethodTarget};

const CLASS_CLASS: &[u8] = b"java/lang/Class";
const GET_MODULE: &[u8] = b"getModule";
const GET_MODULE_DESC: &[u8] = b"()Ljava/lang/Module;";
pub const SECURITY_EXCEPTION: &[u8] = b"java/lang/SecurityException";

/// `PRIVATE | STATIC | SYNTHETIC`
const PROXY_FLAGS: u16 = 0x0002 | 0x0008 | 0x1000;

/// Byte length of the module-compare prelude; the pass label sits right
/// after it plus the deny body.
const PRELUDE_LEN: usize = 15;

/// Emits at most one synthetic method per distinct `(kind, member)` pair
/// seen in one class.
#[derive(Default)]
pub struct ProxySynthesizer {
    map: FxHashMap<(u8, Vec<u8>), u16>,
    methods: Vec<u8>,
    count: u16,
}

impl ProxySynthesizer {
    pub fn new() -> ProxySynthesizer {
        ProxySynthesizer::default()
    }

    /// Number of methods synthesized so far.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Byte growth the appended `method_info` structures contribute.
    pub fn growth(&self) -> usize {
        self.methods.len()
    }

    pub fn methods_bytes(&self) -> &[u8] {
        &self.methods
    }

    /// `MethodRef` index of the proxy for `(kind, member_index)`, creating
    /// it on first demand.
    pub fn proxy_for(
        &mut self,
        pool: &mut ConstantPool,
        this_class_index: u16,
        kind: RefKind,
        member_index: u16,
        action: &DenyAction,
    ) -> Result<u16> {
        let (owner_class_index, member_key) = {
            let member = pool.member_ref(member_index)?;
            (pool.member_entry(member_index)?.0, member.encode_full())
        };
        let key = (kind.as_u8(), member_key);
        if let Some(&existing) = self.map.get(&key) {
            return Ok(existing);
        }
        let proxy_desc = {
            let member = pool.member_ref(member_index)?;
            member.static_descriptor(kind)?
        };
        let desc_index = pool.add_utf8(&proxy_desc)?;
        let (proxy_ref, name_index) = pool.add_unique_method(this_class_index, desc_index)?;
        let blob = synthesize(
            pool,
            this_class_index,
            owner_class_index,
            kind,
            member_index,
            &proxy_desc,
            name_index,
            desc_index,
            action,
        )?;
        self.methods.extend_from_slice(&blob);
        self.count += 1;
        self.map.insert(key, proxy_ref);
        Ok(proxy_ref)
    }
}

/// Parameter-reload sequence with correct slot indices.
fn load_sequence(proxy_desc: &[u8]) -> Result<(Vec<u8>, u16)> {
    let mut loads = Vec::new();
    let mut slot: u16 = 0;
    for ty in descriptors::parameter_types(proxy_desc)? {
        loads.push(ty.load_op());
        loads.push(slot as u8);
        slot += ty.slots();
    }
    Ok((loads, slot))
}

fn return_op(ret: Option<JavaType>) -> u8 {
    match ret {
        None => opcodes::RETURN,
        Some(ty) => ty.return_op(),
    }
}

/// Operand-stack demand of one deny body.
fn deny_stack_need(action: &DenyAction, args_slots: u16, ret_slots: u16) -> u16 {
    match action {
        DenyAction::Standard => 2,
        DenyAction::Exception { message, .. } => {
            if message.is_some() {
                3
            } else {
                2
            }
        }
        DenyAction::Empty => ret_slots.max(1),
        DenyAction::Value(ConstValue::Long(_) | ConstValue::Double(_)) => 2,
        DenyAction::Value(_) => 1,
        DenyAction::Custom(_) => args_slots.max(ret_slots),
        DenyAction::Checked { fallback, .. } => args_slots
            .max(1)
            .max(deny_stack_need(fallback, args_slots, ret_slots)),
    }
}

fn internal_form(name: &str) -> Vec<u8> {
    name.replace('.', "/").into_bytes()
}

fn push_u16(code: &mut Vec<u8>, v: u16) {
    code.extend_from_slice(&v.to_be_bytes());
}

fn emit_throw(pool: &mut ConstantPool, code: &mut Vec<u8>, class: &[u8], message: Option<&str>) -> Result<()> {
    let exc_class = pool.add_class(class)?;
    code.push(opcodes::NEW);
    push_u16(code, exc_class);
    code.push(opcodes::DUP);
    if let Some(message) = message {
        let utf = pool.add_utf8(message.as_bytes())?;
        let string = pool.add_string(utf)?;
        code.push(opcodes::LDC_W);
        push_u16(code, string);
        let ctor = pool.add_method_ref(class, b"<init>", b"(Ljava/lang/String;)V")?;
        code.push(opcodes::INVOKESPECIAL);
        push_u16(code, ctor);
    } else {
        let ctor = pool.add_method_ref(class, b"<init>", b"()V")?;
        code.push(opcodes::INVOKESPECIAL);
        push_u16(code, ctor);
    }
    code.push(opcodes::ATHROW);
    Ok(())
}

/// Deny body bytes plus the positions (relative to the body start) of
/// `ifne` operands that must later branch to the pass label.
fn deny_bytes(
    pool: &mut ConstantPool,
    action: &DenyAction,
    proxy_desc: &[u8],
    loads: &[u8],
    ret: Option<JavaType>,
) -> Result<(Vec<u8>, Vec<usize>)> {
    let mut code = Vec::new();
    let mut pass_patches = Vec::new();
    match action {
        DenyAction::Standard => emit_throw(pool, &mut code, SECURITY_EXCEPTION, None)?,
        DenyAction::Exception { class_name, message } => {
            let class = internal_form(class_name);
            emit_throw(pool, &mut code, &class, message.as_deref())?;
        }
        DenyAction::Empty => {
            match ret {
                None => {}
                Some(JavaType::Int) => code.push(opcodes::ICONST_0),
                Some(JavaType::Long) => code.push(opcodes::LCONST_0),
                Some(JavaType::Float) => code.push(opcodes::FCONST_0),
                Some(JavaType::Double) => code.push(opcodes::DCONST_0),
                Some(JavaType::Reference) => code.push(opcodes::ACONST_NULL),
            }
            code.push(return_op(ret));
        }
        DenyAction::Value(value) => {
            if ret.is_none() {
                code.push(opcodes::RETURN);
            } else {
                match value {
                    ConstValue::Int(v) => {
                        let index = pool.add_integer(*v)?;
                        code.push(opcodes::LDC_W);
                        push_u16(&mut code, index);
                        code.push(opcodes::IRETURN);
                    }
                    ConstValue::Long(v) => {
                        let index = pool.add_long(*v)?;
                        code.push(opcodes::LDC2_W);
                        push_u16(&mut code, index);
                        code.push(opcodes::LRETURN);
                    }
                    ConstValue::Float(v) => {
                        let index = pool.add_float(*v)?;
                        code.push(opcodes::LDC_W);
                        push_u16(&mut code, index);
                        code.push(opcodes::FRETURN);
                    }
                    ConstValue::Double(v) => {
                        let index = pool.add_double(*v)?;
                        code.push(opcodes::LDC2_W);
                        push_u16(&mut code, index);
                        code.push(opcodes::DRETURN);
                    }
                    ConstValue::Str(s) => {
                        let utf = pool.add_utf8(s.as_bytes())?;
                        let string = pool.add_string(utf)?;
                        code.push(opcodes::LDC_W);
                        push_u16(&mut code, string);
                        code.push(opcodes::ARETURN);
                    }
                    ConstValue::Null => {
                        code.push(opcodes::ACONST_NULL);
                        code.push(opcodes::ARETURN);
                    }
                }
            }
        }
        DenyAction::Custom(target) => {
            let custom = add_target_ref(pool, target, proxy_desc)?;
            code.extend_from_slice(loads);
            code.push(opcodes::INVOKESTATIC);
            push_u16(&mut code, custom);
            code.push(return_op(ret));
        }
        DenyAction::Checked { predicate, fallback } => {
            let params = descriptors::parameters_slice(proxy_desc)?;
            let mut pred_desc = Vec::with_capacity(params.len() + 3);
            pred_desc.push(b'(');
            pred_desc.extend_from_slice(params);
            pred_desc.extend_from_slice(b")Z");
            let pred = add_target_ref(pool, predicate, &pred_desc)?;
            code.extend_from_slice(loads);
            code.push(opcodes::INVOKESTATIC);
            push_u16(&mut code, pred);
            pass_patches.push(code.len());
            code.push(opcodes::IFNE);
            push_u16(&mut code, 0);
            let (fallback_code, fallback_patches) =
                deny_bytes(pool, fallback, proxy_desc, loads, ret)?;
            let base = code.len();
            for patch in fallback_patches {
                pass_patches.push(base + patch);
            }
            code.extend_from_slice(&fallback_code);
        }
    }
    Ok((code, pass_patches))
}

fn add_target_ref(pool: &mut ConstantPool, target: &MethodTarget, descriptor: &[u8]) -> Result<u16> {
    let owner = internal_form(&target.owner);
    pool.add_method_ref(&owner, target.name.as_bytes(), descriptor)
}

#[allow(clippy::too_many_arguments)]
fn synthesize(
    pool: &mut ConstantPool,
    this_class_index: u16,
    owner_class_index: u16,
    kind: RefKind,
    member_index: u16,
    proxy_desc: &[u8],
    name_index: u16,
    desc_index: u16,
    action: &DenyAction,
) -> Result<Vec<u8>> {
    let (loads, args_slots) = load_sequence(proxy_desc)?;
    let ret = descriptors::return_type(proxy_desc)?;
    let ret_slots = ret.map_or(0, JavaType::slots);
    let get_module = pool.add_method_ref(CLASS_CLASS, GET_MODULE, GET_MODULE_DESC)?;

    let (deny, pass_patches) = deny_bytes(pool, action, proxy_desc, &loads, ret)?;
    let pass = PRELUDE_LEN + deny.len();
    // Branch operands are signed 16-bit and measured from their opcode.
    if pass > i16::MAX as usize {
        return Err(ClassFileError::TooLarge("proxy method"));
    }

    let mut code = Vec::with_capacity(pass + loads.len() + 8);
    // Module compare: fall through to the deny body when they differ.
    code.push(opcodes::LDC_W);
    push_u16(&mut code, this_class_index);
    code.push(opcodes::INVOKEVIRTUAL);
    push_u16(&mut code, get_module);
    code.push(opcodes::LDC_W);
    push_u16(&mut code, owner_class_index);
    code.push(opcodes::INVOKEVIRTUAL);
    push_u16(&mut code, get_module);
    code.push(opcodes::IF_ACMPEQ);
    push_u16(&mut code, pass as u16 - 12);
    debug_assert_eq!(code.len(), PRELUDE_LEN);
    code.extend_from_slice(&deny);
    for patch in pass_patches {
        // ifne operands branch relative to their own opcode.
        let at = PRELUDE_LEN + patch;
        let offset = (pass - at) as u16;
        code[at + 1..at + 3].copy_from_slice(&offset.to_be_bytes());
    }
    // Pass label: reload every argument and replay the original operation.
    match kind {
        RefKind::NewInvokeSpecial => {
            code.push(opcodes::NEW);
            push_u16(&mut code, owner_class_index);
            code.push(opcodes::DUP);
            code.extend_from_slice(&loads);
            code.push(opcodes::INVOKESPECIAL);
            push_u16(&mut code, member_index);
            code.push(opcodes::ARETURN);
        }
        RefKind::InvokeInterface => {
            code.extend_from_slice(&loads);
            code.push(opcodes::INVOKEINTERFACE);
            push_u16(&mut code, member_index);
            code.push(args_slots as u8);
            code.push(0);
            code.push(return_op(ret));
        }
        _ => {
            code.extend_from_slice(&loads);
            code.push(kind.opcode());
            push_u16(&mut code, member_index);
            code.push(return_op(ret));
        }
    }

    let pass_need = args_slots + if kind == RefKind::NewInvokeSpecial { 2 } else { 0 };
    let deny_need = deny_stack_need(action, args_slots, ret_slots);
    let max_stack = 2u16
        .max(args_slots + 1)
        .max(pass_need)
        .max(ret_slots)
        .max(deny_need);
    let max_locals = args_slots;

    // One frame at the pass label; locals are the parameters, stack empty.
    let frame: Vec<u8> = if pass <= 63 {
        vec![pass as u8]
    } else {
        vec![251, (pass >> 8) as u8, pass as u8]
    };
    let smt_utf = pool.add_utf8(b"StackMapTable")?;
    let code_utf = pool.add_utf8(b"Code")?;

    let smt_payload_len = 2 + frame.len();
    let code_attr_len = 12 + code.len() + 6 + smt_payload_len;
    if code.len() > i32::MAX as usize {
        return Err(ClassFileError::TooLarge("code attribute"));
    }

    let mut out = ByteBuf::with_capacity(8 + 6 + code_attr_len);
    out.write_u2(PROXY_FLAGS);
    out.write_u2(name_index);
    out.write_u2(desc_index);
    out.write_u2(1); // attributes_count
    out.write_u2(code_utf);
    out.write_u4(code_attr_len as u32);
    out.write_u2(max_stack);
    out.write_u2(max_locals);
    out.write_u4(code.len() as u32);
    out.write_slice(&code);
    out.write_u2(0); // exception_table_length
    out.write_u2(1); // one sub-attribute
    out.write_u2(smt_utf);
    out.write_u4(smt_payload_len as u32);
    out.write_u2(1); // number_of_entries
    out.write_slice(&frame);
    Ok(out.into_vec())
}
