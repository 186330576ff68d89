//! End-to-end transformation tests over synthetic classfiles.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use boxtin::agent::{Controller, LoaderKind};
use boxtin::builder::RulesBuilder;
use boxtin::finder::{MapIndex, ModuleId};
use boxtin::processor::{seal, ClassFileProcessor};
use boxtin::rules::Rules;
use jclass::buffer::ByteBuf;
use jclass::opcodes as op;

use common::{parse, Code, TestClass};

const ICONST_1: u8 = 0x04;
const ALOAD_0: u8 = 0x2A;
const PROXY_FLAGS: u16 = 0x0002 | 0x0008 | 0x1000;

fn deny_exit() -> Rules {
    let mut b = RulesBuilder::allow_all();
    b.for_package("java.lang").for_class("System").deny_method("exit");
    b.build()
}

fn invoke(opcode: u8, index: u16) -> Vec<u8> {
    let mut code = vec![opcode];
    code.extend_from_slice(&index.to_be_bytes());
    code
}

/// A caller class whose `run()V` exits the VM.
fn exit_caller() -> (Vec<u8>, u16) {
    let mut class = TestClass::new("caller/Main");
    let exit = class.method_ref("java/lang/System", "exit", "(I)V");
    let mut code = vec![ICONST_1];
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(op::RETURN);
    class.add_method(0x0001, "run", "()V", Some(Code::of(code)));
    (class.build(), exit)
}

#[test]
fn transparency_on_allow() {
    let (bytes, _) = exit_caller();
    let rules = RulesBuilder::allow_all().build();
    let result = ClassFileProcessor::new(&bytes).transform(&rules).unwrap();
    assert!(result.is_none(), "nothing denied, nothing changed");
}

#[test]
fn denied_exit_is_rerouted_through_a_proxy() {
    let (bytes, exit) = exit_caller();
    let out = ClassFileProcessor::new(&bytes)
        .transform(&deny_exit())
        .unwrap()
        .expect("a denied call forces a rewrite");
    let parsed = parse(&out);
    assert_eq!(parsed.methods.len(), 2, "one proxy appended");

    let run = parsed.method("run");
    let code = run.code_bytes();
    assert_eq!(code[0], ICONST_1);
    assert_eq!(code[1], op::INVOKESTATIC);
    let proxy_ref = u16::from_be_bytes([code[2], code[3]]);
    assert_ne!(proxy_ref, exit);
    assert_eq!(code[4], op::RETURN);
    assert_eq!(code.len(), 5, "caller-side rewrite preserves code length");

    // The proxy is private static synthetic, named `$<digits>`, with the
    // receiver-lifted descriptor, and replays the original invocation.
    let member = parsed.pool.member_ref(proxy_ref).unwrap();
    assert_eq!(member.owner_class(), b"caller/Main");
    assert_eq!(member.descriptor(), b"(I)V");
    assert_eq!(member.name()[0], b'$');
    let proxy = &parsed.methods[1];
    assert_eq!(proxy.flags, PROXY_FLAGS);
    let proxy_code = proxy.code_bytes();
    assert_eq!(proxy_code[0], op::LDC_W);
    assert!(proxy_code.contains(&op::ATHROW));
    let original = invoke(op::INVOKESTATIC, exit);
    assert!(
        proxy_code.windows(3).any(|w| w == original.as_slice()),
        "proxy replays the original invokestatic"
    );
}

#[test]
fn repeated_sites_share_one_proxy_and_distinct_pairs_get_their_own() {
    let mut class = TestClass::new("caller/Main");
    let exit = class.method_ref("java/lang/System", "exit", "(I)V");
    let halt = class.method_ref("java/lang/Runtime", "halt", "(I)V");
    let mut code = vec![ICONST_1];
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(ICONST_1);
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(ICONST_1);
    code.extend_from_slice(&invoke(op::INVOKEVIRTUAL, halt));
    code.push(op::RETURN);
    class.add_method(0x0001, "run", "()V", Some(Code::of(code)));
    let bytes = class.build();

    let mut b = RulesBuilder::allow_all();
    b.for_package("java.lang").for_class("System").deny_method("exit");
    b.for_package("java.lang").for_class("Runtime").deny_method("halt");
    let out = ClassFileProcessor::new(&bytes)
        .transform(&b.build())
        .unwrap()
        .unwrap();
    let parsed = parse(&out);
    assert_eq!(parsed.methods.len(), 3, "two distinct pairs, two proxies");

    let code = parsed.method("run").code_bytes();
    let first = u16::from_be_bytes([code[2], code[3]]);
    let second = u16::from_be_bytes([code[6], code[7]]);
    assert_eq!(first, second, "repeated occurrences reuse the same proxy");
    let third = u16::from_be_bytes([code[10], code[11]]);
    assert_ne!(first, third);
}

#[test]
fn clinit_is_never_rewritten() {
    let mut class = TestClass::new("caller/Init");
    let exit = class.method_ref("java/lang/System", "exit", "(I)V");
    let mut code = vec![ICONST_1];
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(op::RETURN);
    class.add_method(0x0008, "<clinit>", "()V", Some(Code::of(code.clone())));
    class.add_method(0x0001, "run", "()V", Some(Code::of(code)));
    let bytes = class.build();

    let out = ClassFileProcessor::new(&bytes)
        .transform(&deny_exit())
        .unwrap()
        .unwrap();
    let parsed = parse(&out);
    assert_eq!(parsed.methods.len(), 3);
    let clinit = parsed.method("<clinit>").code_bytes();
    assert_eq!(
        u16::from_be_bytes([clinit[2], clinit[3]]),
        exit,
        "the initializer still calls the original"
    );
    let run = parsed.method("run").code_bytes();
    assert_ne!(u16::from_be_bytes([run[2], run[3]]), exit);
}

fn target_rules() -> Rules {
    let mut b = RulesBuilder::allow_all();
    b.for_package("lib")
        .for_class("Service")
        .target_checked()
        .deny_method("stop");
    b.build()
}

#[test]
fn target_prologue_and_side_table_shift() {
    let mut class = TestClass::new("lib/Service");
    let lnt = class.utf8(b"LineNumberTable");
    let smt = class.utf8(b"StackMapTable");
    let mut lnt_payload = ByteBuf::new();
    lnt_payload.write_u2(1);
    lnt_payload.write_u2(0); // start_pc
    lnt_payload.write_u2(17); // line
    // First frame: same_frame at offset 60, exactly at the edge the
    // 20-byte shift pushes out of the compact range.
    let smt_payload = vec![0, 1, 60];
    let code = Code {
        max_stack: 1,
        max_locals: 1,
        code: vec![op::NOP, op::NOP, op::NOP, op::RETURN],
        exceptions: vec![(0, 3, 3, 0), (2, 0xFFFE, 3, 0)],
        attrs: vec![(lnt, lnt_payload.into_vec()), (smt, smt_payload)],
    };
    class.add_method(0x0001, "stop", "()V", Some(code));
    class.add_method(0x0001, "go", "()V", Some(Code::of(vec![op::RETURN])));
    let bytes = class.build();

    let out = ClassFileProcessor::new(&bytes)
        .transform(&target_rules())
        .unwrap()
        .unwrap();
    let parsed = parse(&out);
    assert_eq!(parsed.methods.len(), 2, "no proxies for target-side checks");

    let stop = parsed.method("stop");
    let code = stop.code_bytes();
    assert_eq!(code.len(), 4 + 20, "named-method prologue is 20 bytes");
    assert_eq!(code[0], op::GETSTATIC);
    assert_eq!(code[3], op::INVOKEVIRTUAL);
    assert_eq!(code[6], op::LDC_W);
    assert_eq!(code[9], op::LDC_W, "method name is passed to the check");
    assert_eq!(code[15], op::INVOKESTATIC);
    assert_eq!(code[18], op::NOP);
    assert_eq!(code[19], op::NOP);
    assert_eq!(&code[20..], &[op::NOP, op::NOP, op::NOP, op::RETURN]);
    assert_eq!(stop.max_stack(), 4, "prologue pushes up to four references");

    // Exception table pcs shifted by 20, saturating at 0xFFFF.
    let payload = stop.code.as_ref().unwrap();
    let exc_at = 8 + code.len();
    let exc_count = u16::from_be_bytes([payload[exc_at], payload[exc_at + 1]]);
    assert_eq!(exc_count, 2);
    let entry = &payload[exc_at + 2..exc_at + 10];
    assert_eq!(entry, &[0, 20, 0, 23, 0, 23, 0, 0]);
    let entry = &payload[exc_at + 10..exc_at + 18];
    assert_eq!(entry, &[0, 22, 0xFF, 0xFF, 0, 23, 0, 0]);

    // LineNumberTable start shifted; stack map frame promoted to
    // same_frame_extended with offset 80 and two extra payload bytes.
    let subs_at = exc_at + 2 + 16 + 2;
    let lnt_payload = &payload[subs_at + 6..subs_at + 6 + 6];
    assert_eq!(lnt_payload, &[0, 1, 0, 20, 0, 17]);
    let smt_header = &payload[subs_at + 12..subs_at + 18];
    let smt_len = u32::from_be_bytes([smt_header[2], smt_header[3], smt_header[4], smt_header[5]]);
    assert_eq!(smt_len, 5, "attribute length grew by exactly 2");
    let smt_payload = &payload[subs_at + 18..subs_at + 18 + 5];
    assert_eq!(smt_payload, &[0, 1, 251, 0, 80]);

    // The sibling method is untouched.
    assert_eq!(parsed.method("go").code_bytes(), &[op::RETURN]);
}

#[test]
fn constructor_prologue_passes_null_name() {
    let mut class = TestClass::new("lib/Widget");
    let super_init = class.method_ref("java/lang/Object", "<init>", "()V");
    let mut code = vec![ALOAD_0];
    code.extend_from_slice(&invoke(op::INVOKESPECIAL, super_init));
    code.push(op::RETURN);
    class.add_method(0x0001, "<init>", "()V", Some(Code::of(code)));
    let bytes = class.build();

    let mut b = RulesBuilder::allow_all();
    b.for_package("lib").for_class("Widget").target_checked().deny_constructors();
    let out = ClassFileProcessor::new(&bytes)
        .transform(&b.build())
        .unwrap()
        .unwrap();
    let parsed = parse(&out);
    let init = parsed.method("<init>").code_bytes();
    assert_eq!(init.len(), 5 + 16, "constructor prologue is 16 bytes");
    assert_eq!(init[0], op::GETSTATIC);
    assert_eq!(init[9], op::ACONST_NULL);
    assert_eq!(init[16], ALOAD_0, "original body follows the prologue");
}

#[test]
fn caller_rewrite_applies_inside_the_shifted_window() {
    let mut class = TestClass::new("lib/Service");
    let exit = class.method_ref("java/lang/System", "exit", "(I)V");
    let mut code = vec![ICONST_1];
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(op::RETURN);
    class.add_method(0x0001, "stop", "()V", Some(Code::of(code)));
    let bytes = class.build();

    let mut b = RulesBuilder::allow_all();
    b.for_package("java.lang").for_class("System").deny_method("exit");
    b.for_package("lib").for_class("Service").target_checked().deny_method("stop");
    let out = ClassFileProcessor::new(&bytes)
        .transform(&b.build())
        .unwrap()
        .unwrap();
    let parsed = parse(&out);
    assert_eq!(parsed.methods.len(), 2);
    let code = parsed.method("stop").code_bytes();
    assert_eq!(code[0], op::GETSTATIC);
    assert_eq!(code[20], ICONST_1);
    assert_eq!(code[21], op::INVOKESTATIC);
    let proxy_ref = u16::from_be_bytes([code[22], code[23]]);
    assert_ne!(proxy_ref, exit, "the shifted call site goes through the proxy");
}

#[test]
fn method_handle_constant_is_rewritten() {
    let mut class = TestClass::new("caller/Lambda");
    let exit = class.method_ref("java/lang/System", "exit", "(I)V");
    let handle = class.method_handle(6, exit); // REF_invokeStatic
    class.add_method(0x0001, "run", "()V", Some(Code::of(vec![op::RETURN])));
    let bytes = class.build();

    let out = ClassFileProcessor::new(&bytes)
        .transform(&deny_exit())
        .unwrap()
        .expect("a denied handle constant forces a rewrite");
    let parsed = parse(&out);
    let (kind, reference) = parsed.pool.method_handle(handle).unwrap();
    assert_eq!(kind, 6, "the patched handle is an invokestatic handle");
    assert_ne!(reference, exit);
    let proxy = parsed.pool.member_ref(reference).unwrap();
    assert_eq!(proxy.owner_class(), b"caller/Lambda");
    assert_eq!(proxy.name()[0], b'$');
    assert_eq!(parsed.methods.len(), 2, "the handle's proxy is appended");
}

#[test]
fn interface_invoke_keeps_instruction_length() {
    let mut class = TestClass::new("caller/Main");
    let close = class.interface_method_ref("java/io/Closeable", "close", "()V");
    let mut code = vec![op::ACONST_NULL, op::INVOKEINTERFACE];
    code.extend_from_slice(&close.to_be_bytes());
    code.push(1);
    code.push(0);
    code.push(op::RETURN);
    class.add_method(0x0001, "run", "()V", Some(Code::of(code.clone())));
    let bytes = class.build();

    let mut b = RulesBuilder::allow_all();
    b.for_package("java.io").for_class("Closeable").deny_method("close");
    let out = ClassFileProcessor::new(&bytes)
        .transform(&b.build())
        .unwrap()
        .unwrap();
    let parsed = parse(&out);
    let rewritten = parsed.method("run").code_bytes();
    assert_eq!(rewritten.len(), code.len());
    assert_eq!(rewritten[1], op::INVOKESTATIC);
    assert_eq!(&rewritten[4..6], &[op::NOP, op::NOP]);
    assert_eq!(rewritten[6], op::RETURN);
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn controller_skips_bootstrap_and_trusted() {
    init_logging();
    let (bytes, _) = exit_caller();
    let mut controller = Controller::new(deny_exit(), Arc::new(MapIndex::default()));
    let trusted = ModuleId::new("trusted.app");
    controller.trust(trusted.clone());
    let untrusted = ModuleId::new("app");

    assert!(controller.transform(&bytes, &untrusted, LoaderKind::Bootstrap).is_none());
    assert!(controller.transform(&bytes, &trusted, LoaderKind::Defined(7)).is_none());
    assert!(controller.transform(&bytes, &untrusted, LoaderKind::Defined(7)).is_some());
}

#[test]
fn failed_transformation_substitutes_a_sealed_class() {
    // The method body holds an opcode no classfile may contain: the
    // rewriter's scan fails, and the controller seals the class instead of
    // passing it through.
    init_logging();
    let mut class = TestClass::new("caller/Broken");
    let mut code = Code::of(vec![0xCB, op::RETURN]);
    code.max_stack = 1;
    class.add_method(0x0001, "run", "()V", Some(code));
    let bytes = class.build();

    let controller = Controller::new(deny_exit(), Arc::new(MapIndex::default()));
    let module = ModuleId::new("app");
    let sealed = controller
        .transform(&bytes, &module, LoaderKind::Defined(7))
        .expect("fail-secure substitution, not pass-through");
    let parsed = parse(&sealed);
    let run = parsed.method("run").code_bytes();
    assert_eq!(run.len(), 8);
    assert_eq!(run[0], op::NEW);
    assert_eq!(run[7], op::ATHROW);
}

#[test]
fn sealed_class_throws_from_every_method() {
    let mut class = TestClass::new("caller/Main");
    let exit = class.method_ref("java/lang/System", "exit", "(I)V");
    let mut code = vec![ICONST_1];
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(op::RETURN);
    class.add_method(0x0001, "run", "()V", Some(Code::of(code)));
    class.add_method(0x0008, "<clinit>", "()V", Some(Code::of(vec![op::RETURN])));
    let bytes = class.build();

    let sealed = seal(&bytes).unwrap();
    let parsed = parse(&sealed);
    assert_eq!(parsed.methods.len(), 2, "sealing appends nothing");
    for method in &parsed.methods {
        let code = method.code_bytes();
        assert_eq!(code.len(), 8);
        assert_eq!(code[0], op::NEW);
        assert_eq!(code[3], op::DUP);
        assert_eq!(code[4], op::INVOKESPECIAL);
        assert_eq!(code[7], op::ATHROW);
        assert_eq!(method.max_stack(), 2);
        let exception = parsed.pool.class_name(u16::from_be_bytes([code[1], code[2]])).unwrap();
        assert_eq!(exception, b"java/lang/SecurityException");
    }
}

#[test]
fn transform_is_reentrant_on_arbitrary_buffers() {
    // Hidden-class interception re-enters the processor while another
    // transformation is conceptually in flight; processors are per-call
    // values, so two interleaved transforms must not disturb each other.
    let (outer, _) = exit_caller();
    let mut inner_class = TestClass::new("hidden/Body");
    let exit = inner_class.method_ref("java/lang/System", "exit", "(I)V");
    let mut code = vec![ICONST_1];
    code.extend_from_slice(&invoke(op::INVOKESTATIC, exit));
    code.push(op::RETURN);
    inner_class.add_method(0x0001, "call", "()V", Some(Code::of(code)));
    let inner = inner_class.build();

    let rules = deny_exit();
    let outer_result = ClassFileProcessor::new(&outer).transform(&rules).unwrap().unwrap();
    let inner_result = ClassFileProcessor::new(&inner).transform(&rules).unwrap().unwrap();
    assert_eq!(parse(&outer_result).methods.len(), 2);
    assert_eq!(parse(&inner_result).methods.len(), 2);
}
