//! In-test classfile assembly and decoding.
//!
//! Transformation inputs are real classfiles built byte by byte, so the
//! tests exercise the same binary surface the agent sees at class-load
//! time.

#![allow(dead_code)]

use std::collections::HashMap;

use jclass::buffer::{ByteBuf, Reader};
use jclass::constants::ConstantPool;

/// Minimal classfile assembler: constant pool with value dedup, methods
/// with optional `Code` attributes, no fields.
pub struct TestClass {
    entries: Vec<Vec<u8>>,
    dedup: HashMap<Vec<u8>, u16>,
    pub this_class: u16,
    pub super_class: u16,
    access: u16,
    methods: Vec<Vec<u8>>,
}

pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exceptions: Vec<(u16, u16, u16, u16)>,
    /// `(attribute_name_index, payload)` sub-attributes.
    pub attrs: Vec<(u16, Vec<u8>)>,
}

impl Code {
    pub fn of(code: Vec<u8>) -> Code {
        Code { max_stack: 4, max_locals: 4, code, exceptions: vec![], attrs: vec![] }
    }
}

impl TestClass {
    pub fn new(name: &str) -> TestClass {
        let mut class = TestClass {
            entries: Vec::new(),
            dedup: HashMap::new(),
            this_class: 0,
            super_class: 0,
            access: 0x0021, // PUBLIC | SUPER
            methods: Vec::new(),
        };
        class.this_class = class.class(name);
        class.super_class = class.class("java/lang/Object");
        class
    }

    fn push(&mut self, bytes: Vec<u8>) -> u16 {
        if let Some(&index) = self.dedup.get(&bytes) {
            return index;
        }
        self.entries.push(bytes.clone());
        let index = self.entries.len() as u16;
        self.dedup.insert(bytes, index);
        index
    }

    pub fn utf8(&mut self, s: &[u8]) -> u16 {
        let mut e = vec![1];
        e.extend_from_slice(&(s.len() as u16).to_be_bytes());
        e.extend_from_slice(s);
        self.push(e)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let utf = self.utf8(name.as_bytes());
        let mut e = vec![7];
        e.extend_from_slice(&utf.to_be_bytes());
        self.push(e)
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let n = self.utf8(name.as_bytes());
        let d = self.utf8(descriptor.as_bytes());
        let mut e = vec![12];
        e.extend_from_slice(&n.to_be_bytes());
        e.extend_from_slice(&d.to_be_bytes());
        self.push(e)
    }

    fn member(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(owner);
        let nat = self.name_and_type(name, descriptor);
        let mut e = vec![tag];
        e.extend_from_slice(&class.to_be_bytes());
        e.extend_from_slice(&nat.to_be_bytes());
        self.push(e)
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(10, owner, name, descriptor)
    }

    pub fn interface_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(11, owner, name, descriptor)
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(9, owner, name, descriptor)
    }

    pub fn string_const(&mut self, s: &str) -> u16 {
        let utf = self.utf8(s.as_bytes());
        let mut e = vec![8];
        e.extend_from_slice(&utf.to_be_bytes());
        self.push(e)
    }

    pub fn method_handle(&mut self, kind: u8, reference: u16) -> u16 {
        let mut e = vec![15, kind];
        e.extend_from_slice(&reference.to_be_bytes());
        self.push(e)
    }

    pub fn add_method(&mut self, flags: u16, name: &str, descriptor: &str, code: Option<Code>) {
        let name_index = self.utf8(name.as_bytes());
        let desc_index = self.utf8(descriptor.as_bytes());
        let code_utf = code.as_ref().map(|_| self.utf8(b"Code"));
        let mut m = ByteBuf::new();
        m.write_u2(flags);
        m.write_u2(name_index);
        m.write_u2(desc_index);
        match code {
            None => m.write_u2(0),
            Some(code) => {
                m.write_u2(1);
                m.write_u2(code_utf.unwrap());
                let subs_len: usize = code.attrs.iter().map(|(_, p)| 6 + p.len()).sum();
                let attr_len = 12 + code.code.len() + code.exceptions.len() * 8 + subs_len;
                m.write_u4(attr_len as u32);
                m.write_u2(code.max_stack);
                m.write_u2(code.max_locals);
                m.write_u4(code.code.len() as u32);
                m.write_slice(&code.code);
                m.write_u2(code.exceptions.len() as u16);
                for (start, end, handler, catch) in &code.exceptions {
                    m.write_u2(*start);
                    m.write_u2(*end);
                    m.write_u2(*handler);
                    m.write_u2(*catch);
                }
                m.write_u2(code.attrs.len() as u16);
                for (name, payload) in &code.attrs {
                    m.write_u2(*name);
                    m.write_u4(payload.len() as u32);
                    m.write_slice(payload);
                }
            }
        }
        self.methods.push(m.into_vec());
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = ByteBuf::new();
        out.write_u4(0xCAFE_BABE);
        out.write_u2(0);
        out.write_u2(52);
        out.write_u2(self.entries.len() as u16 + 1);
        for entry in &self.entries {
            out.write_slice(entry);
        }
        out.write_u2(self.access);
        out.write_u2(self.this_class);
        out.write_u2(self.super_class);
        out.write_u2(0); // interfaces
        out.write_u2(0); // fields
        out.write_u2(self.methods.len() as u16);
        for method in &self.methods {
            out.write_slice(method);
        }
        out.write_u2(0); // class attributes
        out.into_vec()
    }
}

pub struct ParsedMethod {
    pub flags: u16,
    pub name: Vec<u8>,
    pub descriptor: Vec<u8>,
    /// The `Code` attribute payload: max_stack, max_locals, code_length,
    /// code, exception table, sub-attributes.
    pub code: Option<Vec<u8>>,
}

impl ParsedMethod {
    pub fn code_bytes(&self) -> &[u8] {
        let payload = self.code.as_ref().expect("method has code");
        let len = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
        &payload[8..8 + len]
    }

    pub fn max_stack(&self) -> u16 {
        let payload = self.code.as_ref().expect("method has code");
        u16::from_be_bytes([payload[0], payload[1]])
    }
}

pub struct ParsedClass {
    pub pool: ConstantPool,
    pub methods: Vec<ParsedMethod>,
}

impl ParsedClass {
    pub fn method(&self, name: &str) -> &ParsedMethod {
        self.methods
            .iter()
            .find(|m| m.name == name.as_bytes())
            .unwrap_or_else(|| panic!("no method named {name}"))
    }
}

/// Decode a (possibly transformed) classfile far enough to inspect its
/// pool and methods; panics on malformed input since this is test-only.
pub fn parse(bytes: &[u8]) -> ParsedClass {
    let mut reader = Reader::new(bytes);
    assert_eq!(reader.read_u4().unwrap(), 0xCAFE_BABE);
    reader.skip(4).unwrap();
    let pool = ConstantPool::decode(&mut reader).unwrap();
    reader.skip(6).unwrap();
    let interfaces = reader.read_u2().unwrap();
    reader.skip(interfaces as usize * 2).unwrap();
    let fields = reader.read_u2().unwrap();
    for _ in 0..fields {
        reader.skip(6).unwrap();
        let attrs = reader.read_u2().unwrap();
        for _ in 0..attrs {
            reader.skip(2).unwrap();
            let len = reader.read_u4().unwrap() as usize;
            reader.skip(len).unwrap();
        }
    }
    let method_count = reader.read_u2().unwrap();
    let mut methods = Vec::new();
    for _ in 0..method_count {
        let flags = reader.read_u2().unwrap();
        let name = pool.utf8(reader.read_u2().unwrap()).unwrap().to_vec();
        let descriptor = pool.utf8(reader.read_u2().unwrap()).unwrap().to_vec();
        let attrs = reader.read_u2().unwrap();
        let mut code = None;
        for _ in 0..attrs {
            let attr_name = pool.utf8(reader.read_u2().unwrap()).unwrap().to_vec();
            let len = reader.read_u4().unwrap() as usize;
            let payload = reader.read_slice(len).unwrap();
            if attr_name == b"Code" {
                code = Some(payload.to_vec());
            }
        }
        methods.push(ParsedMethod { flags, name, descriptor, code });
    }
    ParsedClass { pool, methods }
}
