use bitflags::bitflags;

bitflags! {
    /// [Class access and property modifiers](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=77)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    /// [Method access and property modifiers](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=91)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

impl ClassAccessFlags {
    /// Unknown bits are preserved so a re-emitted classfile stays
    /// byte-identical.
    pub fn from_u16(bits: u16) -> ClassAccessFlags {
        ClassAccessFlags::from_bits_retain(bits)
    }
}

impl MethodAccessFlags {
    pub fn from_u16(bits: u16) -> MethodAccessFlags {
        MethodAccessFlags::from_bits_retain(bits)
    }

    /// Whether a `method_info` with these flags carries a `Code` attribute.
    pub fn has_code(self) -> bool {
        !self.intersects(MethodAccessFlags::NATIVE | MethodAccessFlags::ABSTRACT)
    }
}
