pub mod access_flags;
/// Big-endian buffers and the modified UTF-8 codec.
pub mod buffer;
/// [The Constant Pool](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=86)
pub mod constants;
/// [Descriptors](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=84)
pub mod descriptors;
pub mod errors;
/// Member references and static-signature synthesis.
pub mod member;
/// [Instruction set](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=412) sizing.
pub mod opcodes;
