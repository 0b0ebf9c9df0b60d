//! The instruction set and its byte encoding.
//!
//! Every instruction is a single opcode byte followed by the operands the
//! opcode declares. Integers are 4-byte little-endian two's complement,
//! floats are 8-byte little-endian IEEE-754 doubles and strings are
//! NUL-terminated UTF-8. Jump targets are absolute byte offsets stored as
//! 4-byte little-endian integers.

use std::fmt::{self, Display, Write};

use crate::vm::{Code, ExecutionError};

/// The kind of an inline operand.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Operand {
    /// A 32-bit signed integer.
    Int,
    /// A 64-bit float.
    Num,
    /// A NUL-terminated string.
    Str,
    /// An absolute jump target.
    Jump,
}

impl Operand {
    /// Returns the encoded width of this operand, or `None` for strings.
    #[must_use]
    pub const fn width(self) -> Option<usize> {
        match self {
            Operand::Int | Operand::Jump => Some(4),
            Operand::Num => Some(8),
            Operand::Str => None,
        }
    }
}

macro_rules! opcodes {
    ($($(#[$meta:meta])* $name:ident $(($($operand:ident),+))? = $byte:literal,)+) => {
        /// A single-byte instruction.
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$meta])* $name = $byte,)+
        }

        impl Opcode {
            /// Every opcode, ordered by its byte value.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),+];

            /// Decodes `byte` into an opcode.
            #[must_use]
            pub const fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$name),)+
                    _ => None,
                }
            }

            /// Returns the operands that follow this opcode in the stream.
            #[must_use]
            pub const fn operands(self) -> &'static [Operand] {
                match self {
                    $(Self::$name => &[$($(Operand::$operand),+)?],)+
                }
            }

            /// Returns the mnemonic of this opcode.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)+
                }
            }
        }
    };
}

opcodes! {
    /// Pushes an `Int`.
    LoadInt(Int) = 0,
    /// Pushes a `Num`.
    LoadNum(Num) = 1,
    /// Pushes a `Str`.
    LoadStr(Str) = 2,
    /// Pushes `true`.
    LoadTrue = 3,
    /// Pushes `false`.
    LoadFalse = 4,
    /// Pushes `null`.
    LoadNull = 5,
    /// Pops the operand count of values and pushes them as an array.
    MakeArray(Int) = 6,
    /// Pops the operand count of key/value pairs and pushes an object.
    MakeObject(Int) = 7,
    /// Creates a closure from a function template.
    LoadFunction(Int) = 8,
    /// Pushes a module from the module table.
    LoadModule(Str) = 9,
    /// Pushes a global builtin.
    LoadName(Str) = 10,
    /// Pushes a local slot.
    LoadLocal(Int) = 11,
    /// Pops into a local slot.
    StoreLocal(Int) = 12,
    /// Pushes a captured variable.
    LoadCapture(Int) = 13,
    /// Pops into a captured variable.
    StoreCapture(Int) = 14,
    /// Calls the value below the operand count of arguments.
    Call(Int) = 15,
    /// Constructs the class below the operand count of arguments.
    New(Int) = 16,
    /// Logical not.
    Not = 17,
    /// Arithmetic negation.
    Neg = 18,
    /// Numeric identity.
    Pos = 19,
    /// Pushes the type name of the popped value.
    TypeOf = 20,
    /// Adds one.
    Inc = 21,
    /// Subtracts one.
    Dec = 22,
    /// Multiplication.
    Mul = 23,
    /// Division.
    Div = 24,
    /// Remainder.
    Mod = 25,
    /// Addition or string concatenation.
    Add = 26,
    /// Subtraction.
    Sub = 27,
    /// Left shift.
    Shl = 28,
    /// Arithmetic right shift.
    Shr = 29,
    /// Bitwise and.
    BitAnd = 30,
    /// Bitwise or.
    BitOr = 31,
    /// Bitwise exclusive or.
    BitXor = 32,
    /// Less than.
    Lt = 33,
    /// Less than or equal.
    Lte = 34,
    /// Greater than.
    Gt = 35,
    /// Greater than or equal.
    Gte = 36,
    /// Equality.
    Eq = 37,
    /// Inequality.
    Ne = 38,
    /// Pops a key and a target and pushes `target[key]`.
    Index = 39,
    /// Pops a value, a key and a target, stores the value and pushes it.
    SetIndex = 40,
    /// Pops a target and pushes the named attribute, binding methods.
    Pluck(Str) = 41,
    /// Jumps unconditionally.
    Jump(Jump) = 42,
    /// Pops the condition and jumps if it is falsey.
    JumpIfFalse(Jump) = 43,
    /// Pops the condition and jumps if it is truthy.
    JumpIfTrue(Jump) = 44,
    /// Jumps keeping the top value if it is falsey, otherwise pops it.
    JumpIfFalseOrPop(Jump) = 45,
    /// Jumps keeping the top value if it is truthy, otherwise pops it.
    JumpIfTrueOrPop(Jump) = 46,
    /// Jumps keeping the top value if it is not null, otherwise pops it.
    JumpIfNotNullOrPop(Jump) = 47,
    /// Jumps keeping the top value if it is not an error, otherwise pops it.
    JumpIfNotErrorOrPop(Jump) = 48,
    /// Duplicates the top value.
    Dup = 49,
    /// Swaps the top two values.
    Rot2 = 50,
    /// Moves the top value below the next two.
    Rot3 = 51,
    /// Moves the top value below the next three.
    Rot4 = 52,
    /// Discards the top value.
    Pop = 53,
    /// Pops the operand count of name/method pairs and pushes a class.
    MakeClass(Str, Int) = 54,
    /// Pops a base class and makes it the base of the class below it.
    ExtendClass = 55,
    /// Pops the operand count of name/value pairs and pushes an enum.
    MakeEnum(Str, Int) = 56,
    /// Pops the operand count of name/value pairs and pushes a module.
    MakeModule(Str, Int) = 57,
    /// Pops a module value and registers it in the module table.
    StoreModule(Str) = 58,
    /// Replaces a settled promise on top of the stack with its value, or
    /// suspends the frame until it settles.
    Await = 59,
    /// Returns the only value on the stack.
    Return = 60,
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Argument<'a> {
    /// An integer operand.
    Int(i32),
    /// A float operand.
    Num(f64),
    /// A string operand.
    Str(&'a str),
    /// A jump target.
    Jump(usize),
}

impl Display for Argument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Int(value) => Display::fmt(value, f),
            Argument::Num(value) => write!(f, "{value:?}"),
            Argument::Str(value) => write!(f, "{value:?}"),
            Argument::Jump(target) => write!(f, "@{target}"),
        }
    }
}

/// Decodes instructions from a bytecode stream.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Returns a reader positioned at `offset`.
    #[must_use]
    pub const fn new(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, offset }
    }

    /// Returns the offset of the next unread byte.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Returns true if every byte has been read.
    #[must_use]
    pub const fn is_at_end(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ExecutionError> {
        let bytes = self
            .bytes
            .get(self.offset..self.offset + N)
            .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
            .ok_or(ExecutionError::TruncatedInstruction {
                offset: self.offset,
            })?;
        self.offset += N;
        Ok(bytes)
    }

    /// Reads an opcode.
    pub fn opcode(&mut self) -> Result<Opcode, ExecutionError> {
        let offset = self.offset;
        let [byte] = self.take::<1>()?;
        Opcode::from_byte(byte).ok_or(ExecutionError::InvalidOpcode { offset, byte })
    }

    /// Reads a 4-byte integer.
    pub fn int(&mut self) -> Result<i32, ExecutionError> {
        self.take().map(i32::from_le_bytes)
    }

    /// Reads an 8-byte float.
    pub fn num(&mut self) -> Result<f64, ExecutionError> {
        self.take().map(f64::from_le_bytes)
    }

    /// Reads a jump target.
    pub fn jump(&mut self) -> Result<usize, ExecutionError> {
        self.take()
            .map(|bytes| u32::from_le_bytes(bytes) as usize)
    }

    /// Reads a NUL-terminated string.
    pub fn str(&mut self) -> Result<&'a str, ExecutionError> {
        let start = self.offset;
        let remaining = self.bytes.get(start..).unwrap_or_default();
        let length = remaining
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(ExecutionError::TruncatedInstruction { offset: start })?;
        let text = std::str::from_utf8(&remaining[..length])
            .map_err(|_| ExecutionError::InvalidString { offset: start })?;
        self.offset = start + length + 1;
        Ok(text)
    }

    /// Reads an operand of `kind`.
    pub fn argument(&mut self, kind: Operand) -> Result<Argument<'a>, ExecutionError> {
        match kind {
            Operand::Int => self.int().map(Argument::Int),
            Operand::Num => self.num().map(Argument::Num),
            Operand::Str => self.str().map(Argument::Str),
            Operand::Jump => self.jump().map(Argument::Jump),
        }
    }
}

/// An error encoding an instruction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EncodeError {
    /// A string operand contained a NUL byte.
    NulInString,
    /// A jump target does not fit in the operand.
    OffsetTooLarge,
    /// An operand was not of the kind the opcode declares.
    OperandMismatch(Opcode),
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::NulInString => f.write_str("strings cannot contain NUL bytes"),
            EncodeError::OffsetTooLarge => f.write_str("function body is too large"),
            EncodeError::OperandMismatch(op) => write!(f, "invalid operands for {op}"),
        }
    }
}

/// The location of a jump operand waiting for its target.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[must_use]
pub struct PatchSite(usize);

/// Maps an instruction offset to the source line it was compiled from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LineEntry {
    /// The offset of the first instruction of the run.
    pub offset: usize,
    /// The 1-based source line.
    pub line: usize,
}

/// Builds a bytecode stream and its line table.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    bytes: Vec<u8>,
    lines: Vec<LineEntry>,
    line: usize,
}

impl BytecodeBuilder {
    /// Sets the source line attributed to instructions emitted next.
    pub fn set_line(&mut self, line: usize) {
        self.line = line;
    }

    /// Returns the offset the next instruction will be written at.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    fn begin(&mut self, op: Opcode) {
        if self.lines.last().map_or(true, |entry| entry.line != self.line) {
            self.lines.push(LineEntry {
                offset: self.bytes.len(),
                line: self.line,
            });
        }
        self.bytes.push(op as u8);
    }

    /// Emits an instruction with the given operands.
    pub fn emit_with(&mut self, op: Opcode, args: &[Argument<'_>]) -> Result<(), EncodeError> {
        let kinds = op.operands();
        if kinds.len() != args.len() {
            return Err(EncodeError::OperandMismatch(op));
        }
        for (kind, arg) in kinds.iter().zip(args) {
            match (kind, arg) {
                (Operand::Str, Argument::Str(text)) if text.as_bytes().contains(&0) => {
                    return Err(EncodeError::NulInString);
                }
                (Operand::Jump, Argument::Jump(target)) if u32::try_from(*target).is_err() => {
                    return Err(EncodeError::OffsetTooLarge);
                }
                (Operand::Int, Argument::Int(_))
                | (Operand::Num, Argument::Num(_))
                | (Operand::Str, Argument::Str(_))
                | (Operand::Jump, Argument::Jump(_)) => {}
                _ => return Err(EncodeError::OperandMismatch(op)),
            }
        }

        self.begin(op);
        for arg in args {
            match arg {
                Argument::Int(value) => self.bytes.extend_from_slice(&value.to_le_bytes()),
                Argument::Num(value) => self.bytes.extend_from_slice(&value.to_le_bytes()),
                Argument::Str(text) => {
                    self.bytes.extend_from_slice(text.as_bytes());
                    self.bytes.push(0);
                }
                Argument::Jump(target) => {
                    let target = u32::try_from(*target).unwrap_or(u32::MAX);
                    self.bytes.extend_from_slice(&target.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Emits an instruction without operands.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(op.operands().is_empty(), "{op} requires operands");
        self.begin(op);
    }

    /// Emits an instruction with an integer operand.
    pub fn emit_int(&mut self, op: Opcode, value: i32) {
        debug_assert_eq!(op.operands(), &[Operand::Int]);
        self.begin(op);
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Emits an instruction with a float operand.
    pub fn emit_num(&mut self, op: Opcode, value: f64) {
        debug_assert_eq!(op.operands(), &[Operand::Num]);
        self.begin(op);
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Emits an instruction with a string operand.
    pub fn emit_str(&mut self, op: Opcode, text: &str) -> Result<(), EncodeError> {
        self.emit_with(op, &[Argument::Str(text)])
    }

    /// Emits a jump whose target is patched later.
    pub fn emit_jump(&mut self, op: Opcode) -> PatchSite {
        debug_assert_eq!(op.operands(), &[Operand::Jump]);
        self.begin(op);
        let site = PatchSite(self.bytes.len());
        self.bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        site
    }

    /// Emits a jump to a known target.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) -> Result<(), EncodeError> {
        let site = self.emit_jump(op);
        self.patch(site, target)
    }

    /// Points the jump at `site` to `target`.
    pub fn patch(&mut self, site: PatchSite, target: usize) -> Result<(), EncodeError> {
        let target = u32::try_from(target).map_err(|_| EncodeError::OffsetTooLarge)?;
        self.bytes[site.0..site.0 + 4].copy_from_slice(&target.to_le_bytes());
        Ok(())
    }

    /// Points the jump at `site` to the next instruction emitted.
    pub fn patch_here(&mut self, site: PatchSite) -> Result<(), EncodeError> {
        self.patch(site, self.offset())
    }

    /// Returns the encoded bytes and the line table.
    #[must_use]
    pub fn finish(self) -> (Vec<u8>, Vec<LineEntry>) {
        (self.bytes, self.lines)
    }
}

/// Returns the line for the instruction at `offset` in `lines`.
#[must_use]
pub fn line_for(lines: &[LineEntry], offset: usize) -> usize {
    let index = lines.partition_point(|entry| entry.offset <= offset);
    index
        .checked_sub(1)
        .and_then(|index| lines.get(index))
        .map_or(0, |entry| entry.line)
}

/// Writes a listing of `code` to `out`.
pub fn disassemble(code: &Code, out: &mut impl Write) -> fmt::Result {
    writeln!(
        out,
        "{}{} ({} params, {} locals, {} captures) in {}",
        if code.is_async() { "async " } else { "" },
        code.name(),
        code.params(),
        code.locals().len(),
        code.captures().len(),
        code.file(),
    )?;
    let mut reader = Reader::new(code.bytecode(), 0);
    let mut last_line = None;
    while !reader.is_at_end() {
        let offset = reader.offset();
        let line = code.line_for(offset);
        if last_line == Some(line) {
            write!(out, "      ")?;
        } else {
            write!(out, "{line:>5} ")?;
            last_line = Some(line);
        }
        let op = match reader.opcode() {
            Ok(op) => op,
            Err(err) => {
                writeln!(out, "{offset:>6}  <{err}>")?;
                break;
            }
        };
        write!(out, "{offset:>6}  {op}")?;
        for kind in op.operands() {
            match reader.argument(*kind) {
                Ok(arg) => write!(out, " {arg}")?,
                Err(err) => {
                    writeln!(out, " <{err}>")?;
                    return Ok(());
                }
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{line_for, Argument, BytecodeBuilder, EncodeError, LineEntry, Opcode, Reader};
    use crate::vm::ExecutionError;

    #[test]
    fn opcode_bytes_are_dense() {
        for (index, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(usize::from(*op as u8), index);
            assert_eq!(Opcode::from_byte(*op as u8), Some(*op));
        }
        assert_eq!(Opcode::from_byte(255), None);
    }

    #[test]
    fn operands_are_little_endian() {
        let mut builder = BytecodeBuilder::default();
        builder.emit_int(Opcode::LoadInt, 0x0102_0304);
        builder.emit_num(Opcode::LoadNum, 1.5);
        builder.emit_str(Opcode::Pluck, "len").unwrap();
        let (bytes, _) = builder.finish();

        assert_eq!(&bytes[..5], &[0, 4, 3, 2, 1]);
        assert_eq!(&bytes[6..14], &1.5_f64.to_le_bytes());
        assert_eq!(&bytes[14..], b")len\0");

        let mut reader = Reader::new(&bytes, 0);
        assert_eq!(reader.opcode(), Ok(Opcode::LoadInt));
        assert_eq!(reader.int(), Ok(0x0102_0304));
        assert_eq!(reader.opcode(), Ok(Opcode::LoadNum));
        assert_eq!(reader.num(), Ok(1.5));
        assert_eq!(reader.opcode(), Ok(Opcode::Pluck));
        assert_eq!(reader.str(), Ok("len"));
        assert!(reader.is_at_end());
    }

    #[test]
    fn jumps_are_back_patched() {
        let mut builder = BytecodeBuilder::default();
        builder.emit(Opcode::LoadTrue);
        let site = builder.emit_jump(Opcode::JumpIfFalse);
        builder.emit(Opcode::LoadNull);
        builder.patch_here(site).unwrap();
        builder.emit(Opcode::Return);
        let (bytes, _) = builder.finish();

        let mut reader = Reader::new(&bytes, 1);
        assert_eq!(reader.opcode(), Ok(Opcode::JumpIfFalse));
        assert_eq!(reader.jump(), Ok(7));
        assert_eq!(bytes[7], Opcode::Return as u8);
    }

    #[test]
    fn nul_in_strings_is_rejected() {
        let mut builder = BytecodeBuilder::default();
        assert_eq!(
            builder.emit_str(Opcode::LoadStr, "a\0b"),
            Err(EncodeError::NulInString)
        );
        assert_eq!(builder.offset(), 0);
        assert_eq!(
            builder.emit_with(Opcode::MakeClass, &[Argument::Str("A")]),
            Err(EncodeError::OperandMismatch(Opcode::MakeClass))
        );
    }

    #[test]
    fn malformed_streams() {
        let mut reader = Reader::new(&[0xFE], 0);
        assert_eq!(
            reader.opcode(),
            Err(ExecutionError::InvalidOpcode {
                offset: 0,
                byte: 0xFE
            })
        );

        let mut reader = Reader::new(&[Opcode::LoadInt as u8, 1, 2], 0);
        assert_eq!(reader.opcode(), Ok(Opcode::LoadInt));
        assert_eq!(
            reader.int(),
            Err(ExecutionError::TruncatedInstruction { offset: 1 })
        );

        let mut reader = Reader::new(b"abc", 0);
        assert_eq!(
            reader.str(),
            Err(ExecutionError::TruncatedInstruction { offset: 0 })
        );
    }

    #[test]
    fn line_lookup() {
        let lines = [
            LineEntry { offset: 0, line: 1 },
            LineEntry { offset: 6, line: 3 },
            LineEntry {
                offset: 20,
                line: 4,
            },
        ];
        assert_eq!(line_for(&lines, 0), 1);
        assert_eq!(line_for(&lines, 5), 1);
        assert_eq!(line_for(&lines, 6), 3);
        assert_eq!(line_for(&lines, 100), 4);
        assert_eq!(line_for(&[], 3), 0);
    }
}
