//! The `.tmbdlc` binary container.
//!
//! Big-endian, byte-oriented layout:
//!
//! ```text
//! magic "TMBDL" (5 bytes), version u8
//! functionCount u32
//! function[0..functionCount]
//! mainIndex u32
//!
//! function: name (u32 length + UTF-8), arity u16, upvalueCount u16,
//!           constantCount u32, constant..., codeLength u32, code bytes,
//!           lineCount u32, line u16 each
//! constant: tag u8 (0 null | 1 bool | 2 number | 3 string | 4 function)
//! ```
//!
//! Functions are flattened depth-first from the main chunk, parents before
//! children, so function-constant references always point to a strictly
//! larger index. Deserialization reads placeholder indices first and fixes
//! up real references walking the table in reverse.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::chunk::{BytecodeFunction, Chunk};
use crate::lang::value::Value;

pub const MAGIC: &[u8; 5] = b"TMBDL";
pub const VERSION: u8 = 1;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_NUMBER: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_FUNCTION: u8 = 0x04;

/// Container-level failures. Mismatched magic or version, truncation,
/// unknown tags and bad references are all hard errors; there is no
/// forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    BadMagic,
    UnsupportedVersion { found: u8 },
    Truncated { reading: &'static str },
    UnknownConstantTag { tag: u8 },
    BadFunctionRef { index: u32, count: u32 },
    BadMainIndex { index: u32, count: u32 },
    LineTableMismatch,
    TrailingBytes,
    InvalidUtf8,
    UnserializableConstant { type_name: &'static str },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt bytecode: ")?;
        match self {
            FormatError::BadMagic => write!(f, "bad magic"),
            FormatError::UnsupportedVersion { found } => {
                write!(f, "unsupported version {}", found)
            }
            FormatError::Truncated { reading } => {
                write!(f, "truncated input while reading {}", reading)
            }
            FormatError::UnknownConstantTag { tag } => {
                write!(f, "unknown constant tag 0x{:02X}", tag)
            }
            FormatError::BadFunctionRef { index, count } => {
                write!(f, "function reference {} out of range ({})", index, count)
            }
            FormatError::BadMainIndex { index, count } => {
                write!(f, "main index {} out of range ({})", index, count)
            }
            FormatError::LineTableMismatch => {
                write!(f, "line table length does not match code length")
            }
            FormatError::TrailingBytes => write!(f, "trailing bytes after container"),
            FormatError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            FormatError::UnserializableConstant { type_name } => {
                write!(f, "cannot serialize a {} constant", type_name)
            }
        }
    }
}

impl std::error::Error for FormatError {}

// =============================================================================
// Serialization
// =============================================================================

/// Flatten a main chunk and every nested function into container bytes.
pub fn serialize(chunk: &Chunk) -> Result<Vec<u8>, FormatError> {
    let mut nested: Vec<Rc<BytecodeFunction>> = Vec::new();
    let mut indices: HashMap<*const BytecodeFunction, u32> = HashMap::new();
    collect_functions(chunk, &mut nested, &mut indices);

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    write_u32(&mut out, 1 + nested.len() as u32);

    // Function 0 is the main chunk under a synthetic name.
    write_function(&mut out, "<main>", 0, 0, chunk, &indices)?;
    for function in &nested {
        write_function(
            &mut out,
            &function.name,
            function.arity,
            function.upvalue_count,
            &function.chunk,
            &indices,
        )?;
    }
    write_u32(&mut out, 0); // main index
    Ok(out)
}

/// Depth-first, pre-order index assignment; index 0 is reserved for main.
fn collect_functions(
    chunk: &Chunk,
    nested: &mut Vec<Rc<BytecodeFunction>>,
    indices: &mut HashMap<*const BytecodeFunction, u32>,
) {
    for constant in &chunk.constants {
        if let Value::Function(function) = constant {
            let key = Rc::as_ptr(function);
            if indices.contains_key(&key) {
                continue;
            }
            indices.insert(key, 1 + nested.len() as u32);
            nested.push(function.clone());
            collect_functions(&function.chunk, nested, indices);
        }
    }
}

fn write_function(
    out: &mut Vec<u8>,
    name: &str,
    arity: u16,
    upvalue_count: u16,
    chunk: &Chunk,
    indices: &HashMap<*const BytecodeFunction, u32>,
) -> Result<(), FormatError> {
    write_string(out, name);
    write_u16(out, arity);
    write_u16(out, upvalue_count);
    write_u32(out, chunk.constants.len() as u32);
    for constant in &chunk.constants {
        match constant {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Value::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Value::Str(s) => {
                out.push(TAG_STRING);
                write_string(out, s);
            }
            Value::Function(function) => {
                out.push(TAG_FUNCTION);
                write_u32(out, indices[&Rc::as_ptr(function)]);
            }
            other => {
                return Err(FormatError::UnserializableConstant {
                    type_name: other.type_name(),
                })
            }
        }
    }
    write_u32(out, chunk.code.len() as u32);
    out.extend_from_slice(&chunk.code);
    write_u32(out, chunk.lines.len() as u32);
    for line in &chunk.lines {
        write_u16(out, (*line).min(u16::MAX as u32) as u16);
    }
    Ok(())
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

// =============================================================================
// Deserialization
// =============================================================================

enum RawConst {
    Literal(Value),
    FnRef(u32),
}

struct RawFunction {
    name: String,
    arity: u16,
    upvalue_count: u16,
    constants: Vec<RawConst>,
    code: Vec<u8>,
    lines: Vec<u32>,
}

/// Reconstruct the main chunk from container bytes.
pub fn deserialize(bytes: &[u8]) -> Result<Chunk, FormatError> {
    let mut reader = Reader { bytes, pos: 0 };

    let magic = reader.take(MAGIC.len(), "magic")?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = reader.u8("version")?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion { found: version });
    }

    let count = reader.u32("function count")?;
    let mut raw = Vec::new();
    for _ in 0..count {
        raw.push(read_function(&mut reader)?);
    }
    let main_index = reader.u32("main index")?;
    if main_index >= count {
        return Err(FormatError::BadMainIndex {
            index: main_index,
            count,
        });
    }
    if reader.pos != bytes.len() {
        return Err(FormatError::TrailingBytes);
    }

    // Fix up function references back-to-front: references only point
    // forward, so every referenced function is already built.
    let mut built: Vec<Option<Rc<BytecodeFunction>>> = (0..count).map(|_| None).collect();
    for i in (0..count as usize).rev() {
        let raw_fn = &raw[i];
        let mut constants = Vec::with_capacity(raw_fn.constants.len());
        for constant in &raw_fn.constants {
            match constant {
                RawConst::Literal(value) => constants.push(value.clone()),
                RawConst::FnRef(j) => {
                    if *j as usize <= i || *j >= count {
                        return Err(FormatError::BadFunctionRef { index: *j, count });
                    }
                    let function = built[*j as usize]
                        .clone()
                        .ok_or(FormatError::BadFunctionRef { index: *j, count })?;
                    constants.push(Value::Function(function));
                }
            }
        }
        built[i] = Some(Rc::new(BytecodeFunction {
            name: raw_fn.name.clone(),
            arity: raw_fn.arity,
            upvalue_count: raw_fn.upvalue_count,
            chunk: Chunk {
                code: raw_fn.code.clone(),
                constants,
                lines: raw_fn.lines.clone(),
            },
        }));
    }

    let main = built[main_index as usize].clone().expect("main was built");
    Ok(main.chunk.clone())
}

fn read_function(reader: &mut Reader) -> Result<RawFunction, FormatError> {
    let name = reader.string("function name")?;
    let arity = reader.u16("arity")?;
    let upvalue_count = reader.u16("upvalue count")?;

    let constant_count = reader.u32("constant count")?;
    let mut constants = Vec::new();
    for _ in 0..constant_count {
        let tag = reader.u8("constant tag")?;
        constants.push(match tag {
            TAG_NULL => RawConst::Literal(Value::Null),
            TAG_BOOL => RawConst::Literal(Value::Bool(reader.u8("bool constant")? != 0)),
            TAG_NUMBER => RawConst::Literal(Value::Number(reader.f64("number constant")?)),
            TAG_STRING => RawConst::Literal(Value::str(reader.string("string constant")?)),
            TAG_FUNCTION => RawConst::FnRef(reader.u32("function reference")?),
            tag => return Err(FormatError::UnknownConstantTag { tag }),
        });
    }

    let code_length = reader.u32("code length")? as usize;
    let code = reader.take(code_length, "code")?.to_vec();

    let line_count = reader.u32("line count")? as usize;
    if line_count != code_length {
        return Err(FormatError::LineTableMismatch);
    }
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        lines.push(reader.u16("line entry")? as u32);
    }

    Ok(RawFunction {
        name,
        arity,
        upvalue_count,
        constants,
        code,
        lines,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, reading: &'static str) -> Result<&'a [u8], FormatError> {
        if self.pos + n > self.bytes.len() {
            return Err(FormatError::Truncated { reading });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, reading: &'static str) -> Result<u8, FormatError> {
        Ok(self.take(1, reading)?[0])
    }

    fn u16(&mut self, reading: &'static str) -> Result<u16, FormatError> {
        let b = self.take(2, reading)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, reading: &'static str) -> Result<u32, FormatError> {
        let b = self.take(4, reading)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self, reading: &'static str) -> Result<f64, FormatError> {
        let b = self.take(8, reading)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_be_bytes(buf))
    }

    fn string(&mut self, reading: &'static str) -> Result<String, FormatError> {
        let length = self.u32(reading)? as usize;
        let bytes = self.take(length, reading)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8)
    }
}
