//! Human-readable and JSON listings of compiled chunks.

use serde::Serialize;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::op::Op;
use crate::lang::value::Value;

/// One decoded instruction, in listing form.
#[derive(Debug, Clone, Serialize)]
pub struct InstructionRecord {
    pub offset: usize,
    pub line: u32,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand: Option<u8>,
    /// Resolved absolute target for jumps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<usize>,
    /// Rendered constant, upvalue descriptors, or similar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A listing for one function; nested functions are listed after their
/// parent, depth-first.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionListing {
    pub name: String,
    pub arity: u16,
    pub upvalue_count: u16,
    pub instructions: Vec<InstructionRecord>,
}

/// Decode every function reachable from `chunk` into listing records.
pub fn listings(chunk: &Chunk, name: &str) -> Vec<FunctionListing> {
    let mut out = Vec::new();
    collect_listing(chunk, name, 0, 0, &mut out);
    out
}

fn collect_listing(
    chunk: &Chunk,
    name: &str,
    arity: u16,
    upvalue_count: u16,
    out: &mut Vec<FunctionListing>,
) {
    out.push(FunctionListing {
        name: name.to_string(),
        arity,
        upvalue_count,
        instructions: decode_chunk(chunk),
    });
    for constant in &chunk.constants {
        if let Value::Function(function) = constant {
            collect_listing(
                &function.chunk,
                &function.name,
                function.arity,
                function.upvalue_count,
                out,
            );
        }
    }
}

fn decode_chunk(chunk: &Chunk) -> Vec<InstructionRecord> {
    let mut records = Vec::new();
    let mut ip = 0;
    while ip < chunk.code.len() {
        let (record, next) = decode_at(chunk, ip);
        records.push(record);
        ip = next;
    }
    records
}

/// Decode one instruction; tolerant of unknown bytes so a listing is always
/// produced.
fn decode_at(chunk: &Chunk, ip: usize) -> (InstructionRecord, usize) {
    let line = chunk.line_at(ip).unwrap_or(0);
    let byte = chunk.code[ip];
    let op = match Op::from_byte(byte) {
        Some(op) => op,
        None => {
            return (
                InstructionRecord {
                    offset: ip,
                    line,
                    op: format!("DATA 0x{:02X}", byte),
                    operand: None,
                    target: None,
                    detail: None,
                },
                ip + 1,
            )
        }
    };

    let mut operand = None;
    let mut next = ip + 1;
    if op.operand_count() == 1 {
        operand = chunk.code.get(next).copied();
        next += 1;
    }

    let mut target = None;
    let mut detail = None;
    match op {
        Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue => {
            if let Some(offset) = operand {
                target = Some(next + offset as usize);
            }
        }
        Op::Loop => {
            if let Some(offset) = operand {
                target = next.checked_sub(offset as usize);
            }
        }
        Op::PushConst | Op::LoadGlobal | Op::StoreGlobal | Op::GetProp | Op::SetProp
        | Op::Import | Op::Export => {
            if let Some(k) = operand {
                detail = chunk.constants.get(k as usize).map(render_constant);
            }
        }
        Op::MakeClosure => {
            if let Some(k) = operand {
                if let Some(Value::Function(function)) = chunk.constants.get(k as usize) {
                    let mut pairs = Vec::new();
                    for _ in 0..function.upvalue_count {
                        let is_local = chunk.code.get(next).copied().unwrap_or(0) != 0;
                        let index = chunk.code.get(next + 1).copied().unwrap_or(0);
                        next += 2;
                        pairs.push(format!(
                            "({}, {})",
                            if is_local { "local" } else { "upvalue" },
                            index
                        ));
                    }
                    detail = Some(if pairs.is_empty() {
                        format!("<fn {}>", function.name)
                    } else {
                        format!("<fn {}> captures {}", function.name, pairs.join(" "))
                    });
                }
            }
        }
        _ => {}
    }

    (
        InstructionRecord {
            offset: ip,
            line,
            op: op.mnemonic().to_string(),
            operand,
            target,
            detail,
        },
        next,
    )
}

fn render_constant(constant: &Value) -> String {
    match constant {
        Value::Str(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

/// Render the full listing, one function per section, jump targets marked.
pub fn disassemble_to_string(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    for listing in listings(chunk, name) {
        out.push_str(&format!(
            "== {} (arity {}, upvalues {}) ==\n",
            listing.name, listing.arity, listing.upvalue_count
        ));
        let targets: Vec<usize> = listing.instructions.iter().filter_map(|i| i.target).collect();
        for record in &listing.instructions {
            let marker = if targets.contains(&record.offset) {
                "►"
            } else {
                " "
            };
            out.push_str(&format!(
                "{:04} {} {:<14}",
                record.offset, marker, record.op
            ));
            if let Some(operand) = record.operand {
                out.push_str(&format!(" {:3}", operand));
            }
            if let Some(target) = record.target {
                out.push_str(&format!(" (→ {:04})", target));
            }
            if let Some(detail) = &record.detail {
                out.push_str(&format!(" ; {}", detail));
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// The same listing as JSON, for tooling.
pub fn disassemble_to_json(chunk: &Chunk, name: &str) -> serde_json::Value {
    serde_json::json!({ "functions": listings(chunk, name) })
}
