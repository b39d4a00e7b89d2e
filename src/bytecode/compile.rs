use std::rc::Rc;

use crate::bytecode::chunk::{BytecodeFunction, Chunk};
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::Op;
use crate::lang::ast::{
    BinaryOp, Expr, LogicalOp, Stmt, StmtKind, TemplatePart, UnaryOp, UpdateOp,
};
use crate::lang::value::Value;

/// Lower a resolved program to the main chunk.
///
/// Top-level declarations become globals; declarations inside any block or
/// function body become stack locals. The main chunk ends with `HALT`,
/// nested function chunks end with an unconditional `PUSH_CONST null;
/// RETURN`.
pub fn compile(program: &[Stmt]) -> Result<Chunk, CompileError> {
    let mut compiler = Compiler::new();
    for stmt in program {
        compiler.stmt(stmt)?;
    }
    compiler.emit_op(Op::Halt);
    Ok(compiler.finish())
}

struct Local {
    name: String,
    depth: usize,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The compiler keeps a stack of these,
/// one per nested function currently being emitted.
struct FnCtx {
    name: String,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl FnCtx {
    fn new(name: &str) -> FnCtx {
        FnCtx {
            name: name.to_string(),
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// One entry per lexically-enclosing loop. The stack is shared across
/// function contexts, matching the generator's cross-function loop model.
struct LoopCtx {
    start: usize,
    breaks: Vec<usize>,
}

/// Where an identifier resolved to.
enum VarSlot {
    Local(u8),
    Upvalue(u8),
    Global(u8),
}

pub struct Compiler {
    ctxs: Vec<FnCtx>,
    loops: Vec<LoopCtx>,
    line: u32,
}

impl Compiler {
    fn new() -> Compiler {
        Compiler {
            ctxs: vec![FnCtx::new("<main>")],
            loops: Vec::new(),
            line: 0,
        }
    }

    fn finish(mut self) -> Chunk {
        self.ctxs.pop().unwrap().chunk
    }

    fn cur(&mut self) -> &mut FnCtx {
        self.ctxs.last_mut().unwrap()
    }

    fn at_top_level(&self) -> bool {
        self.ctxs.len() == 1 && self.ctxs[0].scope_depth == 0
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn emit(&mut self, byte: u8) {
        let line = self.line;
        self.cur().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit(op as u8);
    }

    fn emit_with(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit(operand);
    }

    fn constant(&mut self, value: Value) -> Result<u8, CompileError> {
        let index = self.cur().chunk.add_constant(value);
        if index > u8::MAX as usize {
            let name = self.cur().name.clone();
            return Err(CompileError::too_many_constants(&name, self.line));
        }
        Ok(index as u8)
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), CompileError> {
        let index = self.constant(value)?;
        self.emit_with(Op::PushConst, index);
        Ok(())
    }

    fn name_constant(&mut self, name: &str) -> Result<u8, CompileError> {
        self.constant(Value::str(name))
    }

    /// Emit a forward jump with a placeholder operand; returns the operand
    /// offset for later patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit(0xFF);
        self.cur().chunk.code.len() - 1
    }

    fn patch_jump(&mut self, operand_at: usize) -> Result<(), CompileError> {
        // Target is the current end of code; the VM has consumed the operand
        // byte before applying the offset.
        let distance = self.cur().chunk.code.len() - operand_at - 1;
        if distance > u8::MAX as usize {
            let name = self.cur().name.clone();
            return Err(CompileError::jump_too_large(&name, self.line));
        }
        self.cur().chunk.code[operand_at] = distance as u8;
        Ok(())
    }

    fn emit_loop(&mut self, start: usize) -> Result<(), CompileError> {
        self.emit_op(Op::Loop);
        let distance = self.cur().chunk.code.len() + 1 - start;
        if distance > u8::MAX as usize {
            let name = self.cur().name.clone();
            return Err(CompileError::jump_too_large(&name, self.line));
        }
        self.emit(distance as u8);
        Ok(())
    }

    // =========================================================================
    // Scopes and variable resolution
    // =========================================================================

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    /// Pop locals that belong to the scope being left. Captured slots are
    /// closed so their upvalues survive; plain slots are discarded.
    fn end_scope(&mut self) {
        self.cur().scope_depth -= 1;
        loop {
            let popped = {
                let ctx = self.ctxs.last().unwrap();
                match ctx.locals.last() {
                    Some(local) if local.depth > ctx.scope_depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match popped {
                Some(is_captured) => {
                    self.cur().locals.pop();
                    if is_captured {
                        self.emit_op(Op::CloseUpvalue);
                    } else {
                        self.emit_op(Op::Pop);
                    }
                }
                None => break,
            }
        }
    }

    fn add_local(&mut self, name: &str) -> Result<u8, CompileError> {
        if self.cur().locals.len() > u8::MAX as usize {
            let fn_name = self.cur().name.clone();
            return Err(CompileError::too_many_locals(&fn_name, self.line));
        }
        let depth = self.cur().scope_depth;
        let slot = self.cur().locals.len() as u8;
        self.cur().locals.push(Local {
            name: name.to_string(),
            depth,
            is_captured: false,
        });
        Ok(slot)
    }

    fn resolve_local(ctx: &FnCtx, name: &str) -> Option<u8> {
        for (slot, local) in ctx.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(slot as u8);
            }
        }
        None
    }

    /// Resolve `name` as an upvalue of context `ctx_idx`, threading capture
    /// descriptors through every intermediate function. The nearest
    /// enclosing local is marked captured.
    fn resolve_upvalue(&mut self, ctx_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if ctx_idx == 0 {
            return Ok(None);
        }
        if let Some(slot) = Self::resolve_local(&self.ctxs[ctx_idx - 1], name) {
            self.ctxs[ctx_idx - 1].locals[slot as usize].is_captured = true;
            return self.add_upvalue(ctx_idx, slot, true).map(Some);
        }
        if let Some(upvalue) = self.resolve_upvalue(ctx_idx - 1, name)? {
            return self.add_upvalue(ctx_idx, upvalue, false).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        ctx_idx: usize,
        index: u8,
        is_local: bool,
    ) -> Result<u8, CompileError> {
        let wanted = UpvalueRef { index, is_local };
        if let Some(existing) = self.ctxs[ctx_idx]
            .upvalues
            .iter()
            .position(|u| *u == wanted)
        {
            return Ok(existing as u8);
        }
        if self.ctxs[ctx_idx].upvalues.len() > u8::MAX as usize {
            let name = self.ctxs[ctx_idx].name.clone();
            return Err(CompileError::too_many_upvalues(&name, self.line));
        }
        self.ctxs[ctx_idx].upvalues.push(wanted);
        Ok((self.ctxs[ctx_idx].upvalues.len() - 1) as u8)
    }

    fn resolve_variable(&mut self, name: &str) -> Result<VarSlot, CompileError> {
        let top = self.ctxs.len() - 1;
        if let Some(slot) = Self::resolve_local(&self.ctxs[top], name) {
            return Ok(VarSlot::Local(slot));
        }
        if let Some(upvalue) = self.resolve_upvalue(top, name)? {
            return Ok(VarSlot::Upvalue(upvalue));
        }
        Ok(VarSlot::Global(self.name_constant(name)?))
    }

    fn emit_load(&mut self, slot: &VarSlot) {
        match slot {
            VarSlot::Local(s) => self.emit_with(Op::Load, *s),
            VarSlot::Upvalue(s) => self.emit_with(Op::GetUpvalue, *s),
            VarSlot::Global(k) => self.emit_with(Op::LoadGlobal, *k),
        }
    }

    /// All store forms leave the stored value on the stack.
    fn emit_store(&mut self, slot: &VarSlot) {
        match slot {
            VarSlot::Local(s) => self.emit_with(Op::Store, *s),
            VarSlot::Upvalue(s) => self.emit_with(Op::SetUpvalue, *s),
            VarSlot::Global(k) => self.emit_with(Op::StoreGlobal, *k),
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                self.emit_op(Op::Pop);
                Ok(())
            }

            StmtKind::VarDecl { name, init } => {
                match init {
                    Some(expr) => self.expr(expr)?,
                    None => self.emit_constant(Value::Null)?,
                }
                if self.at_top_level() {
                    let index = self.name_constant(name)?;
                    self.emit_with(Op::StoreGlobal, index);
                    self.emit_op(Op::Pop);
                } else {
                    // The initializer value stays on the stack as the slot.
                    self.add_local(name)?;
                }
                Ok(())
            }

            StmtKind::FunDecl { name, params, body } => {
                if self.at_top_level() {
                    self.function(name, params, body)?;
                    let index = self.name_constant(name)?;
                    self.emit_with(Op::StoreGlobal, index);
                    self.emit_op(Op::Pop);
                } else {
                    // Declare before the body so the function can refer to
                    // itself through its own slot.
                    self.add_local(name)?;
                    self.function(name, params, body)?;
                }
                Ok(())
            }

            StmtKind::Return(expr) => {
                match expr {
                    Some(e) => self.expr(e)?,
                    None => self.emit_constant(Value::Null)?,
                }
                self.emit_op(Op::Return);
                Ok(())
            }

            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond)?;
                let then_end = self.emit_jump(Op::JumpIfFalse);
                self.emit_op(Op::Pop);
                self.begin_scope();
                for s in then_branch {
                    self.stmt(s)?;
                }
                self.end_scope();
                let done = self.emit_jump(Op::Jump);
                self.patch_jump(then_end)?;
                self.emit_op(Op::Pop);
                if let Some(else_branch) = else_branch {
                    self.begin_scope();
                    for s in else_branch {
                        self.stmt(s)?;
                    }
                    self.end_scope();
                }
                self.patch_jump(done)?;
                Ok(())
            }

            StmtKind::While { cond, body } => {
                let start = self.cur().chunk.code.len();
                self.loops.push(LoopCtx {
                    start,
                    breaks: Vec::new(),
                });
                self.expr(cond)?;
                let exit = self.emit_jump(Op::JumpIfFalse);
                self.emit_op(Op::Pop);
                self.begin_scope();
                for s in body {
                    self.stmt(s)?;
                }
                self.end_scope();
                self.emit_loop(start)?;
                self.patch_jump(exit)?;
                self.emit_op(Op::Pop);
                let finished = self.loops.pop().unwrap();
                for offset in finished.breaks {
                    self.patch_jump(offset)?;
                }
                Ok(())
            }

            StmtKind::ForIn {
                var,
                iterable,
                body,
            } => self.for_in(var, iterable, body),

            StmtKind::Break => {
                if self.loops.is_empty() {
                    return Err(CompileError::break_outside_loop(self.line));
                }
                let offset = self.emit_jump(Op::Jump);
                self.loops.last_mut().unwrap().breaks.push(offset);
                Ok(())
            }

            StmtKind::Continue => {
                let start = match self.loops.last() {
                    Some(l) => l.start,
                    None => return Err(CompileError::continue_outside_loop(self.line)),
                };
                self.emit_loop(start)
            }

            StmtKind::Block(body) => {
                self.begin_scope();
                for s in body {
                    self.stmt(s)?;
                }
                self.end_scope();
                Ok(())
            }

            StmtKind::Print(expr) => {
                self.expr(expr)?;
                self.emit_op(Op::Print);
                Ok(())
            }

            StmtKind::Trace { label, value } => {
                self.emit_constant(Value::str(label.as_str()))?;
                self.expr(value)?;
                self.emit_op(Op::Eyeof);
                Ok(())
            }

            StmtKind::Export { name, value } => {
                self.expr(value)?;
                let index = self.name_constant(name)?;
                self.emit_with(Op::Export, index);
                Ok(())
            }

            // Only the attempt body is lowered; there are no handler opcodes
            // in this instruction set, so the rescue arm is dropped.
            StmtKind::Attempt { body, .. } => {
                self.begin_scope();
                for s in body {
                    self.stmt(s)?;
                }
                self.end_scope();
                Ok(())
            }
        }
    }

    /// `for (x in iterable)` desugars to an index walk over hidden locals:
    ///
    /// ```text
    ///   __iter = iterable; __index = 0; x = null
    ///   head: __index < len(__iter) ? x = __iter[__index]; body;
    ///         __index = __index + 1; loop head
    /// ```
    fn for_in(&mut self, var: &str, iterable: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        self.begin_scope();

        self.expr(iterable)?;
        let iter_slot = self.add_local("__iter")?;
        self.emit_constant(Value::Number(0.0))?;
        let index_slot = self.add_local("__index")?;
        self.emit_constant(Value::Null)?;
        let var_slot = self.add_local(var)?;

        let head = self.cur().chunk.code.len();
        self.loops.push(LoopCtx {
            start: head,
            breaks: Vec::new(),
        });

        self.emit_with(Op::Load, index_slot);
        self.emit_with(Op::Load, iter_slot);
        self.emit_op(Op::Length);
        self.emit_op(Op::Lt);
        let exit = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);

        self.emit_with(Op::Load, iter_slot);
        self.emit_with(Op::Load, index_slot);
        self.emit_op(Op::IndexGet);
        self.emit_with(Op::Store, var_slot);
        self.emit_op(Op::Pop);

        self.begin_scope();
        for s in body {
            self.stmt(s)?;
        }
        self.end_scope();

        self.emit_with(Op::Load, index_slot);
        self.emit_constant(Value::Number(1.0))?;
        self.emit_op(Op::Add);
        self.emit_with(Op::Store, index_slot);
        self.emit_op(Op::Pop);
        self.emit_loop(head)?;

        self.patch_jump(exit)?;
        self.emit_op(Op::Pop);
        let finished = self.loops.pop().unwrap();
        for offset in finished.breaks {
            self.patch_jump(offset)?;
        }

        self.end_scope();
        Ok(())
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Compile a function body in a fresh context and emit the
    /// `MAKE_CLOSURE` sequence that instantiates it in the current one.
    fn function(&mut self, name: &str, params: &[String], body: &[Stmt]) -> Result<(), CompileError> {
        if params.len() > u8::MAX as usize {
            return Err(CompileError::too_many_locals(name, self.line));
        }

        self.ctxs.push(FnCtx::new(name));
        self.begin_scope();
        for param in params {
            self.add_local(param)?;
        }
        for s in body {
            self.stmt(s)?;
        }
        // Every path returns; fall-through yields null.
        self.emit_constant(Value::Null)?;
        self.emit_op(Op::Return);

        let ctx = self.ctxs.pop().unwrap();
        let upvalues = ctx.upvalues;
        let function = BytecodeFunction {
            name: ctx.name,
            arity: params.len() as u16,
            upvalue_count: upvalues.len() as u16,
            chunk: ctx.chunk,
        };
        let index = self.constant(Value::Function(Rc::new(function)))?;
        self.emit_with(Op::MakeClosure, index);
        for upvalue in &upvalues {
            self.emit(upvalue.is_local as u8);
            self.emit(upvalue.index);
        }
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Null => self.emit_constant(Value::Null),
            Expr::Bool(b) => self.emit_constant(Value::Bool(*b)),
            Expr::Number(n) => self.emit_constant(Value::Number(*n)),
            Expr::Str(s) => self.emit_constant(Value::str(s.as_str())),

            Expr::Array(items) => {
                if items.len() > u8::MAX as usize {
                    return Err(CompileError::literal_too_large("array literal", self.line));
                }
                for item in items {
                    self.expr(item)?;
                }
                self.emit_with(Op::MakeArray, items.len() as u8);
                Ok(())
            }

            Expr::MapLiteral(entries) => {
                if entries.len() > u8::MAX as usize {
                    return Err(CompileError::literal_too_large("map literal", self.line));
                }
                for (key, value) in entries {
                    self.emit_constant(Value::str(key.as_str()))?;
                    self.expr(value)?;
                }
                self.emit_with(Op::MakeObject, entries.len() as u8);
                Ok(())
            }

            Expr::Template(parts) => {
                if parts.is_empty() {
                    return self.emit_constant(Value::str(""));
                }
                for (i, part) in parts.iter().enumerate() {
                    match part {
                        TemplatePart::Text(text) => self.emit_constant(Value::str(text.as_str()))?,
                        TemplatePart::Expr(e) => self.expr(e)?,
                    }
                    if i > 0 {
                        self.emit_op(Op::Add);
                    }
                }
                Ok(())
            }

            Expr::Var(name) => {
                let slot = self.resolve_variable(name)?;
                self.emit_load(&slot);
                Ok(())
            }

            Expr::Assign { name, value } => {
                self.expr(value)?;
                let slot = self.resolve_variable(name)?;
                self.emit_store(&slot);
                Ok(())
            }

            Expr::CompoundAssign { name, op, value } => {
                let slot = self.resolve_variable(name)?;
                self.emit_load(&slot);
                self.expr(value)?;
                self.emit_op(binary_opcode(*op));
                self.emit_store(&slot);
                Ok(())
            }

            Expr::Update { name, op, prefix } => {
                let slot = self.resolve_variable(name)?;
                self.emit_load(&slot);
                if !prefix {
                    self.emit_op(Op::Dup);
                }
                self.emit_constant(Value::Number(1.0))?;
                self.emit_op(match op {
                    UpdateOp::Incr => Op::Add,
                    UpdateOp::Decr => Op::Sub,
                });
                self.emit_store(&slot);
                if !prefix {
                    // Drop the stored value; the pre-update copy is the result.
                    self.emit_op(Op::Pop);
                }
                Ok(())
            }

            Expr::Binary { lhs, op, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.emit_op(binary_opcode(*op));
                Ok(())
            }

            Expr::Logical { lhs, op, rhs } => match op {
                LogicalOp::And => {
                    self.expr(lhs)?;
                    let end = self.emit_jump(Op::JumpIfFalse);
                    self.emit_op(Op::Pop);
                    self.expr(rhs)?;
                    self.patch_jump(end)
                }
                LogicalOp::Or => {
                    self.expr(lhs)?;
                    let rhs_jump = self.emit_jump(Op::JumpIfFalse);
                    let end = self.emit_jump(Op::Jump);
                    self.patch_jump(rhs_jump)?;
                    self.emit_op(Op::Pop);
                    self.expr(rhs)?;
                    self.patch_jump(end)
                }
            },

            Expr::Unary { op, expr } => {
                self.expr(expr)?;
                self.emit_op(match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Not => Op::Not,
                });
                Ok(())
            }

            Expr::Call { callee, args } => {
                if args.len() > u8::MAX as usize {
                    return Err(CompileError::literal_too_large("argument list", self.line));
                }
                self.expr(callee)?;
                for arg in args {
                    self.expr(arg)?;
                }
                self.emit_with(Op::Call, args.len() as u8);
                Ok(())
            }

            Expr::Index { object, index } => {
                self.expr(object)?;
                self.expr(index)?;
                self.emit_op(Op::IndexGet);
                Ok(())
            }

            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                self.expr(object)?;
                self.expr(index)?;
                self.expr(value)?;
                self.emit_op(Op::IndexSet);
                Ok(())
            }

            Expr::Prop { object, name } => {
                self.expr(object)?;
                let index = self.name_constant(name)?;
                self.emit_with(Op::GetProp, index);
                Ok(())
            }

            Expr::PropAssign {
                object,
                name,
                value,
            } => {
                self.expr(object)?;
                self.expr(value)?;
                let index = self.name_constant(name)?;
                self.emit_with(Op::SetProp, index);
                Ok(())
            }

            Expr::Lambda { params, body } => self.function("<lambda>", params, body),

            Expr::Import(path) => {
                let index = self.constant(Value::str(path.as_str()))?;
                self.emit_with(Op::Import, index);
                Ok(())
            }
        }
    }
}

fn binary_opcode(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::Mod => Op::Mod,
        BinaryOp::Eq => Op::Eq,
        BinaryOp::Neq => Op::Neq,
        BinaryOp::Lt => Op::Lt,
        BinaryOp::Lte => Op::Lte,
        BinaryOp::Gt => Op::Gt,
        BinaryOp::Gte => Op::Gte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt::new(1, kind)
    }

    /// Decode a chunk into (op, operand) pairs. Only valid for chunks
    /// without `MAKE_CLOSURE` descriptor blocks.
    fn decode(chunk: &Chunk) -> Vec<(Op, Option<u8>)> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < chunk.code.len() {
            let op = Op::from_byte(chunk.code[ip]).expect("valid opcode");
            ip += 1;
            let operand = if op.operand_count() == 1 {
                let b = chunk.code[ip];
                ip += 1;
                Some(b)
            } else {
                None
            };
            out.push((op, operand));
        }
        out
    }

    #[test]
    fn test_expression_statement_pops_its_value() {
        let chunk = compile(&[stmt(StmtKind::Expr(Expr::Number(7.0)))]).unwrap();
        assert_eq!(
            decode(&chunk),
            vec![
                (Op::PushConst, Some(0)),
                (Op::Pop, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn test_top_level_var_decl_becomes_global() {
        let chunk = compile(&[stmt(StmtKind::VarDecl {
            name: "x".to_string(),
            init: Some(Expr::Number(1.0)),
        })])
        .unwrap();
        let ops = decode(&chunk);
        assert_eq!(ops[0], (Op::PushConst, Some(0)));
        assert_eq!(ops[1].0, Op::StoreGlobal);
        assert_eq!(ops[2].0, Op::Pop);
        assert_eq!(chunk.constants[ops[1].1.unwrap() as usize], Value::str("x"));
    }

    #[test]
    fn test_if_else_jump_shape() {
        // if (true) { 1; } else { 2; }
        let chunk = compile(&[stmt(StmtKind::If {
            cond: Expr::Bool(true),
            then_branch: vec![stmt(StmtKind::Expr(Expr::Number(1.0)))],
            else_branch: Some(vec![stmt(StmtKind::Expr(Expr::Number(2.0)))]),
        })])
        .unwrap();
        let ops = decode(&chunk);
        assert_eq!(ops[0].0, Op::PushConst);
        assert_eq!(ops[1].0, Op::JumpIfFalse);
        assert_eq!(ops[2].0, Op::Pop);
        // then branch
        assert_eq!(ops[3].0, Op::PushConst);
        assert_eq!(ops[4].0, Op::Pop);
        assert_eq!(ops[5].0, Op::Jump);
        // else continuation starts with the condition pop
        assert_eq!(ops[6].0, Op::Pop);
        assert_eq!(ops[7].0, Op::PushConst);

        // JumpIfFalse lands exactly on the else-side Pop.
        let cond_jump_operand_at = 3;
        let target = cond_jump_operand_at + 1 + chunk.code[cond_jump_operand_at] as usize;
        assert_eq!(Op::from_byte(chunk.code[target]), Some(Op::Pop));
    }

    #[test]
    fn test_while_loops_back_to_condition() {
        let chunk = compile(&[stmt(StmtKind::While {
            cond: Expr::Bool(false),
            body: vec![],
        })])
        .unwrap();
        let ops = decode(&chunk);
        assert_eq!(
            ops.iter().map(|(op, _)| *op).collect::<Vec<_>>(),
            vec![
                Op::PushConst,
                Op::JumpIfFalse,
                Op::Pop,
                Op::Loop,
                Op::Pop,
                Op::Halt
            ]
        );
        // The backward jump returns to offset 0 (the condition).
        let loop_operand_at = 6;
        assert_eq!(loop_operand_at + 1 - chunk.code[loop_operand_at] as usize, 0);
    }

    #[test]
    fn test_break_patches_past_loop_exit() {
        let chunk = compile(&[stmt(StmtKind::While {
            cond: Expr::Bool(true),
            body: vec![stmt(StmtKind::Break)],
        })])
        .unwrap();
        let ops = decode(&chunk);
        let break_pos = ops.iter().position(|(op, _)| *op == Op::Jump).unwrap();
        // The break's Jump must land on the Halt after the loop's exit Pop.
        let mut byte_offset = 0;
        for (op, _) in ops.iter().take(break_pos) {
            byte_offset += 1 + op.operand_count();
        }
        let operand_at = byte_offset + 1;
        let target = operand_at + 1 + chunk.code[operand_at] as usize;
        assert_eq!(Op::from_byte(chunk.code[target]), Some(Op::Halt));
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        let err = compile(&[stmt(StmtKind::Break)]).unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn test_continue_outside_loop_is_an_error() {
        let err = compile(&[stmt(StmtKind::Continue)]).unwrap_err();
        assert!(matches!(err, CompileError::ContinueOutsideLoop { .. }));
    }

    #[test]
    fn test_and_preserves_lhs_via_peeking_jump() {
        let chunk = compile(&[stmt(StmtKind::Expr(Expr::Logical {
            lhs: Box::new(Expr::Bool(false)),
            op: LogicalOp::And,
            rhs: Box::new(Expr::Bool(true)),
        }))])
        .unwrap();
        let ops: Vec<Op> = decode(&chunk).iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![
                Op::PushConst,
                Op::JumpIfFalse,
                Op::Pop,
                Op::PushConst,
                Op::Pop,
                Op::Halt
            ]
        );
    }

    #[test]
    fn test_or_skips_rhs_when_lhs_truthy() {
        let chunk = compile(&[stmt(StmtKind::Expr(Expr::Logical {
            lhs: Box::new(Expr::Bool(true)),
            op: LogicalOp::Or,
            rhs: Box::new(Expr::Bool(false)),
        }))])
        .unwrap();
        let ops: Vec<Op> = decode(&chunk).iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![
                Op::PushConst,
                Op::JumpIfFalse,
                Op::Jump,
                Op::Pop,
                Op::PushConst,
                Op::Pop,
                Op::Halt
            ]
        );
    }

    #[test]
    fn test_nested_function_captures_enclosing_local() {
        // fn outer() { var c = 0; fn inner() { return c; } }
        let chunk = compile(&[stmt(StmtKind::FunDecl {
            name: "outer".to_string(),
            params: vec![],
            body: vec![
                stmt(StmtKind::VarDecl {
                    name: "c".to_string(),
                    init: Some(Expr::Number(0.0)),
                }),
                stmt(StmtKind::FunDecl {
                    name: "inner".to_string(),
                    params: vec![],
                    body: vec![stmt(StmtKind::Return(Some(Expr::Var("c".to_string()))))],
                }),
            ],
        })])
        .unwrap();

        let outer = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) if f.name == "outer" => Some(f.clone()),
                _ => None,
            })
            .expect("outer function constant");
        assert_eq!(outer.upvalue_count, 0);

        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) if f.name == "inner" => Some(f.clone()),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.upvalue_count, 1);

        // The MAKE_CLOSURE for inner carries one (is_local=1, index=0)
        // descriptor: c is slot 0 of outer.
        let code = &outer.chunk.code;
        let mc = code
            .iter()
            .position(|b| *b == Op::MakeClosure as u8)
            .expect("MAKE_CLOSURE in outer");
        assert_eq!(code[mc + 2], 1);
        assert_eq!(code[mc + 3], 0);

        // inner reads c through the upvalue, not a local slot.
        assert!(inner.chunk.code.contains(&(Op::GetUpvalue as u8)));
    }

    #[test]
    fn test_capture_threads_through_intermediate_function() {
        // fn a() { var x = 1; fn b() { fn c() { return x; } } }
        let chunk = compile(&[stmt(StmtKind::FunDecl {
            name: "a".to_string(),
            params: vec![],
            body: vec![
                stmt(StmtKind::VarDecl {
                    name: "x".to_string(),
                    init: Some(Expr::Number(1.0)),
                }),
                stmt(StmtKind::FunDecl {
                    name: "b".to_string(),
                    params: vec![],
                    body: vec![stmt(StmtKind::FunDecl {
                        name: "c".to_string(),
                        params: vec![],
                        body: vec![stmt(StmtKind::Return(Some(Expr::Var("x".to_string()))))],
                    })],
                }),
            ],
        })])
        .unwrap();

        let a = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) if f.name == "a" => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        let b = a
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) if f.name == "b" => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        // b captures x from a (is_local=1); c captures through b's upvalue
        // (is_local=0).
        assert_eq!(b.upvalue_count, 1);
        let a_code = &a.chunk.code;
        let mc = a_code
            .iter()
            .position(|byte| *byte == Op::MakeClosure as u8)
            .unwrap();
        assert_eq!(a_code[mc + 2], 1);

        let b_code = &b.chunk.code;
        let mc = b_code
            .iter()
            .position(|byte| *byte == Op::MakeClosure as u8)
            .unwrap();
        assert_eq!(b_code[mc + 2], 0);
        assert_eq!(b_code[mc + 3], 0);
    }

    #[test]
    fn test_scope_exit_closes_captured_locals() {
        // { var x = 1; fn f() { return x; } }  -- x is captured, so leaving
        // the block must emit CLOSE_UPVALUE instead of POP for it.
        let chunk = compile(&[stmt(StmtKind::Block(vec![
            stmt(StmtKind::VarDecl {
                name: "x".to_string(),
                init: Some(Expr::Number(1.0)),
            }),
            stmt(StmtKind::FunDecl {
                name: "f".to_string(),
                params: vec![],
                body: vec![stmt(StmtKind::Return(Some(Expr::Var("x".to_string()))))],
            }),
        ]))])
        .unwrap();
        assert!(chunk.code.contains(&(Op::CloseUpvalue as u8)));
    }

    #[test]
    fn test_postfix_update_keeps_old_value() {
        let chunk = compile(&[
            stmt(StmtKind::VarDecl {
                name: "x".to_string(),
                init: Some(Expr::Number(1.0)),
            }),
            stmt(StmtKind::Expr(Expr::Update {
                name: "x".to_string(),
                op: UpdateOp::Incr,
                prefix: false,
            })),
        ])
        .unwrap();
        let ops: Vec<Op> = decode(&chunk).iter().map(|(op, _)| *op).collect();
        let dup = ops.iter().position(|op| *op == Op::Dup).unwrap();
        assert_eq!(ops[dup + 1], Op::PushConst);
        assert_eq!(ops[dup + 2], Op::Add);
        assert_eq!(ops[dup + 3], Op::StoreGlobal);
        assert_eq!(ops[dup + 4], Op::Pop);
    }

    #[test]
    fn test_template_concatenates_parts() {
        let chunk = compile(&[stmt(StmtKind::Expr(Expr::Template(vec![
            TemplatePart::Text("n = ".to_string()),
            TemplatePart::Expr(Expr::Number(5.0)),
        ])))])
        .unwrap();
        let ops: Vec<Op> = decode(&chunk).iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![
                Op::PushConst,
                Op::PushConst,
                Op::Add,
                Op::Pop,
                Op::Halt
            ]
        );
    }

    #[test]
    fn test_empty_template_pushes_empty_string() {
        let chunk = compile(&[stmt(StmtKind::Expr(Expr::Template(vec![])))]).unwrap();
        assert_eq!(chunk.constants[0], Value::str(""));
    }

    #[test]
    fn test_export_pops_value_into_named_slot() {
        let chunk = compile(&[stmt(StmtKind::Export {
            name: "answer".to_string(),
            value: Expr::Number(42.0),
        })])
        .unwrap();
        let ops = decode(&chunk);
        assert_eq!(ops[0].0, Op::PushConst);
        assert_eq!(ops[1].0, Op::Export);
        assert_eq!(
            chunk.constants[ops[1].1.unwrap() as usize],
            Value::str("answer")
        );
    }

    #[test]
    fn test_attempt_lowers_try_body_only() {
        let chunk = compile(&[stmt(StmtKind::Attempt {
            body: vec![stmt(StmtKind::Expr(Expr::Number(1.0)))],
            rescue_var: "e".to_string(),
            rescue_body: vec![stmt(StmtKind::Expr(Expr::Number(2.0)))],
        })])
        .unwrap();
        // Only the try body's constant is interned; the rescue arm vanishes.
        assert_eq!(chunk.constants, vec![Value::Number(1.0)]);
    }

    #[test]
    fn test_constant_pool_overflow_reports_error() {
        let many: Vec<Stmt> = (0..300)
            .map(|i| stmt(StmtKind::Expr(Expr::Number(i as f64))))
            .collect();
        let err = compile(&many).unwrap_err();
        assert!(matches!(err, CompileError::TooManyConstants { .. }));
    }
}
