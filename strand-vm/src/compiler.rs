//! IR -> bytecode compiler.
//!
//! One compile-time frame per function; forward jumps go through numeric
//! labels resolved in a fix-up pass after the optimizer has run. Constants
//! are interned into a single pool shared by the whole unit; every function
//! body is optimised and label-resolved independently.

use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use strand_bytecode::{resolve_labels, BinOp, Op, ScopeKind, Slot};
use strand_ir::{BinOpIr, ExprIr, FrameIr, ProgramIr, StmtIr, UnOpIr, Var, VarScope};
use thiserror::Error;
use tracing::debug;

use crate::registry::Registry;
use crate::value::{Closure, FunctionProto, Unit, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("unknown builtin `{0}`")]
    UnknownBuiltin(String),

    #[error("too many constants in one unit")]
    TooManyConstants,

    #[error("too many local variables in one function")]
    TooManyLocals,

    #[error("`break` outside of a loop")]
    BreakOutsideLoop,

    #[error("`continue` outside of a loop")]
    ContinueOutsideLoop,
}

#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    /// Run the peephole optimizer over every function body.
    pub optimize: bool,
    /// Compile the entry frame's locals as absolute (global) stack slots
    /// and terminate it with `Halt`. True for top-level programs; imported
    /// modules compile their entry as an ordinary function instead.
    pub global_entry: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            global_entry: true,
        }
    }
}

/// A compiled unit plus its entry function.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub unit: Arc<Unit>,
    pub entry: Arc<FunctionProto>,
}

impl CompiledProgram {
    /// The entry function as a callable value with no captures.
    pub fn entry_value(&self) -> Value {
        Value::Function(Arc::new(Closure {
            proto: self.entry.clone(),
            unit: self.unit.clone(),
            free: Vec::new(),
        }))
    }
}

/// Interning key for the constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Int(i64),
    Float(u64),
    Bool(bool),
    Str(String),
    Builtin(String),
}

pub fn compile(
    program: &ProgramIr,
    registry: &Registry,
    options: CompilerOptions,
    path: Option<PathBuf>,
) -> Result<CompiledProgram, CompileError> {
    let mut compiler = Compiler {
        registry,
        options,
        path,
        constants: Vec::new(),
        const_keys: FxHashMap::default(),
        protos: Vec::new(),
    };

    let entry = compiler.compile_frame(&program.entry, options.global_entry)?;
    let unit = Arc::new(Unit {
        constants: compiler.constants,
        protos: compiler.protos,
    });

    Ok(CompiledProgram { unit, entry })
}

struct Compiler<'r> {
    registry: &'r Registry,
    options: CompilerOptions,
    path: Option<PathBuf>,
    constants: Vec<Value>,
    const_keys: FxHashMap<ConstKey, u16>,
    protos: Vec<Arc<FunctionProto>>,
}

/// Per-function compilation state.
struct FnCtx<'f> {
    ops: Vec<Op>,
    next_label: u32,
    /// (begin, end) label pairs of enclosing loops.
    loops: Vec<(u32, u32)>,
    frame: &'f FrameIr,
    is_entry: bool,
}

impl<'f> FnCtx<'f> {
    fn new_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Map a resolved IR variable onto its runtime slot. Entry-frame locals
    /// live at absolute stack indices (global scope).
    fn slot(&self, var: Var) -> Slot {
        match var.scope {
            VarScope::Local if self.is_entry => Slot::new(ScopeKind::Global, var.index as u16),
            VarScope::Local => Slot::new(ScopeKind::Local, var.index as u16),
            VarScope::Free => Slot::new(ScopeKind::Free, var.index as u16),
        }
    }

    /// Whether stores to this variable go through its ref cell.
    fn is_ref(&self, var: Var) -> bool {
        match var.scope {
            VarScope::Local => self.frame.captured.get(var.index).copied().unwrap_or(false),
            VarScope::Free => true,
        }
    }
}

impl<'r> Compiler<'r> {
    fn compile_frame(
        &mut self,
        frame: &FrameIr,
        is_entry: bool,
    ) -> Result<Arc<FunctionProto>, CompileError> {
        if frame.var_count > u16::MAX as usize {
            return Err(CompileError::TooManyLocals);
        }

        let mut ctx = FnCtx {
            ops: Vec::new(),
            next_label: 0,
            loops: Vec::new(),
            frame,
            is_entry,
        };

        for stmt in &frame.body {
            self.stmt(&mut ctx, stmt)?;
        }

        if is_entry && self.options.global_entry {
            ctx.emit(Op::Halt);
        } else {
            // Implicit `return nil`.
            let nil = self.intern(ConstKey::Nil, || Value::Nil)?;
            ctx.emit(Op::Load(nil));
            ctx.emit(Op::Ret);
        }

        let mut ops = ctx.ops;
        let raw_len = ops.len();
        if self.options.optimize {
            ops = crate::optimizer::optimize(ops);
        }
        resolve_labels(&mut ops);
        debug!(raw = raw_len, emitted = ops.len(), "compiled frame");

        Ok(Arc::new(FunctionProto {
            ops,
            var_count: frame.var_count,
            param_count: frame.param_count,
            path: self.path.clone(),
        }))
    }

    fn intern(
        &mut self,
        key: ConstKey,
        make: impl FnOnce() -> Value,
    ) -> Result<Slot, CompileError> {
        if let Some(&index) = self.const_keys.get(&key) {
            return Ok(Slot::konst(index));
        }
        if self.constants.len() > u16::MAX as usize {
            return Err(CompileError::TooManyConstants);
        }
        let index = self.constants.len() as u16;
        self.constants.push(make());
        self.const_keys.insert(key, index);
        Ok(Slot::konst(index))
    }

    fn builtin(&mut self, name: &str) -> Result<Slot, CompileError> {
        let value = self
            .registry
            .resolve_func(name)
            .or_else(|| self.registry.resolve_module(name))
            .ok_or_else(|| CompileError::UnknownBuiltin(name.to_string()))?;
        self.intern(ConstKey::Builtin(name.to_string()), || value)
    }

    // ----- statements -----

    fn stmt(&mut self, ctx: &mut FnCtx, stmt: &StmtIr) -> Result<(), CompileError> {
        match stmt {
            StmtIr::Block(stmts) => {
                for stmt in stmts {
                    self.stmt(ctx, stmt)?;
                }
            }

            StmtIr::Loop(body) => {
                let begin = ctx.new_label();
                let end = ctx.new_label();
                ctx.loops.push((begin, end));
                ctx.emit(Op::Label(begin));
                self.stmt(ctx, body)?;
                ctx.emit(Op::Jump(begin));
                ctx.emit(Op::Label(end));
                ctx.loops.pop();
            }

            StmtIr::If { cond, body, alt } => {
                self.expr(ctx, cond)?;
                match alt {
                    None => {
                        let end = ctx.new_label();
                        ctx.emit(Op::PJumpF(end));
                        self.stmt(ctx, body)?;
                        ctx.emit(Op::Label(end));
                    }
                    Some(alt) => {
                        let alt_label = ctx.new_label();
                        let end = ctx.new_label();
                        ctx.emit(Op::PJumpF(alt_label));
                        self.stmt(ctx, body)?;
                        ctx.emit(Op::Jump(end));
                        ctx.emit(Op::Label(alt_label));
                        self.stmt(ctx, alt)?;
                        ctx.emit(Op::Label(end));
                    }
                }
            }

            StmtIr::Expr(expr) => {
                self.expr(ctx, expr)?;
                ctx.emit(Op::Pop);
            }

            StmtIr::Return(expr) => {
                self.expr(ctx, expr)?;
                ctx.emit(Op::Ret);
            }

            StmtIr::Break => {
                let (_, end) = ctx
                    .loops
                    .last()
                    .copied()
                    .ok_or(CompileError::BreakOutsideLoop)?;
                ctx.emit(Op::Jump(end));
            }

            StmtIr::Continue => {
                let (begin, _) = ctx
                    .loops
                    .last()
                    .copied()
                    .ok_or(CompileError::ContinueOutsideLoop)?;
                ctx.emit(Op::Jump(begin));
            }
        }
        Ok(())
    }

    // ----- expressions -----

    fn expr(&mut self, ctx: &mut FnCtx, expr: &ExprIr) -> Result<(), CompileError> {
        match expr {
            ExprIr::Nil => {
                let slot = self.intern(ConstKey::Nil, || Value::Nil)?;
                ctx.emit(Op::Load(slot));
            }
            ExprIr::Int(v) => {
                let slot = self.intern(ConstKey::Int(*v), || Value::Int(*v))?;
                ctx.emit(Op::Load(slot));
            }
            ExprIr::Float(v) => {
                let slot = self.intern(ConstKey::Float(v.to_bits()), || Value::Float(*v))?;
                ctx.emit(Op::Load(slot));
            }
            ExprIr::Bool(v) => {
                let slot = self.intern(ConstKey::Bool(*v), || Value::Bool(*v))?;
                ctx.emit(Op::Load(slot));
            }
            ExprIr::Str(v) => {
                let slot = self.intern(ConstKey::Str(v.clone()), || Value::string(v))?;
                ctx.emit(Op::Load(slot));
            }

            ExprIr::Load(var) => {
                let slot = ctx.slot(*var);
                ctx.emit(Op::Load(slot));
            }

            ExprIr::Builtin(name) => {
                let slot = self.builtin(name)?;
                ctx.emit(Op::Load(slot));
            }

            ExprIr::Assign { var, value } => {
                self.expr(ctx, value)?;
                ctx.emit(Op::Store(ctx.slot(*var), ctx.is_ref(*var)));
            }

            ExprIr::IndexAssign {
                target,
                index,
                value,
            } => {
                self.expr(ctx, value)?;
                self.expr(ctx, target)?;
                self.expr(ctx, index)?;
                ctx.emit(Op::StoreIndex);
            }

            ExprIr::Binary { op, operands } => match op {
                BinOpIr::And => self.short_circuit(ctx, operands, false)?,
                BinOpIr::Or => self.short_circuit(ctx, operands, true)?,
                _ => {
                    self.expr(ctx, &operands[0])?;
                    for operand in &operands[1..] {
                        self.expr(ctx, operand)?;
                        ctx.emit(Op::Bin(bin_op(*op)));
                    }
                }
            },

            ExprIr::Unary { op, expr } => {
                self.expr(ctx, expr)?;
                ctx.emit(match op {
                    UnOpIr::Not => Op::Not,
                    UnOpIr::Neg => Op::Neg,
                });
            }

            ExprIr::Array(items) => {
                ctx.emit(Op::Array);
                for item in items {
                    self.expr(ctx, item)?;
                    ctx.emit(Op::ArrayPush);
                }
            }

            ExprIr::Object(fields) => {
                ctx.emit(Op::Object);
                for (key, value) in fields {
                    self.expr(ctx, value)?;
                    let key = self.intern(ConstKey::Str(key.clone()), || Value::string(key))?;
                    ctx.emit(Op::Load(key));
                    ctx.emit(Op::ObjectPush);
                }
            }

            ExprIr::Index { target, index } => {
                self.expr(ctx, target)?;
                self.expr(ctx, index)?;
                ctx.emit(Op::Index);
            }

            ExprIr::Call { callee, args } => {
                self.expr(ctx, callee)?;
                for arg in args {
                    self.expr(ctx, arg)?;
                }
                ctx.emit(Op::Call(args.len() as u16));
            }

            ExprIr::Ternary { cond, then, alt } => {
                let alt_label = ctx.new_label();
                let end = ctx.new_label();
                self.expr(ctx, cond)?;
                ctx.emit(Op::PJumpF(alt_label));
                self.expr(ctx, then)?;
                ctx.emit(Op::Jump(end));
                ctx.emit(Op::Label(alt_label));
                self.expr(ctx, alt)?;
                ctx.emit(Op::Label(end));
            }

            ExprIr::Frame(frame) => {
                let proto = self.compile_frame(frame, false)?;
                let constant = self.protos.len() as u32;
                self.protos.push(proto);

                // Captured cells are pushed in reverse declaration order so
                // the VM pops them back into place.
                for fv in frame.free_vars.iter().rev() {
                    ctx.emit(Op::UpgradeRef(ctx.slot(*fv)));
                }
                ctx.emit(Op::Func {
                    constant,
                    captured: frame.free_vars.len() as u16,
                });
            }

            ExprIr::Try(expr) => {
                ctx.emit(Op::Try);
                self.expr(ctx, expr)?;
                ctx.emit(Op::Try);
            }

            ExprIr::Raise(expr) => {
                self.expr(ctx, expr)?;
                ctx.emit(Op::Raise);
            }
        }
        Ok(())
    }

    /// `and`/`or` chains compile to keep-value conditional jumps; the
    /// result is the deciding operand.
    fn short_circuit(
        &mut self,
        ctx: &mut FnCtx,
        operands: &[ExprIr],
        jump_on_true: bool,
    ) -> Result<(), CompileError> {
        let end = ctx.new_label();
        let (last, init) = operands.split_last().expect("binary chain is non-empty");
        for operand in init {
            self.expr(ctx, operand)?;
            ctx.emit(if jump_on_true {
                Op::JumpT(end)
            } else {
                Op::JumpF(end)
            });
            ctx.emit(Op::Pop);
        }
        self.expr(ctx, last)?;
        ctx.emit(Op::Label(end));
        Ok(())
    }
}

fn bin_op(op: BinOpIr) -> BinOp {
    match op {
        BinOpIr::Add => BinOp::Add,
        BinOpIr::Sub => BinOp::Sub,
        BinOpIr::Mul => BinOp::Mul,
        BinOpIr::Div => BinOp::Div,
        BinOpIr::Mod => BinOp::Mod,
        BinOpIr::Eq => BinOp::Eq,
        BinOpIr::Ne => BinOp::Ne,
        BinOpIr::Lt => BinOp::Lt,
        BinOpIr::Le => BinOp::Le,
        BinOpIr::Gt => BinOp::Gt,
        BinOpIr::Ge => BinOp::Ge,
        BinOpIr::And | BinOpIr::Or => unreachable!("short-circuit ops have no opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::std_registry;
    use strand_ir::lower;
    use strand_syntax::parse;

    fn compile_src(src: &str, options: CompilerOptions) -> CompiledProgram {
        let registry = std_registry();
        let ast = parse(src).unwrap();
        let ir = lower(&ast, registry.names()).unwrap();
        compile(&ir, &registry, options, None).unwrap()
    }

    fn unoptimized() -> CompilerOptions {
        CompilerOptions {
            optimize: false,
            ..Default::default()
        }
    }

    #[test]
    fn entry_frame_uses_global_slots_and_halts() {
        let program = compile_src("x := 1", unoptimized());
        let ops = &program.entry.ops;
        assert!(ops
            .iter()
            .any(|op| matches!(op, Op::Store(Slot { scope: ScopeKind::Global, .. }, _))));
        assert!(matches!(ops.last(), Some(Op::Halt)));
    }

    #[test]
    fn module_entry_is_an_ordinary_function() {
        let program = compile_src(
            "x := 1\nreturn x",
            CompilerOptions {
                optimize: false,
                global_entry: false,
            },
        );
        let ops = &program.entry.ops;
        assert!(ops
            .iter()
            .any(|op| matches!(op, Op::Store(Slot { scope: ScopeKind::Local, .. }, _))));
        assert!(matches!(ops.last(), Some(Op::Ret)));
    }

    #[test]
    fn literals_are_interned_once() {
        let program = compile_src("x := 5\ny := 5\nz := 5", unoptimized());
        let fives = program
            .unit
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Int(5)))
            .count();
        assert_eq!(fives, 1);
    }

    #[test]
    fn jumps_resolve_within_each_function_body() {
        let program = compile_src("f := |n| { if n { return 1 } return 2 }", unoptimized());
        let proto = &program.unit.protos[0];
        for (addr, op) in proto.ops.iter().enumerate() {
            if let Op::PJumpF(t) | Op::Jump(t) = op {
                assert!(
                    (*t as usize) <= proto.ops.len(),
                    "jump at {} out of range: {}",
                    addr,
                    t
                );
            }
        }
    }

    #[test]
    fn closure_captures_emit_upgrade_then_func() {
        let program = compile_src("x := 1\nf := || x", unoptimized());
        let ops = &program.entry.ops;
        let upgrade = ops
            .iter()
            .position(|op| matches!(op, Op::UpgradeRef(_)))
            .expect("missing upgrade");
        assert!(matches!(ops[upgrade + 1], Op::Func { captured: 1, .. }));
    }

    #[test]
    fn optimized_stream_is_never_longer() {
        for src in [
            "x := 1\ny := x + 1\ny == 2 |> assert()",
            "i := 0\nwhile i < 10 { i = i + 1 }",
            "f := |n| { if n <= 1 { return n } return f(n-1) + f(n-2) }\nf(10) == 55 |> assert()",
        ] {
            let plain = compile_src(src, unoptimized());
            let optimized = compile_src(src, CompilerOptions::default());
            assert!(optimized.entry.ops.len() <= plain.entry.ops.len());
        }
    }

    #[test]
    fn break_outside_loop_is_rejected_before_codegen() {
        let registry = std_registry();
        let ast = parse("break").unwrap();
        assert!(lower(&ast, registry.names()).is_err());
    }
}
