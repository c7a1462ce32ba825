//! AST -> IR lowering: scope resolution, capture analysis, desugaring.

use rustc_hash::FxHashSet;
use strand_syntax::ast::{self, Expr, FunctionBody, Pattern, PostfixOp, Stmt};
use thiserror::Error;
use tracing::trace;

use crate::node::*;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LowerError {
    #[error("cannot find variable `{0}`")]
    UnresolvedVariable(String),

    #[error("variable `{0}` already defined in this scope")]
    AlreadyDefined(String),

    #[error("invalid left-hand side of assignment")]
    InvalidAssignTarget,

    #[error("right operand of a pipe must be a call expression")]
    PipeIntoNonCall,

    #[error("`break` outside of a loop")]
    BreakOutsideLoop,

    #[error("`continue` outside of a loop")]
    ContinueOutsideLoop,
}

/// Lower a parsed program. `builtins` is the set of names the registry can
/// resolve; identifiers that are neither declared variables nor registry
/// names are hard errors.
pub fn lower(
    program: &ast::Program,
    builtins: &FxHashSet<String>,
) -> Result<ProgramIr, LowerError> {
    let mut lowerer = Lowerer {
        frames: vec![FrameState::new()],
        builtins,
    };

    let mut body = Vec::new();
    for stmt in &program.statements {
        body.push(lowerer.stmt(stmt)?);
    }

    let entry = lowerer.pop_frame(body, 0);
    Ok(ProgramIr { entry })
}

struct VarSlot {
    name: Option<String>,
    /// Slot is not bound in any active block and may be reused.
    free: bool,
    /// Slot is closed over and lives in a shared ref cell; never reused.
    captured: bool,
}

struct FreeSlot {
    name: String,
    parent: Var,
}

struct FrameState {
    vars: Vec<VarSlot>,
    free_vars: Vec<FreeSlot>,
    /// Active block stack; each entry holds the slots it owns.
    blocks: Vec<Vec<usize>>,
    /// Innermost-first loop contexts; a `for` loop carries its increment so
    /// `continue` can run it before jumping back.
    loops: Vec<Option<StmtIr>>,
}

impl FrameState {
    fn new() -> Self {
        Self {
            vars: Vec::new(),
            free_vars: Vec::new(),
            blocks: vec![Vec::new()],
            loops: Vec::new(),
        }
    }
}

struct Lowerer<'a> {
    frames: Vec<FrameState>,
    builtins: &'a FxHashSet<String>,
}

impl<'a> Lowerer<'a> {
    fn frame(&mut self) -> &mut FrameState {
        self.frames.last_mut().expect("frame stack never empty")
    }

    fn push_block(&mut self) {
        self.frame().blocks.push(Vec::new());
    }

    fn pop_block(&mut self) {
        let frame = self.frame();
        let slots = frame.blocks.pop().expect("unbalanced block pop");
        for slot in slots {
            frame.vars[slot].free = true;
        }
    }

    fn pop_frame(&mut self, body: Vec<StmtIr>, param_count: usize) -> FrameIr {
        let frame = self.frames.pop().expect("unbalanced frame pop");
        FrameIr {
            var_count: frame.vars.len(),
            param_count,
            free_vars: frame.free_vars.iter().map(|fv| fv.parent).collect(),
            captured: frame.vars.iter().map(|v| v.captured).collect(),
            body,
        }
    }

    /// Allocate a slot in the current block, reusing a freed sibling slot
    /// when one is available. `None` allocates an anonymous scratch slot.
    fn define(&mut self, name: Option<&str>) -> Result<Var, LowerError> {
        let frame = self.frames.last_mut().expect("frame stack never empty");

        if let Some(name) = name {
            let block = frame.blocks.last().expect("block stack never empty");
            for &slot in block {
                if !frame.vars[slot].free && frame.vars[slot].name.as_deref() == Some(name) {
                    return Err(LowerError::AlreadyDefined(name.to_string()));
                }
            }
        }

        let index = match frame.vars.iter().position(|v| v.free && !v.captured) {
            Some(index) => {
                frame.vars[index].free = false;
                frame.vars[index].name = name.map(String::from);
                index
            }
            None => {
                frame.vars.push(VarSlot {
                    name: name.map(String::from),
                    free: false,
                    captured: false,
                });
                frame.vars.len() - 1
            }
        };

        frame.blocks.last_mut().unwrap().push(index);
        trace!(name = ?name, index, "define");

        Ok(Var {
            scope: VarScope::Local,
            index,
        })
    }

    fn free_slot(&mut self, var: Var) {
        debug_assert_eq!(var.scope, VarScope::Local);
        self.frame().vars[var.index].free = true;
    }

    fn resolve(&mut self, name: &str) -> Option<Var> {
        self.resolve_in(self.frames.len() - 1, name)
    }

    /// Search a frame's live slots (innermost binding first), then its free
    /// variables, then the enclosing frames; a cross-frame hit is promoted
    /// into a free variable of this frame and the origin is marked captured.
    fn resolve_in(&mut self, frame_index: usize, name: &str) -> Option<Var> {
        let frame = &self.frames[frame_index];
        for index in (0..frame.vars.len()).rev() {
            let slot = &frame.vars[index];
            if !slot.free && slot.name.as_deref() == Some(name) {
                return Some(Var {
                    scope: VarScope::Local,
                    index,
                });
            }
        }
        for (index, fv) in frame.free_vars.iter().enumerate() {
            if fv.name == name {
                return Some(Var {
                    scope: VarScope::Free,
                    index,
                });
            }
        }

        if frame_index == 0 {
            return None;
        }

        let parent = self.resolve_in(frame_index - 1, name)?;
        if parent.scope == VarScope::Local {
            self.frames[frame_index - 1].vars[parent.index].captured = true;
        }

        let frame = &mut self.frames[frame_index];
        let index = frame.free_vars.len();
        frame.free_vars.push(FreeSlot {
            name: name.to_string(),
            parent,
        });
        trace!(name, index, "capture");

        Some(Var {
            scope: VarScope::Free,
            index,
        })
    }

    // ----- statements -----

    fn stmt(&mut self, stmt: &Stmt) -> Result<StmtIr, LowerError> {
        match stmt {
            Stmt::Let { name, value } => {
                // The slot is live before the value is lowered so that a
                // function literal can refer to its own binding.
                let var = self.define(Some(name))?;
                let value = self.expr(value)?;
                Ok(StmtIr::Expr(ExprIr::Assign {
                    var,
                    value: Box::new(value),
                }))
            }

            Stmt::Block(statements) => {
                self.push_block();
                let mut body = Vec::new();
                for stmt in statements {
                    body.push(self.stmt(stmt)?);
                }
                self.pop_block();
                Ok(StmtIr::Block(body))
            }

            Stmt::If { cond, body, alt } => {
                let cond = self.expr(cond)?;
                let body = self.stmt(body)?;
                let alt = match alt {
                    Some(alt) => Some(Box::new(self.stmt(alt)?)),
                    None => None,
                };
                Ok(StmtIr::If {
                    cond,
                    body: Box::new(body),
                    alt,
                })
            }

            Stmt::While { cond, body } => {
                let cond = self.expr(cond)?;
                self.frame().loops.push(None);
                let body = self.stmt(body)?;
                self.frame().loops.pop();

                Ok(StmtIr::Loop(Box::new(StmtIr::Block(vec![
                    break_unless(cond),
                    body,
                ]))))
            }

            Stmt::For {
                init,
                cond,
                incr,
                body,
            } => {
                self.push_block();
                let init = self.stmt(init)?;
                let cond = self.expr(cond)?;
                let incr = StmtIr::Expr(self.expr(incr)?);

                self.frame().loops.push(Some(incr.clone()));
                let body = self.stmt(body)?;
                self.frame().loops.pop();

                self.pop_block();
                Ok(StmtIr::Block(vec![
                    init,
                    StmtIr::Loop(Box::new(StmtIr::Block(vec![
                        break_unless(cond),
                        body,
                        incr,
                    ]))),
                ]))
            }

            Stmt::ForRange {
                name,
                start,
                end,
                body,
            } => {
                self.push_block();
                let counter = self.define(Some(name))?;
                let start = self.expr(start)?;
                let limit = self.define(None)?;
                let end = self.expr(end)?;

                let cond = ExprIr::Binary {
                    op: BinOpIr::Lt,
                    operands: vec![ExprIr::Load(counter), ExprIr::Load(limit)],
                };
                let incr = StmtIr::Expr(ExprIr::Assign {
                    var: counter,
                    value: Box::new(ExprIr::Binary {
                        op: BinOpIr::Add,
                        operands: vec![ExprIr::Load(counter), ExprIr::Int(1)],
                    }),
                });

                self.frame().loops.push(Some(incr.clone()));
                let body = self.stmt(body)?;
                self.frame().loops.pop();

                self.pop_block();
                Ok(StmtIr::Block(vec![
                    StmtIr::Expr(ExprIr::Assign {
                        var: counter,
                        value: Box::new(start),
                    }),
                    StmtIr::Expr(ExprIr::Assign {
                        var: limit,
                        value: Box::new(end),
                    }),
                    StmtIr::Loop(Box::new(StmtIr::Block(vec![
                        break_unless(cond),
                        body,
                        incr,
                    ]))),
                ]))
            }

            Stmt::Match {
                expr,
                cases,
                default,
            } => self.lower_match(expr, cases, default.as_deref()),

            Stmt::Return(expr) => Ok(StmtIr::Return(self.expr(expr)?)),

            Stmt::Break => {
                if self.frame().loops.is_empty() {
                    return Err(LowerError::BreakOutsideLoop);
                }
                Ok(StmtIr::Break)
            }

            Stmt::Continue => {
                match self.frame().loops.last() {
                    None => Err(LowerError::ContinueOutsideLoop),
                    // A `for` loop's increment runs before jumping back.
                    Some(Some(incr)) => {
                        Ok(StmtIr::Block(vec![incr.clone(), StmtIr::Continue]))
                    }
                    Some(None) => Ok(StmtIr::Continue),
                }
            }

            Stmt::Expr(expr) => Ok(StmtIr::Expr(self.expr(expr)?)),
        }
    }

    // ----- match lowering -----

    fn lower_match(
        &mut self,
        subject: &Expr,
        cases: &[ast::MatchCase],
        default: Option<&Stmt>,
    ) -> Result<StmtIr, LowerError> {
        self.push_block();
        let subject_var = self.define(None)?;
        let subject_ir = self.expr(subject)?;
        let head = StmtIr::Expr(ExprIr::Assign {
            var: subject_var,
            value: Box::new(subject_ir),
        });

        if cases.is_empty() && default.is_none() {
            self.pop_block();
            return Ok(StmtIr::Block(vec![head]));
        }

        self.push_block();
        let mut scratch: Vec<usize> = Vec::new();

        let mut chain: Option<StmtIr> = match default {
            Some(stmt) => Some(self.stmt(stmt)?),
            None => None,
        };

        for case in cases.iter().rev() {
            let mut cond =
                self.pattern_cond(&case.pattern, ExprIr::Load(subject_var), &mut scratch)?;
            if let Some(guard) = &case.guard {
                cond = ExprIr::Binary {
                    op: BinOpIr::And,
                    operands: vec![cond, self.expr(guard)?],
                };
            }
            let body = self.stmt(&case.body)?;

            // Case bindings end here; their slots are reusable by the
            // preceding (outer-in-chain) cases.
            let block_slots = self.frame().blocks.last().unwrap().clone();
            for slot in block_slots {
                self.frame().vars[slot].free = true;
            }

            chain = Some(StmtIr::If {
                cond,
                body: Box::new(body),
                alt: chain.map(Box::new),
            });
        }

        // Scratch slots are reused across cases; preset them all to nil
        // ahead of the chain so no case observes a sibling's leftovers.
        let mut inner = Vec::new();
        let mut seen = Vec::new();
        for &slot in &scratch {
            if !seen.contains(&slot) {
                seen.push(slot);
                inner.push(StmtIr::Expr(ExprIr::Assign {
                    var: Var {
                        scope: VarScope::Local,
                        index: slot,
                    },
                    value: Box::new(ExprIr::Nil),
                }));
            }
        }
        if let Some(chain) = chain {
            inner.push(chain);
        }

        self.pop_block();
        let result = StmtIr::Block(vec![head, StmtIr::Block(inner)]);
        self.pop_block();
        Ok(result)
    }

    /// Build the boolean condition for one pattern against `subject`.
    fn pattern_cond(
        &mut self,
        pattern: &Pattern,
        subject: ExprIr,
        scratch: &mut Vec<usize>,
    ) -> Result<ExprIr, LowerError> {
        match pattern {
            Pattern::Int(v) => Ok(and(vec![
                type_check(subject.clone(), "int"),
                eq(subject, ExprIr::Int(*v)),
            ])),
            Pattern::Float(v) => Ok(and(vec![
                type_check(subject.clone(), "float"),
                eq(subject, ExprIr::Float(*v)),
            ])),
            Pattern::Str(v) => Ok(and(vec![
                type_check(subject.clone(), "string"),
                eq(subject, ExprIr::Str(v.clone())),
            ])),
            Pattern::Bool(v) => Ok(and(vec![
                type_check(subject.clone(), "bool"),
                eq(subject, ExprIr::Bool(*v)),
            ])),
            Pattern::Nil => Ok(type_check(subject, "nil")),

            Pattern::Ident(name) => {
                let var = self.define(Some(name))?;
                Ok(assign_or_true(var, subject))
            }

            Pattern::Array(items) => {
                let mut operands = vec![
                    type_check(subject.clone(), "array"),
                    len_at_least(subject.clone(), items.len()),
                ];
                for (i, item) in items.iter().enumerate() {
                    let slot = self.define(None)?;
                    scratch.push(slot.index);
                    operands.push(assign_or_true(
                        slot,
                        ExprIr::Index {
                            target: Box::new(subject.clone()),
                            index: Box::new(ExprIr::Int(i as i64)),
                        },
                    ));
                    let child = self.pattern_cond(item, ExprIr::Load(slot), scratch)?;
                    self.free_slot(slot);
                    operands.push(child);
                }
                Ok(and(operands))
            }

            Pattern::Object(fields) => {
                let mut operands = vec![
                    type_check(subject.clone(), "object"),
                    len_at_least(subject.clone(), fields.len()),
                ];
                for (key, value) in fields {
                    let slot = self.define(None)?;
                    scratch.push(slot.index);
                    operands.push(assign_or_true(
                        slot,
                        ExprIr::Index {
                            target: Box::new(subject.clone()),
                            index: Box::new(ExprIr::Str(key.clone())),
                        },
                    ));
                    let child = self.pattern_cond(value, ExprIr::Load(slot), scratch)?;
                    self.free_slot(slot);
                    operands.push(child);
                }
                Ok(and(operands))
            }
        }
    }

    // ----- expressions -----

    fn expr(&mut self, expr: &Expr) -> Result<ExprIr, LowerError> {
        match expr {
            Expr::Nil => Ok(ExprIr::Nil),
            Expr::Int(v) => Ok(ExprIr::Int(*v)),
            Expr::Float(v) => Ok(ExprIr::Float(*v)),
            Expr::Bool(v) => Ok(ExprIr::Bool(*v)),
            Expr::Str(v) => Ok(ExprIr::Str(v.clone())),

            Expr::Ident(name) => {
                if let Some(var) = self.resolve(name) {
                    return Ok(ExprIr::Load(var));
                }
                if self.builtins.contains(name) {
                    return Ok(ExprIr::Builtin(name.clone()));
                }
                Err(LowerError::UnresolvedVariable(name.clone()))
            }

            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.expr(item)?);
                }
                Ok(ExprIr::Array(out))
            }

            Expr::Object(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    out.push((key.clone(), self.expr(value)?));
                }
                Ok(ExprIr::Object(out))
            }

            Expr::Function { params, body } => {
                self.frames.push(FrameState::new());
                for param in params {
                    self.define(Some(param))?;
                }

                let body_ir = match body {
                    FunctionBody::Block(statements) => {
                        let mut out = Vec::new();
                        for stmt in statements {
                            out.push(self.stmt(stmt)?);
                        }
                        out
                    }
                    FunctionBody::Expr(expr) => {
                        vec![StmtIr::Return(self.expr(expr)?)]
                    }
                };

                let frame = self.pop_frame(body_ir, params.len());
                Ok(ExprIr::Frame(frame))
            }

            Expr::Assign { target, value } => {
                let value = self.expr(value)?;
                match target.as_ref() {
                    Expr::Ident(name) => {
                        let var = self
                            .resolve(name)
                            .ok_or_else(|| LowerError::UnresolvedVariable(name.clone()))?;
                        Ok(ExprIr::Assign {
                            var,
                            value: Box::new(value),
                        })
                    }
                    Expr::Postfix { expr, ops } => {
                        let (last, rest) = ops.split_last().expect("postfix has ops");
                        let index = match last {
                            PostfixOp::Index(index) => self.expr(index)?,
                            PostfixOp::Field(name) => ExprIr::Str(name.clone()),
                            PostfixOp::Call(_) => return Err(LowerError::InvalidAssignTarget),
                        };
                        let target = self.postfix(expr, rest)?;
                        Ok(ExprIr::IndexAssign {
                            target: Box::new(target),
                            index: Box::new(index),
                            value: Box::new(value),
                        })
                    }
                    _ => Err(LowerError::InvalidAssignTarget),
                }
            }

            Expr::Ternary { cond, then, alt } => Ok(ExprIr::Ternary {
                cond: Box::new(self.expr(cond)?),
                then: Box::new(self.expr(then)?),
                alt: Box::new(self.expr(alt)?),
            }),

            Expr::Binary { op, operands } => {
                if *op == ast::BinaryOp::Pipe {
                    return self.pipe(operands);
                }
                let mut out = Vec::with_capacity(operands.len());
                for operand in operands {
                    out.push(self.expr(operand)?);
                }
                Ok(ExprIr::Binary {
                    op: bin_op(*op),
                    operands: out,
                })
            }

            Expr::Unary { op, expr } => Ok(ExprIr::Unary {
                op: match op {
                    ast::UnaryOp::Not => UnOpIr::Not,
                    ast::UnaryOp::Neg => UnOpIr::Neg,
                },
                expr: Box::new(self.expr(expr)?),
            }),

            Expr::Postfix { expr, ops } => self.postfix(expr, ops),

            Expr::Try(expr) => Ok(ExprIr::Try(Box::new(self.expr(expr)?))),
            Expr::Raise(expr) => Ok(ExprIr::Raise(Box::new(self.expr(expr)?))),
        }
    }

    fn postfix(&mut self, base: &Expr, ops: &[PostfixOp]) -> Result<ExprIr, LowerError> {
        let mut acc = self.expr(base)?;
        for op in ops {
            acc = match op {
                PostfixOp::Call(args) => {
                    let mut out = Vec::with_capacity(args.len());
                    for arg in args {
                        out.push(self.expr(arg)?);
                    }
                    ExprIr::Call {
                        callee: Box::new(acc),
                        args: out,
                    }
                }
                PostfixOp::Index(index) => ExprIr::Index {
                    target: Box::new(acc),
                    index: Box::new(self.expr(index)?),
                },
                PostfixOp::Field(name) => ExprIr::Index {
                    target: Box::new(acc),
                    index: Box::new(ExprIr::Str(name.clone())),
                },
            };
        }
        Ok(acc)
    }

    /// `a |> f(x) |> g(y)` becomes `g(f(a, x), y)`: each stage's value is
    /// inserted as the first argument of the next call.
    fn pipe(&mut self, operands: &[Expr]) -> Result<ExprIr, LowerError> {
        let mut acc = self.expr(&operands[0])?;
        for stage in &operands[1..] {
            let stage_ir = self.expr(stage)?;
            match stage_ir {
                ExprIr::Call { callee, mut args } => {
                    args.insert(0, acc);
                    acc = ExprIr::Call { callee, args };
                }
                _ => return Err(LowerError::PipeIntoNonCall),
            }
        }
        Ok(acc)
    }
}

fn bin_op(op: ast::BinaryOp) -> BinOpIr {
    match op {
        ast::BinaryOp::Or => BinOpIr::Or,
        ast::BinaryOp::And => BinOpIr::And,
        ast::BinaryOp::Eq => BinOpIr::Eq,
        ast::BinaryOp::Ne => BinOpIr::Ne,
        ast::BinaryOp::Lt => BinOpIr::Lt,
        ast::BinaryOp::Le => BinOpIr::Le,
        ast::BinaryOp::Gt => BinOpIr::Gt,
        ast::BinaryOp::Ge => BinOpIr::Ge,
        ast::BinaryOp::Add => BinOpIr::Add,
        ast::BinaryOp::Sub => BinOpIr::Sub,
        ast::BinaryOp::Mul => BinOpIr::Mul,
        ast::BinaryOp::Div => BinOpIr::Div,
        ast::BinaryOp::Mod => BinOpIr::Mod,
        ast::BinaryOp::Pipe => unreachable!("pipes are rewritten into calls"),
    }
}

fn break_unless(cond: ExprIr) -> StmtIr {
    StmtIr::If {
        cond: ExprIr::Unary {
            op: UnOpIr::Not,
            expr: Box::new(cond),
        },
        body: Box::new(StmtIr::Break),
        alt: None,
    }
}

fn and(operands: Vec<ExprIr>) -> ExprIr {
    ExprIr::Binary {
        op: BinOpIr::And,
        operands,
    }
}

fn eq(left: ExprIr, right: ExprIr) -> ExprIr {
    ExprIr::Binary {
        op: BinOpIr::Eq,
        operands: vec![left, right],
    }
}

fn type_check(subject: ExprIr, type_name: &str) -> ExprIr {
    eq(
        ExprIr::Call {
            callee: Box::new(ExprIr::Builtin("type".to_string())),
            args: vec![subject],
        },
        ExprIr::Str(type_name.to_string()),
    )
}

fn len_at_least(subject: ExprIr, n: usize) -> ExprIr {
    ExprIr::Binary {
        op: BinOpIr::Ge,
        operands: vec![
            ExprIr::Call {
                callee: Box::new(ExprIr::Builtin("len".to_string())),
                args: vec![subject],
            },
            ExprIr::Int(n as i64),
        ],
    }
}

/// `(var = value) || true`: binds and always matches.
fn assign_or_true(var: Var, value: ExprIr) -> ExprIr {
    ExprIr::Binary {
        op: BinOpIr::Or,
        operands: vec![
            ExprIr::Assign {
                var,
                value: Box::new(value),
            },
            ExprIr::Bool(true),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_syntax::parse;

    fn builtins() -> FxHashSet<String> {
        ["type", "len", "echo", "assert"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn lower_src(src: &str) -> Result<ProgramIr, LowerError> {
        lower(&parse(src).unwrap(), &builtins())
    }

    #[test]
    fn unresolved_identifier_is_an_error() {
        assert_eq!(
            lower_src("x + 1").unwrap_err(),
            LowerError::UnresolvedVariable("x".to_string())
        );
    }

    #[test]
    fn builtin_names_resolve() {
        let ir = lower_src("echo(1)").unwrap();
        let StmtIr::Expr(ExprIr::Call { callee, .. }) = &ir.entry.body[0] else {
            panic!("not a call");
        };
        assert_eq!(**callee, ExprIr::Builtin("echo".to_string()));
    }

    #[test]
    fn closure_capture_promotes_to_free_var() {
        let ir = lower_src("x := 1\nf := || x").unwrap();
        assert!(ir.entry.captured[0], "x must be marked captured");

        let StmtIr::Expr(ExprIr::Assign { value, .. }) = &ir.entry.body[1] else {
            panic!("not an assign");
        };
        let ExprIr::Frame(frame) = value.as_ref() else {
            panic!("not a frame");
        };
        assert_eq!(
            frame.free_vars,
            vec![Var {
                scope: VarScope::Local,
                index: 0
            }]
        );
        assert_eq!(
            frame.body,
            vec![StmtIr::Return(ExprIr::Load(Var {
                scope: VarScope::Free,
                index: 0
            }))]
        );
    }

    #[test]
    fn nested_capture_threads_through_intermediate_frame() {
        let ir = lower_src("x := 1\nf := || || x").unwrap();
        let StmtIr::Expr(ExprIr::Assign { value, .. }) = &ir.entry.body[1] else {
            panic!()
        };
        let ExprIr::Frame(outer) = value.as_ref() else {
            panic!()
        };
        // Outer closure captures x from the root frame...
        assert_eq!(outer.free_vars.len(), 1);
        let StmtIr::Return(ExprIr::Frame(inner)) = &outer.body[0] else {
            panic!("inner closure missing");
        };
        // ...and the inner closure captures the outer's free slot.
        assert_eq!(
            inner.free_vars,
            vec![Var {
                scope: VarScope::Free,
                index: 0
            }]
        );
    }

    #[test]
    fn sibling_blocks_reuse_slots() {
        let ir = lower_src("{ a := 1 }\n{ b := 2 }").unwrap();
        // The second block's variable reuses the first one's slot.
        assert_eq!(ir.entry.var_count, 1);
    }

    #[test]
    fn captured_slots_are_not_reused() {
        let ir = lower_src("{ a := 1\nf := || a }\n{ b := 2 }").unwrap();
        // a is captured, so b gets f's slot or a fresh one, never a's.
        assert!(ir.entry.captured[0]);
        let StmtIr::Block(stmts) = &ir.entry.body[1] else {
            panic!()
        };
        let StmtIr::Expr(ExprIr::Assign { var, .. }) = &stmts[0] else {
            panic!()
        };
        assert_ne!(var.index, 0);
    }

    #[test]
    fn while_desugars_to_guarded_loop() {
        let ir = lower_src("x := 0\nwhile x < 3 { x = x + 1 }").unwrap();
        let StmtIr::Loop(body) = &ir.entry.body[1] else {
            panic!("not a loop");
        };
        let StmtIr::Block(stmts) = body.as_ref() else {
            panic!()
        };
        assert!(matches!(
            &stmts[0],
            StmtIr::If { cond: ExprIr::Unary { op: UnOpIr::Not, .. }, .. }
        ));
    }

    #[test]
    fn continue_in_for_loop_runs_increment() {
        let ir = lower_src("for i := 0; i < 3; i = i + 1 { continue }").unwrap();
        let StmtIr::Block(outer) = &ir.entry.body[0] else {
            panic!()
        };
        let StmtIr::Loop(loop_body) = &outer[1] else {
            panic!()
        };
        let StmtIr::Block(stmts) = loop_body.as_ref() else {
            panic!()
        };
        // body is stmts[1]; the lowered continue is a block of incr + continue
        let StmtIr::Block(body) = &stmts[1] else {
            panic!()
        };
        let StmtIr::Block(cont) = &body[0] else {
            panic!("continue not wrapped with increment");
        };
        assert!(matches!(cont[0], StmtIr::Expr(ExprIr::Assign { .. })));
        assert_eq!(cont[1], StmtIr::Continue);
    }

    #[test]
    fn pipe_rewrites_into_nested_calls() {
        let ir = lower_src("3 |> echo()").unwrap();
        let StmtIr::Expr(ExprIr::Call { callee, args }) = &ir.entry.body[0] else {
            panic!("not a call");
        };
        assert_eq!(**callee, ExprIr::Builtin("echo".to_string()));
        assert_eq!(args[0], ExprIr::Int(3));
    }

    #[test]
    fn pipe_into_non_call_is_an_error() {
        assert_eq!(lower_src("x := 1\n2 |> x"), Err(LowerError::PipeIntoNonCall));
    }

    #[test]
    fn assignment_to_call_is_an_error() {
        assert_eq!(
            lower_src("f := || 1\nf() = 2"),
            Err(LowerError::InvalidAssignTarget)
        );
    }

    #[test]
    fn match_presets_scratch_slots() {
        let ir = lower_src("x := [1]\nmatch x { [a] => echo(a) }").unwrap();
        let StmtIr::Block(outer) = &ir.entry.body[1] else {
            panic!("match should lower to a block");
        };
        // head assign + inner block
        assert!(matches!(outer[0], StmtIr::Expr(ExprIr::Assign { .. })));
        let StmtIr::Block(inner) = &outer[1] else {
            panic!()
        };
        // first statement presets the scratch slot to nil
        let StmtIr::Expr(ExprIr::Assign { value, .. }) = &inner[0] else {
            panic!("missing scratch preset");
        };
        assert_eq!(**value, ExprIr::Nil);
        assert!(matches!(inner[1], StmtIr::If { .. }));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert_eq!(lower_src("break"), Err(LowerError::BreakOutsideLoop));
    }

    #[test]
    fn duplicate_let_in_same_block_is_an_error() {
        assert_eq!(
            lower_src("a := 1\na := 2"),
            Err(LowerError::AlreadyDefined("a".to_string()))
        );
    }
}
