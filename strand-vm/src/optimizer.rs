//! Peephole super-instruction optimizer.
//!
//! A fixpoint loop over priority-ordered rewrite rules. Rules match a
//! window of whole instructions (operands are inline in each element, so a
//! match can never straddle a partial operand) and replace it with one
//! denser instruction. Label markers match no rule, which keeps fusion
//! from crossing a jump target; jump operands are still label ids at this
//! point, so rewrites never invalidate them.
//!
//! Every rewrite strictly shrinks the stream and no rule's output is
//! matched by an earlier rule, so the fixpoint terminates.

use strand_bytecode::Op;

type Rule = fn(&[Op]) -> Option<(usize, Op)>;

/// Priority-ordered rule set. Constants load through `Load(const, i)`, so
/// const-operand fusions fall out of the load rules for free.
const RULES: &[Rule] = &[store_pop, invert_not_jump, load_load_bin, load_bin, load_let];

/// `Store; Pop` -> `Let`: assignment used as a statement.
fn store_pop(window: &[Op]) -> Option<(usize, Op)> {
    match window {
        [Op::Store(slot, is_ref), Op::Pop, ..] => Some((2, Op::Let(*slot, *is_ref))),
        _ => None,
    }
}

/// `Not` followed by a conditional jump becomes the inverted jump.
fn invert_not_jump(window: &[Op]) -> Option<(usize, Op)> {
    match window {
        [Op::Not, Op::PJumpF(t), ..] => Some((2, Op::PJumpT(*t))),
        [Op::Not, Op::PJumpT(t), ..] => Some((2, Op::PJumpF(*t))),
        [Op::Not, Op::JumpF(t), ..] => Some((2, Op::JumpT(*t))),
        [Op::Not, Op::JumpT(t), ..] => Some((2, Op::JumpF(*t))),
        _ => None,
    }
}

/// `Load a; Load b; Bin op` -> `LoadLoadBin(op, a, b)`.
fn load_load_bin(window: &[Op]) -> Option<(usize, Op)> {
    match window {
        [Op::Load(a), Op::Load(b), Op::Bin(op), ..] => Some((3, Op::LoadLoadBin(*op, *a, *b))),
        _ => None,
    }
}

/// `Load a; Bin op` -> `LoadBin(op, a)` with the left operand on the stack.
fn load_bin(window: &[Op]) -> Option<(usize, Op)> {
    match window {
        [Op::Load(a), Op::Bin(op), ..] => Some((2, Op::LoadBin(*op, *a))),
        _ => None,
    }
}

/// `Load src; Let dst` -> `LoadLet(src, dst)`: slot-to-slot copy.
fn load_let(window: &[Op]) -> Option<(usize, Op)> {
    match window {
        [Op::Load(src), Op::Let(dst, is_ref), ..] => Some((2, Op::LoadLet(*src, *dst, *is_ref))),
        _ => None,
    }
}

/// Run rules to fixpoint.
pub fn optimize(mut ops: Vec<Op>) -> Vec<Op> {
    loop {
        let mut dirty = false;
        for rule in RULES {
            let (next, changed) = apply(ops, *rule);
            ops = next;
            dirty |= changed;
        }
        if !dirty {
            return ops;
        }
    }
}

fn apply(ops: Vec<Op>, rule: Rule) -> (Vec<Op>, bool) {
    let mut out = Vec::with_capacity(ops.len());
    let mut dirty = false;
    let mut i = 0;
    while i < ops.len() {
        match rule(&ops[i..]) {
            Some((eaten, replacement)) => {
                out.push(replacement);
                i += eaten;
                dirty = true;
            }
            None => {
                out.push(ops[i]);
                i += 1;
            }
        }
    }
    (out, dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_bytecode::{BinOp, ScopeKind, Slot};

    fn local(i: u16) -> Slot {
        Slot::new(ScopeKind::Local, i)
    }

    #[test]
    fn store_pop_fuses_to_let() {
        let ops = optimize(vec![Op::Store(local(0), false), Op::Pop]);
        assert_eq!(ops, vec![Op::Let(local(0), false)]);
    }

    #[test]
    fn not_jump_inverts() {
        let ops = optimize(vec![Op::Not, Op::PJumpF(3)]);
        assert_eq!(ops, vec![Op::PJumpT(3)]);
        let ops = optimize(vec![Op::Not, Op::JumpT(1)]);
        assert_eq!(ops, vec![Op::JumpF(1)]);
    }

    #[test]
    fn load_load_bin_fuses() {
        let ops = optimize(vec![
            Op::Load(local(0)),
            Op::Load(local(1)),
            Op::Bin(BinOp::Lt),
        ]);
        assert_eq!(ops, vec![Op::LoadLoadBin(BinOp::Lt, local(0), local(1))]);
    }

    #[test]
    fn load_bin_fuses_when_left_is_on_stack() {
        let ops = optimize(vec![Op::Index, Op::Load(Slot::konst(2)), Op::Bin(BinOp::Add)]);
        assert_eq!(
            ops,
            vec![Op::Index, Op::LoadBin(BinOp::Add, Slot::konst(2))]
        );
    }

    #[test]
    fn const_store_fuses_through_let() {
        // `x := 1` emits Load(const) Store Pop; two rules cooperate.
        let ops = optimize(vec![
            Op::Load(Slot::konst(0)),
            Op::Store(local(0), false),
            Op::Pop,
        ]);
        assert_eq!(ops, vec![Op::LoadLet(Slot::konst(0), local(0), false)]);
    }

    #[test]
    fn labels_block_fusion() {
        let ops = vec![
            Op::Load(local(0)),
            Op::Label(0),
            Op::Load(local(1)),
            Op::Bin(BinOp::Add),
        ];
        let out = optimize(ops);
        // The second load may fuse with the op, but never across the label.
        assert!(matches!(out[0], Op::Load(_)));
        assert!(matches!(out[1], Op::Label(0)));
        assert_eq!(out[2], Op::LoadBin(BinOp::Add, local(1)));
    }

    #[test]
    fn optimization_never_grows_the_stream() {
        let streams = vec![
            vec![Op::Not, Op::Not, Op::PJumpF(0)],
            vec![
                Op::Load(local(0)),
                Op::Load(local(1)),
                Op::Bin(BinOp::Add),
                Op::Store(local(2), false),
                Op::Pop,
            ],
        ];
        for ops in streams {
            let before = ops.len();
            assert!(optimize(ops).len() <= before);
        }
    }

    #[test]
    fn fixpoint_terminates_on_repetitive_input() {
        let mut ops = Vec::new();
        for _ in 0..200 {
            ops.push(Op::Load(local(0)));
            ops.push(Op::Load(local(1)));
            ops.push(Op::Bin(BinOp::Add));
            ops.push(Op::Pop);
        }
        let out = optimize(ops);
        assert_eq!(out.len(), 400);
    }
}
