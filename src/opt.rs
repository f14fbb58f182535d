//! Per-function cleanup for `ir` bodies: constant folding followed by removal
//! of pure instructions nobody reads.

use crate::ir::{Flag, Inst, Operand};

pub fn run(body: &mut Vec<Inst>) {
    let folded = fold_constants(body);
    let removed = remove_dead(body);
    log::trace!("folded {} and removed {} instructions", folded, removed);
}

fn fold_constants(body: &mut Vec<Inst>) -> usize {
    let mut replaced: Vec<Option<Operand>> = vec![None; body.len()];
    let mut folded = 0;

    for i in 0..body.len() {
        for op in body[i].operands_mut() {
            if let Operand::Temp(t) = *op {
                if let Some(constant) = replaced.get(t).copied().flatten() {
                    *op = constant;
                }
            }
        }

        let value = match body[i] {
            Inst::Arith {
                op,
                lhs: Operand::Const(a),
                rhs: Operand::Const(b),
            } => op.apply(a, b),
            Inst::LessThan {
                lhs: Operand::Const(a),
                rhs: Operand::Const(b),
            } => {
                // unordered or less than
                if a < b || a.is_nan() || b.is_nan() {
                    1.0
                } else {
                    0.0
                }
            }
            Inst::Widen(Flag(Operand::Const(c))) => c,
            _ => continue,
        };

        replaced[i] = Some(Operand::Const(value));
        body[i] = Inst::Nop;
        folded += 1;
    }

    folded
}

fn remove_dead(body: &mut Vec<Inst>) -> usize {
    let mut live = vec![false; body.len()];
    let mut removed = 0;

    for i in (0..body.len()).rev() {
        if body[i].is_pure() && !live[i] {
            body[i] = Inst::Nop;
            removed += 1;
            continue;
        }
        for op in body[i].operands() {
            if let Operand::Temp(t) = op {
                if let Some(slot) = live.get_mut(t) {
                    *slot = true;
                }
            }
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ArithOp;
    use pretty_assertions::assert_eq;

    #[test]
    fn folds_constant_chains() {
        let mut body = vec![
            Inst::Arith {
                op: ArithOp::Add,
                lhs: Operand::Const(1.0),
                rhs: Operand::Const(2.0),
            },
            Inst::Arith {
                op: ArithOp::Mul,
                lhs: Operand::Temp(0),
                rhs: Operand::Const(4.0),
            },
            Inst::Ret(Operand::Temp(1)),
        ];
        run(&mut body);
        assert_eq!(body, vec![Inst::Nop, Inst::Nop, Inst::Ret(Operand::Const(12.0))]);
    }

    #[test]
    fn folds_comparisons_through_widen() {
        let mut body = vec![
            Inst::LessThan {
                lhs: Operand::Const(3.0),
                rhs: Operand::Const(2.0),
            },
            Inst::Widen(Flag(Operand::Temp(0))),
            Inst::Ret(Operand::Temp(1)),
        ];
        run(&mut body);
        assert_eq!(body[2], Inst::Ret(Operand::Const(0.0)));
    }

    #[test]
    fn drops_unused_pure_instructions() {
        let mut body = vec![
            Inst::Arith {
                op: ArithOp::Add,
                lhs: Operand::Param(0),
                rhs: Operand::Const(1.0),
            },
            Inst::Arith {
                op: ArithOp::Sub,
                lhs: Operand::Param(0),
                rhs: Operand::Const(1.0),
            },
            Inst::Ret(Operand::Temp(0)),
        ];
        run(&mut body);
        assert!(matches!(body[0], Inst::Arith { .. }));
        assert_eq!(body[1], Inst::Nop);
    }
}
