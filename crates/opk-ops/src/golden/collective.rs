//! Collective primitives. Inputs are the per-rank tensors gathered from
//! every participant, ordered by rank.

use opk_tensor::{BinaryOp, Tensor};

use super::{input, to_usize};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const ALL_REDUCE_TYPES: [(&str, i64); 4] = [("sum", 0), ("prod", 1), ("max", 2), ("min", 3)];

fn same_shapes(inputs: &[Tensor], op: &str) -> Result<(), GoldenError> {
    let Some(first) = inputs.first() else {
        return Err(GoldenError::domain(format!("{op} needs at least one rank tensor")));
    };
    if let Some(odd) = inputs.iter().find(|t| t.shape() != first.shape()) {
        return Err(GoldenError::domain(format!(
            "{op} rank tensors disagree: {:?} vs {:?}",
            first.shape(),
            odd.shape()
        )));
    }
    Ok(())
}

/// Stacks the per-rank tensors along a new leading dimension.
pub fn all_gather(inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    same_shapes(inputs, "all_gather")?;
    let refs: Vec<&Tensor> = inputs.iter().collect();
    Ok(vec![Tensor::stack(&refs, 0)?])
}

pub fn all_reduce(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let op = match param.code("allReduceType", &ALL_REDUCE_TYPES)? {
        0 => BinaryOp::Add,
        1 => BinaryOp::Mul,
        2 => BinaryOp::Maximum,
        3 => BinaryOp::Minimum,
        other => return Err(GoldenError::unsupported("allReduceType", other)),
    };
    same_shapes(inputs, "all_reduce")?;
    let mut acc = inputs[0].clone();
    for next in &inputs[1..] {
        acc = acc.elementwise_binary(next, op)?;
    }
    let dtype = inputs[0].dtype();
    Ok(vec![acc.cast(dtype)])
}

/// The tensor contributed by `rankRoot`.
pub fn broadcast(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let root = to_usize(param.i64("rankRoot")?, "rankRoot")?;
    if root >= inputs.len() {
        return Err(GoldenError::index(format!(
            "rankRoot {root} outside {} rank tensors",
            inputs.len()
        )));
    }
    Ok(vec![input(inputs, root)?.clone()])
}

#[cfg(test)]
mod tests {
    use super::{all_gather, all_reduce, broadcast};
    use crate::golden::testing::{p, t};
    use serde_json::json;

    #[test]
    fn all_gather_stacks_ranks() {
        let out = all_gather(&[t(&[2], &[1.0, 2.0]), t(&[2], &[3.0, 4.0])]).expect("same shapes");
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].values(), &[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(all_gather(&[]).expect_err("no ranks").kind(), "DomainError");
        assert_eq!(
            all_gather(&[t(&[2], &[1.0, 2.0]), t(&[1], &[3.0])])
                .expect_err("ragged")
                .kind(),
            "DomainError"
        );
    }

    #[test]
    fn all_reduce_kinds() {
        let ranks = [t(&[2], &[1.0, 5.0]), t(&[2], &[3.0, 2.0])];
        let sum = all_reduce(&p(json!({"allReduceType": "sum"})), &ranks).expect("sum");
        assert_eq!(sum[0].values(), &[4.0, 7.0]);
        let max = all_reduce(&p(json!({"allReduceType": "max"})), &ranks).expect("max");
        assert_eq!(max[0].values(), &[3.0, 5.0]);
        let prod = all_reduce(&p(json!({"allReduceType": "prod"})), &ranks).expect("prod");
        assert_eq!(prod[0].values(), &[3.0, 10.0]);
        assert!(all_reduce(&p(json!({"allReduceType": "mean"})), &ranks).is_err());
    }

    #[test]
    fn broadcast_selects_root() {
        let ranks = [t(&[1], &[1.0]), t(&[1], &[2.0])];
        let out = broadcast(&p(json!({"rankRoot": 1})), &ranks).expect("root exists");
        assert_eq!(out[0].values(), &[2.0]);
        assert_eq!(
            broadcast(&p(json!({"rankRoot": 2})), &ranks)
                .expect_err("root beyond ranks")
                .kind(),
            "IndexError"
        );
    }
}
