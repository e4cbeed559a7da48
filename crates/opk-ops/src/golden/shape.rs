//! Layout and indexing kernels: views, joins, scans, reductions, lookups.

use opk_dtype::DType;
use opk_ndarray::{ViewLayout, normalize_axis, normalize_insert_axis, unravel_index};
use opk_tensor::{ReduceOp, Tensor, axis_extents};

use super::{index_values, input, to_usize, usize_list};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const REDUCE_TYPES: [(&str, i64); 4] = [
    ("REDUCE_UNDEFINED", 0),
    ("REDUCE_MAX", 1),
    ("REDUCE_MIN", 2),
    ("REDUCE_SUM", 3),
];

pub const INDEX_TYPES: [(&str, i64); 2] = [("INDEX_UNDEFINED", 0), ("INDEX_ADD", 1)];

pub fn reduce_op(param: &OpParam) -> Result<ReduceOp, GoldenError> {
    match param.code("reduceType", &REDUCE_TYPES)? {
        1 => Ok(ReduceOp::Max),
        2 => Ok(ReduceOp::Min),
        3 => Ok(ReduceOp::Sum),
        other => Err(GoldenError::unsupported("reduceType", other)),
    }
}

pub fn as_strided(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let size = usize_list(&param.i64_list("size")?, "size")?;
    let stride = usize_list(&param.i64_list("stride")?, "stride")?;
    let offset = to_usize(
        param.i64_list("offset")?.first().copied().unwrap_or(0),
        "offset",
    )?;
    let layout = ViewLayout::new(size, stride, offset)?;
    layout.check_fits(x.numel())?;
    let values = layout
        .linear_indices()?
        .into_iter()
        .map(|i| x.values()[i])
        .collect();
    Ok(vec![Tensor::new(layout.shape, values, x.dtype())?])
}

pub fn concat(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    if inputs.is_empty() {
        return Err(GoldenError::domain("concat needs at least one input"));
    }
    let axis = param.i64("concatDim")? as isize;
    let refs: Vec<&Tensor> = inputs.iter().collect();
    Ok(vec![Tensor::concat(&refs, axis)?])
}

pub fn cumsum(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let axes = param.i64_list("axes")?;
    let Some(&axis) = axes.first() else {
        return Err(GoldenError::InvalidParam {
            key: "axes".to_string(),
            reason: "must name one axis".to_string(),
        });
    };
    let exclusive = param.bool_or("exclusive", false)?;
    let reverse = param.bool_or("reverse", false)?;
    Ok(vec![x.cumsum(axis as isize, exclusive, reverse)?])
}

pub fn repeat(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let multiples = usize_list(&param.i64_list("multiples")?, "multiples")?;
    Ok(vec![x.tile(&multiples)?])
}

/// Max, min or sum over the `axis` list, or over every element into shape `[1]`.
pub fn reduce(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let op = reduce_op(param)?;
    let axes = param.i64_list_or("axis", &[])?;
    if axes.is_empty() {
        return Ok(vec![x.reduce(op, None, false)?.reshape_exact(&[1])?]);
    }
    let mut resolved = axes
        .iter()
        .map(|&a| normalize_axis(a as isize, x.ndim()))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_unstable_by(|a, b| b.cmp(a));
    resolved.dedup();
    let mut out = x.clone();
    for axis in resolved {
        out = out.reduce(op, Some(axis as isize), false)?;
    }
    Ok(vec![out])
}

/// Rows of a `depth` identity matrix looked up by index; the one-hot axis
/// lands at position `axis` of the output.
pub fn onehot(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let depth = to_usize(param.i64("depth")?, "depth")?;
    let axis = normalize_insert_axis(param.i64("axis")? as isize, x.ndim())?;
    let (on, off, dtype) = match (inputs.get(1), inputs.get(2)) {
        (Some(on), Some(off)) => (
            on.values().first().copied().unwrap_or(1.0),
            off.values().first().copied().unwrap_or(0.0),
            on.dtype(),
        ),
        _ => (1.0, 0.0, DType::F32),
    };

    let mut values = Vec::with_capacity(x.numel() * depth);
    for raw in index_values(x) {
        let hot = usize::try_from(raw)
            .ok()
            .filter(|&i| i < depth)
            .ok_or_else(|| {
                GoldenError::index(format!("index {raw} is out of bounds for depth {depth}"))
            })?;
        values.extend((0..depth).map(|d| if d == hot { on } else { off }));
    }
    let mut shape = x.shape().to_vec();
    shape.push(depth);
    let last = x.ndim();
    let table = Tensor::new(shape, values, dtype)?;
    let perm: Vec<usize> = (0..=last)
        .map(|i| match i.cmp(&axis) {
            std::cmp::Ordering::Less => i,
            std::cmp::Ordering::Equal => last,
            std::cmp::Ordering::Greater => i - 1,
        })
        .collect();
    Ok(vec![table.permute(&perm)?])
}

/// Sub-block starting at `offsets` with extent `size`; negative offsets
/// count from the end and a size of -1 runs to the end.
pub fn slice(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let offsets = param.i64_list("offsets")?;
    let sizes = param.i64_list("size")?;
    if offsets.len() != x.ndim() || sizes.len() != x.ndim() {
        return Err(GoldenError::domain(format!(
            "offsets ({}) and size ({}) must both match rank {}",
            offsets.len(),
            sizes.len(),
            x.ndim()
        )));
    }
    let mut out = x.clone();
    for (axis, (&offset, &size)) in offsets.iter().zip(&sizes).enumerate() {
        let dim = x.shape()[axis] as i64;
        let start = if offset < 0 { offset + dim } else { offset };
        let len = if size == -1 { dim - start } else { size };
        if start < 0 || len < 0 || start + len > dim {
            return Err(GoldenError::domain(format!(
                "slice [{start}, {}) overruns axis {axis} of size {dim}",
                start + len
            )));
        }
        out = out.narrow(axis as isize, start as usize, len as usize)?;
    }
    Ok(vec![out])
}

/// `splitNum` equal chunks along `splitDim`, or explicit `splitSizes`.
pub fn split(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let axis = normalize_axis(param.i64("splitDim")? as isize, x.ndim())?;
    let explicit = param.i64_list_or("splitSizes", &[])?;
    let sizes = if explicit.is_empty() {
        let parts = to_usize(param.i64("splitNum")?, "splitNum")?;
        let len = x.shape()[axis];
        if parts == 0 || len % parts != 0 {
            return Err(GoldenError::domain(format!(
                "axis {axis} of size {len} cannot be split into {parts} equal parts"
            )));
        }
        vec![len / parts; parts]
    } else {
        usize_list(&explicit, "splitSizes")?
    };
    Ok(x.split(axis as isize, &sizes)?)
}

/// `out[b, p, i, q] = x[b, p, idx[b, i], q]` with `batchDims` leading
/// dimensions shared between `x` and the indices.
pub fn gather(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let idx = input(inputs, 1)?;
    let axis = normalize_axis(param.i64("axis")? as isize, x.ndim())?;
    let batch_dims = to_usize(param.i64("batchDims")?, "batchDims")?;
    if batch_dims > axis
        || batch_dims > idx.ndim()
        || x.shape()[..batch_dims] != idx.shape()[..batch_dims]
    {
        return Err(GoldenError::domain(format!(
            "batchDims {batch_dims} incompatible with data {:?} and indices {:?} at axis {axis}",
            x.shape(),
            idx.shape()
        )));
    }
    let batch: usize = x.shape()[..batch_dims].iter().product();
    let outer: usize = x.shape()[batch_dims..axis].iter().product();
    let (_, axis_len, inner) = axis_extents(x.shape(), axis);
    let per_batch: usize = idx.shape()[batch_dims..].iter().product();
    let indices = index_values(idx);

    let mut values = Vec::with_capacity(batch * outer * per_batch * inner);
    for b in 0..batch {
        for p in 0..outer {
            for &raw in &indices[b * per_batch..(b + 1) * per_batch] {
                let k = usize::try_from(raw)
                    .ok()
                    .filter(|&k| k < axis_len)
                    .ok_or_else(|| {
                        GoldenError::index(format!(
                            "index {raw} is out of bounds for axis {axis} with size {axis_len}"
                        ))
                    })?;
                let base = ((b * outer + p) * axis_len + k) * inner;
                values.extend_from_slice(&x.values()[base..base + inner]);
            }
        }
    }
    let mut shape = x.shape()[..axis].to_vec();
    shape.extend_from_slice(&idx.shape()[batch_dims..]);
    shape.extend_from_slice(&x.shape()[axis + 1..]);
    Ok(vec![Tensor::new(shape, values, x.dtype())?])
}

/// Masked fill where the mask is non-zero, or a fresh `outDim` tensor of
/// `value[0]` when unmasked.
pub fn fill(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let value = param
        .f64_list("value")?
        .first()
        .copied()
        .ok_or_else(|| GoldenError::domain("fill value must not be empty"))?;
    if param.bool_or("withMask", false)? {
        let x = input(inputs, 0)?;
        let mask = input(inputs, 1)?;
        if mask.shape() != x.shape() {
            return Err(GoldenError::domain(format!(
                "mask shape {:?} does not match input shape {:?}",
                mask.shape(),
                x.shape()
            )));
        }
        let values = x
            .values()
            .iter()
            .zip(mask.values())
            .map(|(&v, &m)| if m != 0.0 { value } else { v })
            .collect();
        return Ok(vec![
            Tensor::new(x.shape().to_vec(), values, x.dtype())?.cast(x.dtype()),
        ]);
    }
    let shape = usize_list(&param.i64_list("outDim")?, "outDim")?;
    let dtype = inputs.first().map_or(DType::F16, Tensor::dtype);
    Ok(vec![Tensor::full(shape, dtype.store(value), dtype)?])
}

/// `var.index_add(axis, indices, updates * alpha)` for indexType 1; the
/// undefined index type produces no outputs.
pub fn index_add(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    match param.code("indexType", &INDEX_TYPES)? {
        0 => return Ok(Vec::new()),
        1 => {}
        other => return Err(GoldenError::unsupported("indexType", other)),
    }
    let var = input(inputs, 0)?;
    let indices = index_values(input(inputs, 1)?);
    let updates = input(inputs, 2)?;
    let alpha = inputs
        .get(3)
        .and_then(|a| a.values().first().copied())
        .unwrap_or(1.0);
    let axis = normalize_axis(param.i64("axis")? as isize, var.ndim())?;

    let mut expected = var.shape().to_vec();
    expected[axis] = indices.len();
    if updates.shape() != expected.as_slice() {
        return Err(GoldenError::domain(format!(
            "updates shape {:?} does not match {expected:?}",
            updates.shape()
        )));
    }
    let (outer, axis_len, inner) = axis_extents(var.shape(), axis);
    let mut values = var.values().to_vec();
    for (j, &raw) in indices.iter().enumerate() {
        let k = usize::try_from(raw)
            .ok()
            .filter(|&k| k < axis_len)
            .ok_or_else(|| {
                GoldenError::index(format!(
                    "index {raw} is out of bounds for axis {axis} with size {axis_len}"
                ))
            })?;
        for o in 0..outer {
            let dst = (o * axis_len + k) * inner;
            let src = (o * indices.len() + j) * inner;
            for i in 0..inner {
                values[dst + i] += alpha * updates.values()[src + i];
            }
        }
    }
    Ok(vec![
        Tensor::new(var.shape().to_vec(), values, var.dtype())?.cast(var.dtype()),
    ])
}

/// Coordinates of non-zero elements packed into a `(ndim, numel)` buffer
/// (unused columns zero), plus the non-zero count. NaN and infinities count.
pub fn nonzero(inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let rank = x.ndim().max(1);
    let numel = x.numel();
    let shape = if x.ndim() == 0 { vec![1] } else { x.shape().to_vec() };

    let mut buffer = vec![0.0; rank * numel];
    let mut count = 0usize;
    for (flat, &v) in x.values().iter().enumerate() {
        if v == 0.0 {
            continue;
        }
        for (d, coord) in unravel_index(flat, &shape).into_iter().enumerate() {
            buffer[d * numel + count] = coord as f64;
        }
        count += 1;
    }
    Ok(vec![
        Tensor::new(vec![rank, numel], buffer, DType::I64)?,
        Tensor::scalar(count as f64, DType::I64),
    ])
}

#[cfg(test)]
mod tests {
    use super::{
        as_strided, concat, cumsum, fill, gather, index_add, nonzero, onehot, reduce, repeat,
        slice, split,
    };
    use crate::golden::testing::{assert_close, p, ramp, t, ti};
    use opk_dtype::DType;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn concat_sums_the_join_axis() {
        let out = concat(&p(json!({"concatDim": 0})), &[ramp(&[2, 3]), ramp(&[3, 3])])
            .expect("compatible shapes");
        assert_eq!(out[0].shape(), &[5, 3]);

        let err = concat(&p(json!({"concatDim": 0})), &[ramp(&[2, 3]), ramp(&[2, 4])])
            .expect_err("column counts differ");
        assert_eq!(err.kind(), "DomainError");

        let neg = concat(&p(json!({"concatDim": -1})), &[ramp(&[2, 3]), ramp(&[2, 4])])
            .expect("negative axis");
        assert_eq!(neg[0].shape(), &[2, 7]);
    }

    #[test]
    fn concat_of_one_input_is_identity() {
        let x = ramp(&[2, 3]);
        let out = concat(&p(json!({"concatDim": 1})), &[x.clone()]).expect("single input");
        assert_eq!(out[0], x);
        let err = concat(&p(json!({"concatDim": 0})), &[]).expect_err("nothing to join");
        assert_eq!(err.kind(), "DomainError");
    }

    #[test]
    fn cumsum_first_axis() {
        let out = cumsum(&p(json!({"axes": [0]})), &[t(&[3], &[1.0, 2.0, 3.0])])
            .expect("valid axis");
        assert_eq!(out[0].values(), &[1.0, 3.0, 6.0]);

        let err = cumsum(&p(json!({"axes": [1]})), &[t(&[3], &[1.0, 2.0, 3.0])])
            .expect_err("axis beyond rank");
        assert_eq!(err.kind(), "IndexError");
    }

    #[test]
    fn repeat_requires_one_multiple_per_dim() {
        let err = repeat(&p(json!({"multiples": [2, 2]})), &[ramp(&[2, 2, 2])])
            .expect_err("rank mismatch");
        assert_eq!(err.kind(), "DomainError");

        let out = repeat(&p(json!({"multiples": [1, 2]})), &[t(&[1, 2], &[1.0, 2.0])])
            .expect("matching rank");
        assert_eq!(out[0].values(), &[1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn reduce_sum_without_axis_gives_one_element() {
        let out = reduce(
            &p(json!({"reduceType": 3})),
            &[ti(&[2, 2], &[1.0, 2.0, 3.0, 4.0])],
        )
        .expect("sum");
        assert_eq!(out[0].shape(), &[1]);
        assert_eq!(out[0].values(), &[10.0]);

        let max = reduce(
            &p(json!({"reduceType": "REDUCE_MAX", "axis": [1]})),
            &[t(&[2, 2], &[1.0, 5.0, 3.0, 4.0])],
        )
        .expect("max over columns");
        assert_eq!(max[0].values(), &[5.0, 4.0]);
    }

    #[test]
    fn onehot_identity_rows() {
        let out = onehot(
            &p(json!({"axis": 0, "depth": 3})),
            &[ti(&[3], &[0.0, 1.0, 2.0])],
        )
        .expect("valid axis");
        assert_eq!(out[0].shape(), &[3, 3]);
        assert_eq!(
            out[0].values(),
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        );

        let err = onehot(
            &p(json!({"axis": 2, "depth": 3})),
            &[ti(&[3], &[0.0, 1.0, 2.0])],
        )
        .expect_err("axis outside insertion range");
        assert_eq!(err.kind(), "IndexError");
    }

    #[test]
    fn onehot_last_axis_layout() {
        let out = onehot(&p(json!({"axis": -1, "depth": 3})), &[ti(&[2], &[2.0, 0.0])])
            .expect("last axis");
        assert_eq!(out[0].shape(), &[2, 3]);
        assert_eq!(out[0].values(), &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn as_strided_checks_storage() {
        let param = p(json!({"size": [4, 8, 16], "stride": [128, 16, 1], "offset": [0]}));
        let out = as_strided(&param, &[ramp(&[4, 8, 16])]).expect("fits");
        assert_eq!(out[0].shape(), &[4, 8, 16]);
        assert_eq!(out[0].values()[130], 130.0);

        let err = as_strided(&param, &[ramp(&[4, 8, 15])]).expect_err("view overruns");
        assert_eq!(err.kind(), "DomainError");
    }

    #[test]
    fn masked_fill() {
        let out = fill(
            &p(json!({"withMask": true, "value": [1.0]})),
            &[
                t(&[3], &[1.0, 2.0, 3.0]),
                t(&[3], &[1.0, 0.0, 1.0]).with_dtype(DType::Bool),
            ],
        )
        .expect("same shape");
        assert_eq!(out[0].values(), &[1.0, 2.0, 1.0]);

        let err = fill(
            &p(json!({"withMask": true, "value": [1.0]})),
            &[t(&[3], &[1.0, 2.0, 3.0]), t(&[2], &[1.0, 0.0])],
        )
        .expect_err("mask shorter than input");
        assert_eq!(err.kind(), "DomainError");

        let fresh = fill(
            &p(json!({"withMask": false, "outDim": [2, 2], "value": [0.5]})),
            &[],
        )
        .expect("unmasked");
        assert_eq!(fresh[0].shape(), &[2, 2]);
        assert_eq!(fresh[0].dtype(), DType::F16);
        assert_eq!(fresh[0].values(), &[0.5; 4]);
    }

    #[test]
    fn slice_resolves_negative_offsets_and_open_sizes() {
        let out = slice(
            &p(json!({"offsets": [-1, 1], "size": [1, -1]})),
            &[ramp(&[2, 3])],
        )
        .expect("in range");
        assert_eq!(out[0].shape(), &[1, 2]);
        assert_eq!(out[0].values(), &[4.0, 5.0]);

        let err = slice(&p(json!({"offsets": [1, 0], "size": [2, 3]})), &[ramp(&[2, 3])])
            .expect_err("overrun");
        assert_eq!(err.kind(), "DomainError");
    }

    #[test]
    fn split_in_equal_chunks() {
        let out = split(&p(json!({"splitDim": 0, "splitNum": 2})), &[ramp(&[4, 1])])
            .expect("divisible");
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].values(), &[2.0, 3.0]);
        assert!(split(&p(json!({"splitDim": 0, "splitNum": 3})), &[ramp(&[4, 1])]).is_err());
    }

    #[test]
    fn gather_with_batch_dims() {
        let x = ramp(&[2, 3]);
        let plain = gather(
            &p(json!({"axis": 1, "batchDims": 0})),
            &[x.clone(), ti(&[2], &[2.0, 0.0])],
        )
        .expect("plain gather");
        assert_eq!(plain[0].shape(), &[2, 2]);
        assert_eq!(plain[0].values(), &[2.0, 0.0, 5.0, 3.0]);

        let batched = gather(
            &p(json!({"axis": 1, "batchDims": 1})),
            &[x.clone(), ti(&[2, 1], &[2.0, 0.0])],
        )
        .expect("batched gather");
        assert_eq!(batched[0].shape(), &[2, 1]);
        assert_eq!(batched[0].values(), &[2.0, 3.0]);

        let err = gather(
            &p(json!({"axis": 0, "batchDims": 0})),
            &[x, ti(&[1], &[5.0])],
        )
        .expect_err("index past axis");
        assert_eq!(err.kind(), "IndexError");
    }

    #[test]
    fn index_add_scales_updates() {
        let out = index_add(
            &p(json!({"indexType": 1, "axis": 0})),
            &[
                t(&[3, 1], &[0.0, 0.0, 0.0]),
                ti(&[2], &[2.0, 0.0]),
                t(&[2, 1], &[1.0, 3.0]),
                t(&[1], &[2.0]),
            ],
        )
        .expect("valid scatter");
        assert_eq!(out[0].values(), &[6.0, 0.0, 2.0]);

        let none = index_add(&p(json!({"indexType": 0, "axis": 0})), &[]).expect("undefined");
        assert!(none.is_empty());
    }

    #[test]
    fn nonzero_counts_and_buffer_shape() {
        let out = nonzero(&[t(&[2, 2], &[1.0, -2.0, 0.0, 4.0])]).expect("2d");
        assert_eq!(out[0].shape(), &[2, 4]);
        assert_eq!(out[1].values(), &[3.0]);
        assert_eq!(out[0].values(), &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0]);

        let special = nonzero(&[t(&[2, 2], &[1.0, f64::NAN, f64::INFINITY, 4.0])]).expect("nan");
        assert_eq!(special[1].values(), &[4.0]);

        let empty = nonzero(&[t(&[0], &[])]).expect("empty");
        assert_eq!(empty[0].shape(), &[1, 0]);
        assert_eq!(empty[1].values(), &[0.0]);
    }

    #[test]
    fn nonzero_of_zeros() {
        let out = nonzero(&[t(&[2, 2], &[0.0, -0.0, 0.0, 0.0])]).expect("zeros");
        assert_eq!(out[1].values(), &[0.0]);
        assert_close(out[0].values(), &[0.0; 8]);
    }

    proptest! {
        #[test]
        fn concat_length_is_sum_of_parts(rows_a in 1usize..5, rows_b in 1usize..5, cols in 1usize..4) {
            let out = concat(&p(json!({"concatDim": 0})), &[ramp(&[rows_a, cols]), ramp(&[rows_b, cols])])
                .expect("consistent columns");
            prop_assert_eq!(out[0].shape(), &[rows_a + rows_b, cols]);
        }

        #[test]
        fn concat_rejects_inconsistent_columns(cols_a in 1usize..5, cols_b in 1usize..5) {
            prop_assume!(cols_a != cols_b);
            let err = concat(&p(json!({"concatDim": 0})), &[ramp(&[2, cols_a]), ramp(&[2, cols_b])])
                .expect_err("columns differ");
            prop_assert_eq!(err.kind(), "DomainError");
        }

        #[test]
        fn nonzero_ignores_sign_and_magnitude(values in proptest::collection::vec(-3i32..4, 1..12), inf_at in 0usize..12) {
            let base: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
            let n = base.len();
            let flipped: Vec<f64> = base.iter().map(|v| -v).collect();
            let mut infinite = base.clone();
            let slot = inf_at % n;
            if infinite[slot] != 0.0 {
                infinite[slot] = if infinite[slot] > 0.0 { f64::INFINITY } else { f64::NEG_INFINITY };
            }
            let count = |v: &[f64]| nonzero(&[t(&[n], v)]).expect("1d")[1].values()[0];
            let expected = base.iter().filter(|&&v| v != 0.0).count() as f64;
            prop_assert_eq!(count(&base), expected);
            prop_assert_eq!(count(&flipped), expected);
            prop_assert_eq!(count(&infinite), expected);
        }
    }
}
