//! Variable-length sequence packing and mixture-of-experts routing.

use opk_dtype::DType;
use opk_tensor::Tensor;

use super::{index_values, input, to_usize};
use crate::error::GoldenError;
use crate::param::OpParam;

/// Keeps the last token of every sequence from a packed `(ntok, hidden)`
/// buffer. Inputs: `[tmp_out, padding_offset, seq_len, input_ids]`. An empty
/// request has no last token and yields a zero row.
pub fn pad(inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let packed = input(inputs, 0)?;
    let seq_lens = index_values(input(inputs, 2)?);
    let hidden = packed.shape().last().copied().unwrap_or(1);
    let tokens = packed.numel() / hidden.max(1);
    let mut out = Vec::with_capacity(seq_lens.len() * hidden);
    let mut cursor = 0usize;
    for len in &seq_lens {
        let len = to_usize(*len, "seq_len")?;
        if len == 0 {
            out.extend(std::iter::repeat_n(0.0, hidden));
            continue;
        }
        cursor += len;
        if cursor > tokens {
            return Err(GoldenError::index(format!(
                "sequence end {cursor} outside {tokens} packed tokens"
            )));
        }
        let row = (cursor - 1) * hidden;
        out.extend_from_slice(&packed.values()[row..row + hidden]);
    }
    Ok(vec![Tensor::new(vec![seq_lens.len(), hidden], out, packed.dtype())?])
}

/// Packs padded `(batch, max_seq)` ids into one row. Inputs: `[input_ids,
/// cum_offsets_now, token_num, seq_len]`; outputs: packed ids, shifted
/// cumulative offsets and the per-token padding offset.
pub fn unpad(inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let ids = input(inputs, 0)?;
    let cum_offsets = index_values(input(inputs, 1)?);
    let token_num = index_values(input(inputs, 2)?)
        .first()
        .copied()
        .ok_or_else(|| GoldenError::domain("token_num is empty"))?;
    let seq_lens = index_values(input(inputs, 3)?);
    if ids.ndim() != 2 {
        return Err(GoldenError::domain(format!(
            "input_ids must be (batch, max_seq), got {:?}",
            ids.shape()
        )));
    }
    let (batch, max_seq) = (ids.shape()[0], ids.shape()[1]);
    if seq_lens.len() != batch || cum_offsets.len() != batch {
        return Err(GoldenError::domain(format!(
            "seq_len and cum_offsets_now must hold {batch} entries"
        )));
    }

    let mut shifted = vec![0.0; batch];
    for b in 1..batch {
        shifted[b] = cum_offsets[b - 1] as f64;
    }
    let mut tokens = Vec::new();
    let mut padding = Vec::new();
    for (b, &len) in seq_lens.iter().enumerate() {
        let len = to_usize(len, "seq_len")?;
        if len > max_seq {
            return Err(GoldenError::index(format!(
                "seq_len {len} exceeds max_seq {max_seq}"
            )));
        }
        tokens.extend_from_slice(&ids.values()[b * max_seq..b * max_seq + len]);
        padding.extend(std::iter::repeat_n(shifted[b], len));
    }
    if tokens.len() as i64 != token_num {
        return Err(GoldenError::index(format!(
            "seq_len sums to {} but token_num is {token_num}",
            tokens.len()
        )));
    }
    let total = tokens.len();
    let dtype = ids.dtype();
    Ok(vec![
        Tensor::new(vec![1, total], tokens, dtype)?,
        Tensor::new(vec![batch, 1], shifted, dtype)?,
        Tensor::new(vec![1, total], padding, dtype)?,
    ])
}

/// Groups `topk` expert picks per token by expert. Outputs (all int32): the
/// owning token of each sorted pick, the inclusive count per expert and the
/// original flat position of each sorted pick.
pub fn gating(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let topk = to_usize(param.i64("topkExpertNum")?, "topkExpertNum")?;
    let experts = to_usize(param.i64("cumSumNum")?, "cumSumNum")?;
    if topk == 0 {
        return Err(GoldenError::domain("topkExpertNum must be positive"));
    }
    let ids = index_values(input(inputs, 0)?);
    if ids.len() % topk != 0 {
        return Err(GoldenError::domain(format!(
            "{} expert picks are not a multiple of topk {topk}",
            ids.len()
        )));
    }
    let mut counts = vec![0usize; experts];
    for &id in &ids {
        let slot = usize::try_from(id)
            .ok()
            .filter(|&e| e < experts)
            .ok_or_else(|| GoldenError::index(format!("expert id {id} outside {experts} experts")))?;
        counts[slot] += 1;
    }
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by_key(|&i| ids[i]);

    let token_index = order.iter().map(|&i| (i / topk) as f64).collect();
    let cum_sum = counts
        .iter()
        .scan(0usize, |acc, &c| {
            *acc += c;
            Some(*acc as f64)
        })
        .collect();
    let original = order.iter().map(|&i| i as f64).collect();
    Ok(vec![
        Tensor::from_vec(token_index, DType::I32),
        Tensor::from_vec(cum_sum, DType::I32),
        Tensor::from_vec(original, DType::I32),
    ])
}

#[cfg(test)]
mod tests {
    use super::{gating, pad, unpad};
    use crate::golden::testing::{p, t, ti};
    use opk_dtype::DType;
    use serde_json::json;

    #[test]
    fn pad_takes_last_token_of_each_sequence() {
        let packed = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let extra = ti(&[1], &[0.0]);
        let out = pad(&[packed.clone(), extra.clone(), ti(&[1, 1], &[2.0]), extra.clone()]).expect("fits");
        assert_eq!(out[0].shape(), &[1, 2]);
        assert_eq!(out[0].values(), &[3.0, 4.0]);

        let err = pad(&[packed, extra.clone(), ti(&[1, 1], &[3.0]), extra]).expect_err("overrun");
        assert_eq!(err.kind(), "IndexError");
    }

    #[test]
    fn pad_emits_zero_row_for_empty_request() {
        let packed = t(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let extra = ti(&[1], &[0.0]);
        let seq_lens = ti(&[3, 1], &[2.0, 0.0, 1.0]);
        let out = pad(&[packed, extra.clone(), seq_lens, extra]).expect("fits");
        assert_eq!(out[0].shape(), &[3, 2]);
        assert_eq!(out[0].values(), &[3.0, 4.0, 0.0, 0.0, 5.0, 6.0]);
    }

    #[test]
    fn unpad_packs_and_reports_offsets() {
        let ids = ti(&[2, 3], &[7.0, 8.0, 0.0, 9.0, 0.0, 0.0]);
        let out = unpad(&[ids.clone(), ti(&[2, 1], &[1.0, 3.0]), ti(&[1, 1], &[3.0]), ti(&[2, 1], &[2.0, 1.0])])
            .expect("consistent");
        assert_eq!(out[0].values(), &[7.0, 8.0, 9.0]);
        assert_eq!(out[0].dtype(), DType::I64);
        assert_eq!(out[1].values(), &[0.0, 1.0]);
        assert_eq!(out[2].values(), &[0.0, 0.0, 1.0]);

        let err = unpad(&[ids.clone(), ti(&[2, 1], &[1.0, 3.0]), ti(&[1, 1], &[4.0]), ti(&[2, 1], &[2.0, 1.0])])
            .expect_err("token count");
        assert_eq!(err.kind(), "IndexError");
        let err = unpad(&[ids, ti(&[2, 1], &[1.0, 3.0]), ti(&[1, 1], &[5.0]), ti(&[2, 1], &[4.0, 1.0])])
            .expect_err("too long");
        assert_eq!(err.kind(), "IndexError");
    }

    #[test]
    fn gating_sorts_picks_stably_by_expert() {
        let ids = ti(&[2, 2], &[2.0, 0.0, 0.0, 1.0]);
        let out = gating(&p(json!({"topkExpertNum": 2, "cumSumNum": 3})), &[ids.clone()]).expect("valid ids");
        assert_eq!(out[2].values(), &[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(out[0].values(), &[0.0, 1.0, 1.0, 0.0]);
        assert_eq!(out[1].values(), &[2.0, 3.0, 4.0]);
        assert!(out.iter().all(|o| o.dtype() == DType::I32));

        let err = gating(&p(json!({"topkExpertNum": 2, "cumSumNum": 2})), &[ids]).expect_err("id 2");
        assert_eq!(err.kind(), "IndexError");
    }
}
