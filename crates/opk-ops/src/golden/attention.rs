//! Attention building blocks: rotary embeddings, mask expansion and paged
//! decode attention.

use opk_runtime::HardwareBackend;
use opk_tensor::Tensor;

use super::{index_values, input, to_usize, usize_list};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const MASK_TYPES: [(&str, i64); 3] = [
    ("MASK_TYPE_UNDEFINED", 0),
    ("MASK_TYPE_NORM", 1),
    ("MASK_TYPE_ALIBI", 2),
];

pub const QUANT_TYPES: [(&str, i64); 2] = [("TYPE_QUANT_UNDEFINED", 0), ("TYPE_DEQUANT_FUSION", 1)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskType {
    Undefined,
    Norm,
    Alibi,
}

impl MaskType {
    pub fn from_param(param: &OpParam) -> Result<Self, GoldenError> {
        match param.code("maskType", &MASK_TYPES)? {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::Norm),
            2 => Ok(Self::Alibi),
            other => Err(GoldenError::unsupported("maskType", other)),
        }
    }
}

/// Rotates chunk pairs: with the head split into `coeff` chunks, chunk `2j`
/// becomes `-chunk(2j+1)` and chunk `2j+1` becomes `chunk(2j)`. `transpose`
/// applies the adjoint rotation.
fn rotate(head: &[f64], coeff: usize, transpose: bool) -> Vec<f64> {
    let width = head.len() / coeff;
    let mut out = vec![0.0; head.len()];
    for pair in 0..coeff / 2 {
        let lo = 2 * pair * width;
        let hi = lo + width;
        for i in 0..width {
            let (a, b) = (head[lo + i], head[hi + i]);
            if transpose {
                out[lo + i] = b;
                out[hi + i] = -a;
            } else {
                out[lo + i] = -b;
                out[hi + i] = a;
            }
        }
    }
    out
}

fn check_coeff(coeff: usize, head_dim: usize) -> Result<usize, GoldenError> {
    let coeff = coeff.min(head_dim);
    if coeff == 0 || coeff % 2 != 0 || head_dim % coeff != 0 {
        return Err(GoldenError::domain(format!(
            "rotaryCoeff {coeff} does not split head dim {head_dim} into pairs"
        )));
    }
    Ok(coeff)
}

/// Rows of `x` seen as `(tokens, heads, head_dim)`.
fn head_rows(x: &Tensor, head_dim: usize) -> Result<(usize, usize), GoldenError> {
    let hidden = x.shape().last().copied().unwrap_or(0);
    if head_dim == 0 || hidden % head_dim != 0 {
        return Err(GoldenError::domain(format!(
            "hidden size {hidden} is not a multiple of head dim {head_dim}"
        )));
    }
    Ok((x.numel() / hidden.max(1), hidden / head_dim))
}

fn rotary(
    x: &Tensor,
    cos: &[f64],
    sin: &[f64],
    positions: &[usize],
    head_dim: usize,
    coeff: usize,
    backward: bool,
) -> Result<Tensor, GoldenError> {
    let (tokens, heads) = head_rows(x, head_dim)?;
    if positions.len() != tokens {
        return Err(GoldenError::domain(format!(
            "{} positions for {tokens} tokens",
            positions.len()
        )));
    }
    let mut out = Vec::with_capacity(x.numel());
    for (token, &pos) in positions.iter().enumerate() {
        let c = cos
            .get(pos * head_dim..(pos + 1) * head_dim)
            .ok_or_else(|| GoldenError::index(format!("position {pos} beyond cos table")))?;
        let s = &sin[pos * head_dim..(pos + 1) * head_dim];
        for h in 0..heads {
            let start = (token * heads + h) * head_dim;
            let head = &x.values()[start..start + head_dim];
            if backward {
                let scaled: Vec<f64> = head.iter().zip(s).map(|(g, s)| g * s).collect();
                let turned = rotate(&scaled, coeff, true);
                out.extend(head.iter().zip(c).zip(turned).map(|((g, c), r)| g * c + r));
            } else {
                let turned = rotate(head, coeff, false);
                out.extend(
                    head.iter()
                        .zip(c)
                        .zip(s)
                        .zip(turned)
                        .map(|(((x, c), s), r)| x * c + r * s),
                );
            }
        }
    }
    Ok(Tensor::new(x.shape().to_vec(), out, x.dtype())?.cast(x.dtype()))
}

fn cos_sin(inputs: &[Tensor]) -> Result<(&Tensor, &Tensor, usize), GoldenError> {
    let cos = input(inputs, 2)?;
    let sin = input(inputs, 3)?;
    if cos.shape() != sin.shape() {
        return Err(GoldenError::domain(format!(
            "cos {:?} and sin {:?} differ",
            cos.shape(),
            sin.shape()
        )));
    }
    let head_dim = cos.shape().last().copied().unwrap_or(0);
    Ok((cos, sin, head_dim))
}

/// Inputs: `[q, k, cos, sin, seqlen]` with one cos/sin row per token.
pub fn rope(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let (cos, sin, head_dim) = cos_sin(inputs)?;
    let coeff = check_coeff(to_usize(param.i64("rotaryCoeff")?, "rotaryCoeff")?, head_dim)?;
    let rows = cos.numel() / head_dim.max(1);
    let positions: Vec<usize> = (0..rows).collect();
    [input(inputs, 0)?, input(inputs, 1)?]
        .into_iter()
        .map(|x| rotary(x, cos.values(), sin.values(), &positions, head_dim, coeff, false))
        .collect()
}

/// Inputs: `[q_grad, k_grad, cos, sin]`; cos/sin rows are indexed by the
/// position inside each `qSeqLen` segment.
pub fn rope_grad(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    if inputs.is_empty() {
        return Err(GoldenError::index("rope_grad received no tensors"));
    }
    let seq_lens = usize_list(&param.i64_list("qSeqLen")?, "qSeqLen")?;
    let (cos, sin, head_dim) = cos_sin(inputs)?;
    let coeff = check_coeff(2, head_dim)?;
    let positions: Vec<usize> = seq_lens.iter().flat_map(|&len| 0..len).collect();
    [input(inputs, 0)?, input(inputs, 1)?]
        .into_iter()
        .map(|g| {
            let (tokens, _) = head_rows(g, head_dim)?;
            if tokens != positions.len() {
                return Err(GoldenError::domain(format!(
                    "sum of qSeqLen {} does not match {tokens} tokens",
                    positions.len()
                )));
            }
            rotary(g, cos.values(), sin.values(), &positions, head_dim, coeff, true)
        })
        .collect()
}

/// Expands a padded `(batch, [1,] maxS, maxS)` mask into the packed layout:
/// for every batch, `headNum` copies of its leading `s × s` block.
pub fn gen_attention_mask(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let mask = input(inputs, 0)?;
    let seq_lens = usize_list(&param.i64_list("seqLen")?, "seqLen")?;
    let heads = to_usize(param.i64("headNum")?, "headNum")?;
    let shape = mask.shape();
    if shape.len() < 3 {
        return Err(GoldenError::domain(format!(
            "attention mask must be (batch, [1,] maxS, maxS), got {shape:?}"
        )));
    }
    let batch = shape[0];
    let max_s = shape[shape.len() - 1];
    if seq_lens.len() != batch {
        return Err(GoldenError::domain(format!(
            "{} sequence lengths for batch {batch}",
            seq_lens.len()
        )));
    }
    let per_batch = mask.numel() / batch.max(1);
    let mut out = Vec::new();
    for (b, &s) in seq_lens.iter().enumerate() {
        if s > max_s || s > shape[shape.len() - 2] {
            return Err(GoldenError::index(format!(
                "sequence length {s} exceeds mask size {max_s}"
            )));
        }
        let base = b * per_batch;
        let block: Vec<f64> = (0..s)
            .flat_map(|i| (0..s).map(move |j| base + i * max_s + j))
            .map(|i| mask.values()[i])
            .collect();
        for _ in 0..heads {
            out.extend_from_slice(&block);
        }
    }
    Ok(vec![Tensor::from_vec(out, mask.dtype())])
}

/// Converts a fractal-NZ mask `(b, n1, rows, c0)` to ND `(b, rows, n1·c0)`.
/// Position-bias masks keep their head axis: `(1, head_num, rows, cols)`.
pub fn mask_nz_2_nd(mask: &Tensor, mask_type: MaskType, head_num: usize) -> Result<Tensor, GoldenError> {
    if mask.ndim() != 4 {
        return Err(GoldenError::domain(format!(
            "NZ mask must be 4-D, got {:?}",
            mask.shape()
        )));
    }
    let (b, n1, rows, c0) = (mask.shape()[0], mask.shape()[1], mask.shape()[2], mask.shape()[3]);
    let nd = mask.permute(&[0, 2, 1, 3])?.reshape_exact(&[b, rows, n1 * c0])?;
    match mask_type {
        MaskType::Alibi => Ok(nd.reshape(&[1, head_num as isize, rows as isize, -1])?),
        MaskType::Norm | MaskType::Undefined => Ok(nd),
    }
}

/// `(is_int8, has_offset)` for a dequant configuration.
#[must_use]
pub const fn get_quant_param(quant_type: i64, has_offset: bool) -> (bool, bool) {
    match quant_type {
        1 => (true, has_offset),
        _ => (false, false),
    }
}

/// `softmax(q·kᵀ·scale + bias)·v` for `q (q_len, heads, d)`,
/// `k (ctx, kv_heads, d)`, `v (ctx, kv_heads, dv)` and a bias broadcastable
/// to `(heads, q_len, ctx)`. Query heads share key/value heads in groups.
pub fn ref_masked_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    bias: Option<&Tensor>,
) -> Result<Tensor, GoldenError> {
    if q.ndim() != 3 || k.ndim() != 3 || v.ndim() != 3 {
        return Err(GoldenError::domain("attention operands must be 3-D"));
    }
    let (q_len, heads, dim) = (q.shape()[0], q.shape()[1], q.shape()[2]);
    let (ctx, kv_heads) = (k.shape()[0], k.shape()[1]);
    let dv = v.shape()[2];
    if k.shape()[2] != dim || v.shape()[..2] != k.shape()[..2] {
        return Err(GoldenError::domain(format!(
            "key {:?} / value {:?} do not fit query {:?}",
            k.shape(),
            v.shape(),
            q.shape()
        )));
    }
    if kv_heads == 0 || heads % kv_heads != 0 {
        return Err(GoldenError::domain(format!(
            "{heads} query heads cannot share {kv_heads} key/value heads"
        )));
    }
    let bias = bias
        .map(|b| b.broadcast_to(&[heads, q_len, ctx]))
        .transpose()?;
    let group = heads / kv_heads;
    let (qv, kv, vv) = (q.values(), k.values(), v.values());
    let mut out = vec![0.0; q_len * heads * dv];
    for h in 0..heads {
        let g = h / group;
        for i in 0..q_len {
            let qrow = &qv[(i * heads + h) * dim..][..dim];
            let mut scores: Vec<f64> = (0..ctx)
                .map(|j| {
                    let krow = &kv[(j * kv_heads + g) * dim..][..dim];
                    let dot: f64 = qrow.iter().zip(krow).map(|(a, b)| a * b).sum();
                    let shift = bias
                        .as_ref()
                        .map_or(0.0, |b| b.values()[(h * q_len + i) * ctx + j]);
                    dot * scale + shift
                })
                .collect();
            let peak = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut total = 0.0;
            for s in &mut scores {
                *s = (*s - peak).exp();
                total += *s;
            }
            let dst = &mut out[(i * heads + h) * dv..][..dv];
            for (j, weight) in scores.iter().enumerate() {
                let vrow = &vv[(j * kv_heads + g) * dv..][..dv];
                for (o, val) in dst.iter_mut().zip(vrow) {
                    *o += weight / total * val;
                }
            }
        }
    }
    Ok(Tensor::new(vec![q_len, heads, dv], out, q.dtype())?)
}

/// Bias of sequence `b` as `(heads, 1, ctx)` or `(1, 1, ctx)`.
fn sequence_bias(mask: &Tensor, b: usize, heads: usize, ctx: usize) -> Result<Tensor, GoldenError> {
    let shape = mask.shape();
    let cols = shape.last().copied().unwrap_or(0);
    if ctx > cols {
        return Err(GoldenError::index(format!(
            "context length {ctx} exceeds mask width {cols}"
        )));
    }
    let (lead, mask_heads) = match shape.len() {
        2 => (1, 1),
        3 => (shape[0], 1),
        4 => (shape[0], shape[1]),
        _ => {
            return Err(GoldenError::domain(format!("unsupported mask shape {shape:?}")));
        }
    };
    let rows = shape[shape.len() - 2];
    let b = if lead == 1 { 0 } else { b };
    if b >= lead {
        return Err(GoldenError::index(format!("sequence {b} outside mask batch {lead}")));
    }
    let out_heads = if mask_heads == 1 { 1 } else { heads };
    if mask_heads != 1 && mask_heads != heads {
        return Err(GoldenError::domain(format!(
            "mask carries {mask_heads} heads for {heads} query heads"
        )));
    }
    let mut values = Vec::with_capacity(out_heads * ctx);
    for h in 0..out_heads {
        let row = ((b * mask_heads + h) * rows) * cols;
        values.extend_from_slice(&mask.values()[row..row + ctx]);
    }
    Ok(Tensor::new(vec![out_heads, 1, ctx], values, mask.dtype())?)
}

/// Applies `(x - offset) * descale` per flattened `(kv_heads·d)` channel.
fn dequant(x: &Tensor, descale: &Tensor, offset: Option<&Tensor>) -> Result<Tensor, GoldenError> {
    let width = x.shape()[1] * x.shape()[2];
    if descale.numel() != width || offset.is_some_and(|o| o.numel() != width) {
        return Err(GoldenError::domain(format!(
            "dequant parameters must hold {width} channels"
        )));
    }
    let values = x
        .values()
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let c = i % width;
            (v - offset.map_or(0.0, |o| o.values()[c])) * descale.values()[c]
        })
        .collect();
    Ok(Tensor::new(x.shape().to_vec(), values, opk_dtype::DType::F32)?)
}

/// Gathers the first `ctx` cached rows of one sequence through its block table.
fn gather_blocks(cache: &Tensor, table: &[i64], ctx: usize) -> Result<Tensor, GoldenError> {
    let (blocks, block_size) = (cache.shape()[0], cache.shape()[1]);
    let row = cache.numel() / (blocks * block_size).max(1);
    let mut values = Vec::with_capacity(ctx * row);
    for pos in 0..ctx {
        let slot = table.get(pos / block_size.max(1)).copied().ok_or_else(|| {
            GoldenError::index(format!("position {pos} beyond block table of {}", table.len()))
        })?;
        let block = usize::try_from(slot)
            .ok()
            .filter(|&b| b < blocks)
            .ok_or_else(|| GoldenError::index(format!("block id {slot} outside {blocks} blocks")))?;
        let start = (block * block_size + pos % block_size) * row;
        values.extend_from_slice(&cache.values()[start..start + row]);
    }
    let mut shape = vec![ctx];
    shape.extend_from_slice(&cache.shape()[2..]);
    Ok(Tensor::new(shape, values, cache.dtype())?)
}

/// Decode attention over a paged KV cache. Inputs: `[query, key_cache,
/// value_cache, block_tables, context_lens]`, then the mask when `maskType`
/// is set, then `k_descale, v_descale[, k_offset, v_offset]` for int8 caches.
pub fn paged_attention(
    param: &OpParam,
    backend: &dyn HardwareBackend,
    inputs: &[Tensor],
) -> Result<Vec<Tensor>, GoldenError> {
    let query = input(inputs, 0)?;
    let key_cache = input(inputs, 1)?;
    let value_cache = input(inputs, 2)?;
    let tables = input(inputs, 3)?;
    let context_lens = index_values(input(inputs, 4)?);

    let heads = to_usize(param.i64("headNum")?, "headNum")?;
    let kv_heads = match to_usize(param.i64("kvHeadNum")?, "kvHeadNum")? {
        0 => heads,
        n => n,
    };
    let scale = param.f64("qkScale")?;
    let mask_type = MaskType::from_param(param)?;
    let (is_int8, has_offset) = get_quant_param(
        param.code_or("quantType", &QUANT_TYPES, 0)?,
        param.bool_or("hasQuantOffset", false)?,
    );

    if query.ndim() != 3 || query.shape()[1] != heads {
        return Err(GoldenError::domain(format!(
            "query {:?} does not carry headNum {heads}",
            query.shape()
        )));
    }
    if key_cache.ndim() != 4 || value_cache.ndim() != 4 || key_cache.shape()[2] != kv_heads {
        return Err(GoldenError::domain(format!(
            "caches {:?} / {:?} are not (blocks, block_size, {kv_heads}, dim)",
            key_cache.shape(),
            value_cache.shape()
        )));
    }
    let batch = context_lens.len();
    if query.shape()[0] != batch || tables.ndim() != 2 || tables.shape()[0] != batch {
        return Err(GoldenError::domain(format!(
            "query {:?} and block tables {:?} disagree with {batch} sequences",
            query.shape(),
            tables.shape()
        )));
    }

    let mut next = 5;
    let mask = if mask_type == MaskType::Undefined {
        None
    } else {
        let raw = input(inputs, next)?;
        next += 1;
        if !backend.is_910b() && raw.ndim() == 4 {
            Some(mask_nz_2_nd(raw, mask_type, heads)?)
        } else {
            Some(raw.clone())
        }
    };
    let descales = if is_int8 {
        let k = input(inputs, next)?;
        let v = input(inputs, next + 1)?;
        let offsets = if has_offset {
            Some((input(inputs, next + 2)?, input(inputs, next + 3)?))
        } else {
            None
        };
        Some((k, v, offsets))
    } else {
        None
    };

    let width = tables.shape()[1];
    let table_values = index_values(tables);
    let mut parts = Vec::with_capacity(batch);
    for (b, &ctx) in context_lens.iter().enumerate() {
        let ctx = to_usize(ctx, "context length")?;
        let table = &table_values[b * width..(b + 1) * width];
        let mut k = gather_blocks(key_cache, table, ctx)?;
        let mut v = gather_blocks(value_cache, table, ctx)?;
        if let Some((k_scale, v_scale, offsets)) = descales {
            k = dequant(&k, k_scale, offsets.map(|o| o.0))?;
            v = dequant(&v, v_scale, offsets.map(|o| o.1))?;
        }
        let q = query.narrow(0, b, 1)?;
        let bias = mask
            .as_ref()
            .map(|m| sequence_bias(m, b, heads, ctx))
            .transpose()?;
        parts.push(ref_masked_attention(&q, &k, &v, scale, bias.as_ref())?);
    }
    if parts.is_empty() {
        let dv = value_cache.shape()[3];
        return Ok(vec![Tensor::zeros(vec![0, heads, dv], query.dtype())?]);
    }
    let refs: Vec<&Tensor> = parts.iter().collect();
    Ok(vec![Tensor::concat(&refs, 0)?.cast(query.dtype())])
}
