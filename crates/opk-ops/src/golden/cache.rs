//! In-place KV cache writers. The golden result is the cache after the write;
//! every other element keeps its incoming value.

use opk_runtime::HardwareBackend;
use opk_tensor::Tensor;

use super::{index_values, input, to_usize};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const COMPRESS_TYPES: [(&str, i64); 2] = [
    ("COMPRESS_TYPE_UNDEFINED", 0),
    ("COMPRESS_TYPE_KVHEAD", 1),
];

/// NZ fractal width on non-910B parts.
const C0: usize = 16;

/// Inputs: `[newKv (ntok, hidden), layerId, cache (layers, batch, maxSeq,
/// hidden), tokenOffset (batch), seqLen (batch)]`. Batch `b` owns the next
/// `seqLen[b]` rows of `newKv` and writes them ending at `tokenOffset[b]`.
pub fn kv_cache(inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let new_kv = input(inputs, 0)?;
    let layer = index_values(input(inputs, 1)?)
        .first()
        .copied()
        .ok_or_else(|| GoldenError::domain("layerId is empty"))?;
    let mut cache = input(inputs, 2)?.clone();
    let offsets = index_values(input(inputs, 3)?);
    let seq_lens = index_values(input(inputs, 4)?);

    if cache.ndim() != 4 {
        return Err(GoldenError::domain(format!(
            "cache must be (layers, batch, maxSeq, hidden), got {:?}",
            cache.shape()
        )));
    }
    let (layers, batch, max_seq, hidden) = (
        cache.shape()[0],
        cache.shape()[1],
        cache.shape()[2],
        cache.shape()[3],
    );
    let layer = usize::try_from(layer)
        .ok()
        .filter(|&l| l < layers)
        .ok_or_else(|| GoldenError::index(format!("layerId {layer} outside {layers} layers")))?;
    if new_kv.shape().last().copied() != Some(hidden) {
        return Err(GoldenError::domain(format!(
            "new rows {:?} do not match cache hidden size {hidden}",
            new_kv.shape()
        )));
    }
    if offsets.len() != batch || seq_lens.len() != batch {
        return Err(GoldenError::domain(format!(
            "tokenOffset/seqLen must hold {batch} entries"
        )));
    }

    let available = new_kv.numel() / hidden.max(1);
    let mut cursor = 0;
    for b in 0..batch {
        let len = to_usize(seq_lens[b], "seqLen")?;
        let end = to_usize(offsets[b], "tokenOffset")?;
        if end > max_seq || len > end || cursor + len > available {
            return Err(GoldenError::index(format!(
                "batch {b} writes rows {}..{end} of {max_seq} from token {cursor}",
                end.saturating_sub(len)
            )));
        }
        let dst = ((layer * batch + b) * max_seq + end - len) * hidden;
        let src = cursor * hidden;
        cache.values_mut()[dst..dst + len * hidden]
            .copy_from_slice(&new_kv.values()[src..src + len * hidden]);
        cursor += len;
    }
    Ok(vec![cache])
}

fn slot_index(slot: i64, capacity: usize) -> Result<Option<usize>, GoldenError> {
    if slot < 0 {
        return Ok(None);
    }
    let slot = slot as usize;
    if slot >= capacity {
        return Err(GoldenError::index(format!(
            "slot {slot} outside cache of {capacity} slots"
        )));
    }
    Ok(Some(slot))
}

/// Writes token rows into an ND cache `(blocks, block_size, heads, dim)`.
fn scatter_nd(cache: &mut Tensor, rows: &Tensor, slots: &[i64]) -> Result<(), GoldenError> {
    let (blocks, block_size) = (cache.shape()[0], cache.shape()[1]);
    let width = cache.numel() / (blocks * block_size).max(1);
    if rows.numel() != slots.len() * width {
        return Err(GoldenError::domain(format!(
            "{:?} rows do not fit {} slots of width {width}",
            rows.shape(),
            slots.len()
        )));
    }
    for (i, &slot) in slots.iter().enumerate() {
        let Some(slot) = slot_index(slot, blocks * block_size)? else {
            continue;
        };
        cache.values_mut()[slot * width..(slot + 1) * width]
            .copy_from_slice(&rows.values()[i * width..(i + 1) * width]);
    }
    Ok(())
}

/// Writes token rows into an NZ cache `(blocks, width / 16, block_size, 16)`.
fn scatter_nz(cache: &mut Tensor, rows: &Tensor, slots: &[i64]) -> Result<(), GoldenError> {
    let (blocks, fractals, block_size) = (cache.shape()[0], cache.shape()[1], cache.shape()[2]);
    let width = fractals * C0;
    if cache.shape()[3] != C0 || rows.numel() != slots.len() * width {
        return Err(GoldenError::domain(format!(
            "{:?} rows do not fit NZ cache {:?}",
            rows.shape(),
            cache.shape()
        )));
    }
    for (i, &slot) in slots.iter().enumerate() {
        let Some(slot) = slot_index(slot, blocks * block_size)? else {
            continue;
        };
        let (block, offset) = (slot / block_size, slot % block_size);
        for j in 0..width {
            let dst = ((block * fractals + j / C0) * block_size + offset) * C0 + j % C0;
            cache.values_mut()[dst] = rows.values()[i * width + j];
        }
    }
    Ok(())
}

/// Head-compressed write: pair `i` is `(batch, head) = (i / heads, i % heads)`
/// and stores the last `wins[i]` tokens of that batch's sequence for that
/// head starting at `slots[i]`.
fn scatter_compressed(
    cache: &mut Tensor,
    rows: &Tensor,
    slots: &[i64],
    wins: &[i64],
    seq_lens: &[i64],
) -> Result<(), GoldenError> {
    if wins.len() != slots.len() {
        return Err(GoldenError::domain(format!(
            "{} windows for {} slots",
            wins.len(),
            slots.len()
        )));
    }
    if rows.ndim() != 3 || cache.ndim() != 4 {
        return Err(GoldenError::domain("compressed cache expects 3-D rows and a 4-D cache"));
    }
    let (heads, dim) = (rows.shape()[1], rows.shape()[2]);
    let (blocks, block_size, cache_heads) = (cache.shape()[0], cache.shape()[1], cache.shape()[2]);
    if cache.shape()[3] != dim || heads == 0 || cache_heads == 0 {
        return Err(GoldenError::domain(format!(
            "rows {:?} do not fit cache {:?}",
            rows.shape(),
            cache.shape()
        )));
    }
    let mut starts = Vec::with_capacity(seq_lens.len());
    let mut total = 0;
    for &len in seq_lens {
        starts.push(total);
        total += to_usize(len, "seqLen")?;
    }
    if total != rows.shape()[0] {
        return Err(GoldenError::domain(format!(
            "seqLen sums to {total} but {} token rows were given",
            rows.shape()[0]
        )));
    }
    for (i, (&slot, &win)) in slots.iter().zip(wins).enumerate() {
        let Some(base) = slot_index(slot, blocks * block_size)? else {
            continue;
        };
        let (b, h) = (i / heads, i % heads);
        let (Some(&start), Some(&len)) = (starts.get(b), seq_lens.get(b)) else {
            return Err(GoldenError::index(format!("pair {i} names batch {b} beyond seqLen")));
        };
        let len = len as usize;
        let win = to_usize(win, "window")?.min(len);
        if base + win > blocks * block_size {
            return Err(GoldenError::index(format!(
                "window of {win} from slot {base} overruns the cache"
            )));
        }
        let cache_head = h % cache_heads;
        for t in 0..win {
            let token = start + len - win + t;
            let src = (token * heads + h) * dim;
            let dst = ((base + t) * cache_heads + cache_head) * dim;
            cache.values_mut()[dst..dst + dim].copy_from_slice(&rows.values()[src..src + dim]);
        }
    }
    Ok(())
}

/// Inputs: `[key, value, key_cache, value_cache, slot_mapping]`, plus
/// `[wins, seq_len]` when `compressType` is `COMPRESS_TYPE_KVHEAD`.
/// Negative slots are padding and skipped.
pub fn reshape_and_cache(
    param: &OpParam,
    backend: &dyn HardwareBackend,
    inputs: &[Tensor],
) -> Result<Vec<Tensor>, GoldenError> {
    let key = input(inputs, 0)?;
    let value = input(inputs, 1)?;
    let mut key_cache = input(inputs, 2)?.clone();
    let mut value_cache = input(inputs, 3)?.clone();
    let slots = index_values(input(inputs, 4)?);
    for cache in [&key_cache, &value_cache] {
        if cache.ndim() != 4 {
            return Err(GoldenError::domain(format!(
                "cache must be 4-D, got {:?}",
                cache.shape()
            )));
        }
    }

    if !backend.is_910b() {
        scatter_nz(&mut key_cache, key, &slots)?;
        scatter_nz(&mut value_cache, value, &slots)?;
    } else if param.code_or("compressType", &COMPRESS_TYPES, 0)? == 1 {
        let wins = index_values(input(inputs, 5)?);
        let seq_lens = index_values(input(inputs, 6)?);
        scatter_compressed(&mut key_cache, key, &slots, &wins, &seq_lens)?;
        scatter_compressed(&mut value_cache, value, &slots, &wins, &seq_lens)?;
    } else {
        scatter_nd(&mut key_cache, key, &slots)?;
        scatter_nd(&mut value_cache, value, &slots)?;
    }
    Ok(vec![key_cache, value_cache])
}

#[cfg(test)]
mod tests {
    use super::{kv_cache, reshape_and_cache};
    use crate::golden::testing::{b310, b910, p, ramp, t, ti};
    use serde_json::json;

    fn zeros(shape: &[usize]) -> opk_tensor::Tensor {
        t(shape, &vec![0.0; shape.iter().product()])
    }

    #[test]
    fn kv_cache_writes_each_batch_before_its_offset() {
        let new_kv = t(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let inputs = [
            new_kv,
            ti(&[1], &[1.0]),
            zeros(&[2, 2, 3, 2]),
            ti(&[2], &[2.0, 1.0]),
            ti(&[2], &[2.0, 1.0]),
        ];
        let out = kv_cache(&inputs).expect("fits");
        let cache = &out[0];
        assert_eq!(cache.get(&[1, 0, 0, 0]), Some(1.0));
        assert_eq!(cache.get(&[1, 0, 1, 1]), Some(4.0));
        assert_eq!(cache.get(&[1, 1, 0, 0]), Some(5.0));
        assert_eq!(cache.get(&[1, 1, 1, 0]), Some(0.0));
        assert!(cache.values()[..12].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn kv_cache_rejects_out_of_range_positions() {
        let base = [
            ramp(&[1, 2]),
            ti(&[1], &[0.0]),
            zeros(&[1, 1, 2, 2]),
            ti(&[1], &[3.0]),
            ti(&[1], &[1.0]),
        ];
        assert_eq!(kv_cache(&base).expect_err("offset beyond maxSeq").kind(), "IndexError");

        let mut bad_layer = base.clone();
        bad_layer[1] = ti(&[1], &[4.0]);
        bad_layer[3] = ti(&[1], &[1.0]);
        assert_eq!(kv_cache(&bad_layer).expect_err("layer").kind(), "IndexError");
    }

    #[test]
    fn nd_cache_scatters_by_slot_and_skips_padding() {
        let key = t(&[2, 1, 2], &[1.0, 2.0, 3.0, 4.0]);
        let value = key.map(|v| v * 10.0);
        let inputs = [
            key,
            value,
            zeros(&[2, 2, 1, 2]),
            zeros(&[2, 2, 1, 2]),
            ti(&[2], &[3.0, -1.0]),
        ];
        let out = reshape_and_cache(&p(json!({})), &b910(), &inputs).expect("nd");
        assert_eq!(out[0].values(), &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
        assert_eq!(out[1].get(&[1, 1, 0, 1]), Some(20.0));

        let mut bad = inputs.clone();
        bad[4] = ti(&[2], &[4.0, 0.0]);
        let err = reshape_and_cache(&p(json!({})), &b910(), &bad).expect_err("slot beyond cache");
        assert_eq!(err.kind(), "IndexError");
    }

    #[test]
    fn nz_cache_uses_fractal_layout() {
        let key = ramp(&[1, 32]);
        let inputs = [
            key.clone(),
            key,
            zeros(&[1, 2, 4, 16]),
            zeros(&[1, 2, 4, 16]),
            ti(&[1], &[2.0]),
        ];
        let out = reshape_and_cache(&p(json!({})), &b310(), &inputs).expect("nz");
        assert_eq!(out[0].get(&[0, 0, 2, 5]), Some(5.0));
        assert_eq!(out[0].get(&[0, 1, 2, 0]), Some(16.0));
        assert_eq!(out[0].get(&[0, 1, 1, 0]), Some(0.0));
    }

    #[test]
    fn compressed_cache_keeps_recent_window_per_head() {
        // One batch of three tokens, two heads of width one.
        let key = t(&[3, 2, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let inputs = [
            key.clone(),
            key,
            zeros(&[1, 4, 1, 1]),
            zeros(&[1, 4, 1, 1]),
            ti(&[2], &[0.0, 2.0]),
            ti(&[2], &[2.0, 1.0]),
            ti(&[1], &[3.0]),
        ];
        let out = reshape_and_cache(&p(json!({"compressType": 1})), &b910(), &inputs).expect("compressed");
        assert_eq!(out[0].values(), &[3.0, 5.0, 6.0, 0.0]);

        let mut bad = inputs.clone();
        bad[5] = ti(&[1], &[2.0]);
        let err = reshape_and_cache(&p(json!({"compressType": 1})), &b910(), &bad).expect_err("wins");
        assert_eq!(err.kind(), "DomainError");
    }
}
