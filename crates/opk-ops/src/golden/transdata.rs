//! Conversions between row-major ND tensors and the fractal NZ layout the
//! cube units consume: `(batch, cols / c0, rows, c0)` tiles of 16 rows.

use opk_dtype::DType;
use opk_tensor::Tensor;

use super::{input, usize_list};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const TRANSDATA_TYPES: [(&str, i64); 3] = [
    ("UNDEFINED", 0),
    ("FRACTAL_NZ_TO_ND", 1),
    ("ND_TO_FRACTAL_NZ", 2),
];

const ROW_ALIGN: usize = 16;

/// Smallest multiple of `align` not below `x`.
#[must_use]
pub const fn round_up(x: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return None;
    }
    Some(x.div_ceil(align) * align)
}

/// Fractal width for `dtype`: 32 one-byte lanes for int8, 16 otherwise.
#[must_use]
pub const fn c0(dtype: DType) -> usize {
    match dtype {
        DType::I8 | DType::U8 => 32,
        _ => 16,
    }
}

pub fn transdata(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    match param.code("transdataType", &TRANSDATA_TYPES)? {
        2 => Ok(vec![nd_to_nz(x)?]),
        1 => {
            let crops = if param.contains("outCrops") {
                Some(usize_list(&param.i64_list("outCrops")?, "outCrops")?)
            } else {
                None
            };
            Ok(vec![nz_to_nd(x, crops.as_deref())?])
        }
        _ => Ok(vec![nz_to_nd(x, None)?]),
    }
}

pub fn nd_to_nz(x: &Tensor) -> Result<Tensor, GoldenError> {
    let (batch, rows, cols) = match *x.shape() {
        [rows, cols] => (1, rows, cols),
        [batch, rows, cols] => (batch, rows, cols),
        _ => {
            return Err(GoldenError::domain(format!(
                "ND to NZ expects a 2-D or 3-D tensor, got {:?}",
                x.shape()
            )));
        }
    };
    let c0 = c0(x.dtype());
    let (Some(padded_rows), Some(padded_cols)) = (round_up(rows, ROW_ALIGN), round_up(cols, c0)) else {
        return Err(GoldenError::domain("fractal alignment is zero"));
    };
    let mut padded = vec![0.0; batch * padded_rows * padded_cols];
    for b in 0..batch {
        for r in 0..rows {
            let src = (b * rows + r) * cols;
            let dst = (b * padded_rows + r) * padded_cols;
            padded[dst..dst + cols].copy_from_slice(&x.values()[src..src + cols]);
        }
    }
    let n1 = padded_cols / c0;
    let tiles = Tensor::new(vec![batch, padded_rows, n1, c0], padded, x.dtype())?;
    Ok(tiles.permute(&[0, 2, 1, 3])?)
}

/// `(b, n1, m, c0)` back to `(b, m, n1·c0)`, optionally cropped to the
/// trailing `[rows, cols]` in `crops`.
pub fn nz_to_nd(x: &Tensor, crops: Option<&[usize]>) -> Result<Tensor, GoldenError> {
    let [b, n1, m, c0] = *x.shape() else {
        return Err(GoldenError::domain(format!(
            "NZ to ND expects a 4-D tensor, got {:?}",
            x.shape()
        )));
    };
    let nd = x.permute(&[0, 2, 1, 3])?.reshape_exact(&[b, m, n1 * c0])?;
    let Some(crops) = crops else {
        return Ok(nd);
    };
    let [rows, cols] = *crops else {
        return Err(GoldenError::InvalidParam {
            key: "outCrops".to_string(),
            reason: format!("expected [rows, cols], got {crops:?}"),
        });
    };
    if rows > m || cols > n1 * c0 {
        return Err(GoldenError::domain(format!(
            "crop {crops:?} exceeds padded extent [{m}, {}]",
            n1 * c0
        )));
    }
    Ok(nd.narrow(1, 0, rows)?.narrow(2, 0, cols)?)
}

#[cfg(test)]
mod tests {
    use super::{round_up, transdata};
    use crate::golden::testing::{p, ramp};
    use opk_dtype::DType;
    use serde_json::json;

    #[test]
    fn round_up_aligns_and_rejects_zero() {
        assert_eq!(round_up(3, 16), Some(16));
        assert_eq!(round_up(32, 16), Some(32));
        assert_eq!(round_up(0, 16), Some(0));
        assert_eq!(round_up(5, 0), None);
    }

    #[test]
    fn nd_to_nz_shapes() {
        let nz = p(json!({"transdataType": 2}));
        assert_eq!(transdata(&nz, &[ramp(&[2, 3, 4])]).expect("3d")[0].shape(), &[2, 1, 16, 16]);
        assert_eq!(transdata(&nz, &[ramp(&[2, 3])]).expect("2d")[0].shape(), &[1, 1, 16, 16]);
        let int8 = ramp(&[2, 3, 4]).with_dtype(DType::I8);
        assert_eq!(transdata(&nz, &[int8]).expect("int8")[0].shape(), &[2, 1, 16, 32]);
    }

    #[test]
    fn nd_to_nz_places_values_in_fractals() {
        let out = transdata(&p(json!({"transdataType": "ND_TO_FRACTAL_NZ"})), &[ramp(&[1, 2, 20])])
            .expect("two fractals");
        let nz = &out[0];
        assert_eq!(nz.shape(), &[1, 2, 16, 16]);
        assert_eq!(nz.get(&[0, 0, 1, 3]), Some(23.0));
        assert_eq!(nz.get(&[0, 1, 0, 2]), Some(18.0));
        assert_eq!(nz.get(&[0, 1, 0, 5]), Some(0.0));
    }

    #[test]
    fn nz_to_nd_crops_padding() {
        let out = transdata(
            &p(json!({"transdataType": 1, "outCrops": [3, 4]})),
            &[ramp(&[2, 3, 4, 8])],
        )
        .expect("crop fits");
        assert_eq!(out[0].shape(), &[2, 3, 4]);

        let uncropped = transdata(&p(json!({"transdataType": 0})), &[ramp(&[2, 3, 4, 8])]).expect("fallback");
        assert_eq!(uncropped[0].shape(), &[2, 4, 24]);

        let err = transdata(
            &p(json!({"transdataType": 1, "outCrops": [5, 4]})),
            &[ramp(&[2, 3, 4, 8])],
        )
        .expect_err("crop too tall");
        assert_eq!(err.kind(), "DomainError");
    }

    #[test]
    fn nz_round_trip_recovers_nd() {
        let x = ramp(&[2, 5, 7]);
        let nz = transdata(&p(json!({"transdataType": 2})), &[x.clone()]).expect("to nz");
        let back = transdata(&p(json!({"transdataType": 1, "outCrops": [5, 7]})), &nz).expect("to nd");
        assert_eq!(back[0].values(), x.values());
    }
}
