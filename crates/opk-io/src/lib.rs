#![forbid(unsafe_code)]

use core::fmt;
use std::path::Path;

use half::{bf16, f16};
use opk_dtype::DType;
use opk_tensor::Tensor;

/// `\x93NUMPY` followed by a major/minor version byte pair.
pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
/// Upper bound on the header dictionary a dump may declare.
pub const HEADER_LIMIT: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpyError {
    BadMagic,
    UnsupportedVersion(u8, u8),
    MalformedHeader(&'static str),
    UnsupportedDescr(String),
    TruncatedBody { expected: usize, actual: usize },
    HeaderTooLarge(usize),
    Fs(String),
}

impl NpyError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::BadMagic => "npy_bad_magic",
            Self::UnsupportedVersion(..) => "npy_unsupported_version",
            Self::MalformedHeader(_) => "npy_malformed_header",
            Self::UnsupportedDescr(_) => "npy_unsupported_descr",
            Self::TruncatedBody { .. } => "npy_truncated_body",
            Self::HeaderTooLarge(_) => "npy_header_too_large",
            Self::Fs(_) => "npy_fs",
        }
    }
}

impl fmt::Display for NpyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not an npy payload"),
            Self::UnsupportedVersion(major, minor) => {
                write!(f, "npy format version {major}.{minor} is not supported")
            }
            Self::MalformedHeader(what) => write!(f, "malformed npy header: {what}"),
            Self::UnsupportedDescr(descr) => {
                write!(f, "dtype descriptor {descr:?} is invalid or unsupported")
            }
            Self::TruncatedBody { expected, actual } => write!(
                f,
                "npy body holds {actual} bytes but header declares {expected}"
            ),
            Self::HeaderTooLarge(len) => {
                write!(f, "npy header of {len} bytes exceeds the {HEADER_LIMIT} byte limit")
            }
            Self::Fs(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for NpyError {}

/// Parsed header dictionary of a dump file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: DType,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

/// Little-endian npy descriptor. bfloat16 has none and is written widened
/// to float32.
#[must_use]
pub const fn descr_for(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "|b1",
        DType::I8 => "|i1",
        DType::U8 => "|u1",
        DType::I16 => "<i2",
        DType::I32 => "<i4",
        DType::I64 => "<i8",
        DType::F16 => "<f2",
        DType::BF16 | DType::F32 => "<f4",
        DType::F64 => "<f8",
    }
}

fn decode_descr(descr: &str) -> Result<DType, NpyError> {
    let unsupported = || NpyError::UnsupportedDescr(descr.to_string());
    let (order, code) = descr.split_at_checked(1).ok_or_else(unsupported)?;
    // single-byte kinds accept any order mark; wider kinds must be little-endian
    let single_byte = matches!(code, "b1" | "i1" | "u1");
    if !(matches!(order, "<" | "=") || (single_byte && order == "|")) {
        return Err(unsupported());
    }
    Ok(match code {
        "b1" => DType::Bool,
        "i1" => DType::I8,
        "u1" => DType::U8,
        "i2" => DType::I16,
        "i4" => DType::I32,
        "i8" => DType::I64,
        "f2" => DType::F16,
        "f4" => DType::F32,
        "f8" => DType::F64,
        _ => return Err(unsupported()),
    })
}

/// Width in bytes of the little-endian header length for a format version.
fn length_width(major: u8, minor: u8) -> Result<usize, NpyError> {
    match (major, minor) {
        (1, 0) => Ok(2),
        (2 | 3, 0) => Ok(4),
        _ => Err(NpyError::UnsupportedVersion(major, minor)),
    }
}

fn shape_literal(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    if dims.len() == 1 {
        format!("({},)", dims[0])
    } else {
        format!("({})", dims.join(", "))
    }
}

/// Renders the header dictionary padded with spaces so the body starts on a
/// 64 byte boundary after a v1.0 preamble.
fn render_header(header: &NpyHeader) -> Vec<u8> {
    let order = if header.fortran_order { "True" } else { "False" };
    let mut text = format!(
        "{{'descr': '{}', 'fortran_order': {order}, 'shape': {}, }}",
        descr_for(header.dtype),
        shape_literal(&header.shape)
    );
    let preamble = NPY_MAGIC.len() + 4;
    while (preamble + text.len() + 1) % 64 != 0 {
        text.push(' ');
    }
    text.push('\n');
    text.into_bytes()
}

/// Returns the header dictionary bytes and the offset where the body begins.
fn split_preamble(payload: &[u8]) -> Result<(&[u8], usize), NpyError> {
    let rest = payload.strip_prefix(NPY_MAGIC.as_slice()).ok_or(NpyError::BadMagic)?;
    let [major, minor, rest @ ..] = rest else {
        return Err(NpyError::BadMagic);
    };
    let width = length_width(*major, *minor)?;
    if rest.len() < width {
        return Err(NpyError::MalformedHeader("payload ends inside the length field"));
    }
    let mut raw = [0u8; 4];
    raw[..width].copy_from_slice(&rest[..width]);
    let len = u32::from_le_bytes(raw) as usize;
    if len == 0 || len > HEADER_LIMIT {
        return Err(NpyError::HeaderTooLarge(len));
    }
    let start = NPY_MAGIC.len() + 2 + width;
    let end = start + len;
    let dictionary = payload
        .get(start..end)
        .ok_or(NpyError::MalformedHeader("payload ends inside the header"))?;
    Ok((dictionary, end))
}

/// Splits `{'k': v, ...}` into its top-level entries. Commas inside the
/// shape tuple do not separate entries.
fn dictionary_entries(text: &str) -> Result<Vec<(&str, &str)>, NpyError> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or(NpyError::MalformedHeader("header is not a dictionary"))?;
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (pos, ch) in inner.char_indices().chain(std::iter::once((inner.len(), ','))) {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let entry = inner[start..pos].trim();
                start = pos + 1;
                if entry.is_empty() {
                    continue;
                }
                let (key, value) = entry
                    .split_once(':')
                    .ok_or(NpyError::MalformedHeader("entry without ':'"))?;
                let key = key.trim().trim_matches(|c| c == '\'' || c == '"');
                entries.push((key, value.trim()));
            }
            _ => {}
        }
    }
    Ok(entries)
}

fn parse_header(bytes: &[u8]) -> Result<NpyHeader, NpyError> {
    let text =
        std::str::from_utf8(bytes).map_err(|_| NpyError::MalformedHeader("header is not ascii"))?;
    let entries = dictionary_entries(text)?;
    let lookup = |key: &str| {
        entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or(NpyError::MalformedHeader("descr, fortran_order and shape are all required"))
    };

    let descr = lookup("descr")?;
    let descr = descr
        .strip_prefix('\'')
        .and_then(|d| d.strip_suffix('\''))
        .or_else(|| descr.strip_prefix('"').and_then(|d| d.strip_suffix('"')))
        .ok_or(NpyError::MalformedHeader("descr must be a quoted string"))?;
    let dtype = decode_descr(descr)?;

    let fortran_order = match lookup("fortran_order")? {
        "True" => true,
        "False" => false,
        _ => return Err(NpyError::MalformedHeader("fortran_order must be True or False")),
    };

    let shape = lookup("shape")?
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or(NpyError::MalformedHeader("shape must be a tuple"))?
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::MalformedHeader("shape dims must be non-negative integers"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NpyHeader {
        dtype,
        fortran_order,
        shape,
    })
}

fn decode_element(dtype: DType, chunk: &[u8]) -> f64 {
    match dtype {
        DType::Bool => f64::from(u8::from(chunk[0] != 0)),
        DType::I8 => f64::from(chunk[0] as i8),
        DType::U8 => f64::from(chunk[0]),
        DType::I16 => f64::from(i16::from_le_bytes([chunk[0], chunk[1]])),
        DType::I32 => f64::from(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        DType::I64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            i64::from_le_bytes(raw) as f64
        }
        DType::F16 => f16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
        DType::BF16 => bf16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
        DType::F32 => f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        DType::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        }
    }
}

fn encode_element(dtype: DType, value: f64, out: &mut Vec<u8>) {
    let stored = dtype.store(value);
    match dtype {
        DType::Bool | DType::U8 => out.push(stored as u8),
        DType::I8 => out.push((stored as i8) as u8),
        DType::I16 => out.extend_from_slice(&(stored as i16).to_le_bytes()),
        DType::I32 => out.extend_from_slice(&(stored as i32).to_le_bytes()),
        DType::I64 => out.extend_from_slice(&(stored as i64).to_le_bytes()),
        DType::F16 => out.extend_from_slice(&f16::from_f64(stored).to_le_bytes()),
        DType::BF16 | DType::F32 => out.extend_from_slice(&(stored as f32).to_le_bytes()),
        DType::F64 => out.extend_from_slice(&stored.to_le_bytes()),
    }
}

/// Decodes an npy payload into a C-ordered tensor.
pub fn read_npy_bytes(payload: &[u8]) -> Result<Tensor, NpyError> {
    let (dictionary, body_start) = split_preamble(payload)?;
    let header = parse_header(dictionary)?;
    let body = &payload[body_start..];

    let width = header.dtype.item_size();
    let expected = opk_ndarray::element_count(&header.shape)
        .ok()
        .and_then(|count| count.checked_mul(width))
        .ok_or(NpyError::MalformedHeader("shape is too large"))?;
    if body.len() < expected {
        return Err(NpyError::TruncatedBody {
            expected,
            actual: body.len(),
        });
    }
    let values: Vec<f64> = body[..expected]
        .chunks_exact(width)
        .map(|chunk| decode_element(header.dtype, chunk))
        .collect();

    let misfit = |_| NpyError::MalformedHeader("body does not fit the declared shape");
    if header.fortran_order && header.shape.len() > 1 {
        // column-major storage is the transpose of the reversed shape
        let reversed: Vec<usize> = header.shape.iter().rev().copied().collect();
        let axes: Vec<usize> = (0..reversed.len()).rev().collect();
        return Tensor::new(reversed, values, header.dtype)
            .and_then(|t| t.permute(&axes))
            .map_err(misfit);
    }
    Tensor::new(header.shape, values, header.dtype).map_err(misfit)
}

/// Encodes a tensor as a version 1.0 C-ordered npy payload.
pub fn write_npy_bytes(tensor: &Tensor) -> Result<Vec<u8>, NpyError> {
    let storage = match tensor.dtype() {
        DType::BF16 => DType::F32,
        other => other,
    };
    let dictionary = render_header(&NpyHeader {
        dtype: storage,
        fortran_order: false,
        shape: tensor.shape().to_vec(),
    });
    let len = u16::try_from(dictionary.len())
        .map_err(|_| NpyError::HeaderTooLarge(dictionary.len()))?;

    let mut out = Vec::with_capacity(
        NPY_MAGIC.len() + 4 + dictionary.len() + tensor.numel() * storage.item_size(),
    );
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&dictionary);
    for &value in tensor.values() {
        encode_element(storage, value, &mut out);
    }
    Ok(out)
}

pub fn load_npy(path: &Path) -> Result<Tensor, NpyError> {
    let bytes = std::fs::read(path)
        .map_err(|err| NpyError::Fs(format!("failed reading {}: {err}", path.display())))?;
    read_npy_bytes(&bytes)
}

pub fn save_npy(path: &Path, tensor: &Tensor) -> Result<(), NpyError> {
    let bytes = write_npy_bytes(tensor)?;
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|err| NpyError::Fs(format!("failed creating {}: {err}", dir.display())))?;
    }
    std::fs::write(path, bytes)
        .map_err(|err| NpyError::Fs(format!("failed writing {}: {err}", path.display())))
}
