use std::fs;
use std::path::{Path, PathBuf};

use opk_dtype::DType;
use opk_ops::OpParam;
use opk_tensor::Tensor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a record's tensor lives: spelled out inline, or dumped to `.npy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TensorSource {
    Inline {
        shape: Vec<usize>,
        dtype: String,
        values: Vec<f64>,
    },
    File {
        path: PathBuf,
    },
}

impl TensorSource {
    #[must_use]
    pub fn inline(tensor: &Tensor) -> Self {
        Self::Inline {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype().name().to_string(),
            values: tensor.values().to_vec(),
        }
    }

    /// Materializes the tensor; relative file paths resolve against `base`.
    pub fn resolve(&self, base: Option<&Path>) -> Result<Tensor, String> {
        match self {
            Self::Inline {
                shape,
                dtype,
                values,
            } => {
                let dtype = DType::parse(dtype).ok_or_else(|| format!("unknown dtype {dtype:?}"))?;
                Tensor::new(shape.clone(), values.clone(), dtype).map_err(|err| err.to_string())
            }
            Self::File { path } => {
                let full = match base {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                opk_io::load_npy(&full)
                    .map_err(|err| format!("failed reading {}: {err}", full.display()))
            }
        }
    }
}

/// One captured operator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub op_id: String,
    pub op_name: String,
    #[serde(default)]
    pub op_param: OpParam,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_path: Option<PathBuf>,
    #[serde(default)]
    pub inputs: Vec<TensorSource>,
    /// `None` makes the record validation-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<TensorSource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
}

impl Record {
    pub fn load_inputs(&self) -> Result<Vec<Tensor>, String> {
        resolve_all(&self.inputs, self.tensor_path.as_deref())
    }

    pub fn load_outputs(&self) -> Result<Option<Vec<Tensor>>, String> {
        self.outputs
            .as_ref()
            .map(|outputs| resolve_all(outputs, self.tensor_path.as_deref()))
            .transpose()
    }

    /// Stable sha256 of the serialized record, used to correlate log lines.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let payload = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&payload);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[must_use]
    pub fn tensor_path_display(&self) -> String {
        self.tensor_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

fn resolve_all(sources: &[TensorSource], base: Option<&Path>) -> Result<Vec<Tensor>, String> {
    sources.iter().map(|source| source.resolve(base)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub cases: Vec<Record>,
}

impl Manifest {
    /// Reads a manifest; relative `tensor_path`s are taken from the
    /// manifest's own directory, and records without one inherit it.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
        let mut manifest: Self = serde_json::from_str(&raw)
            .map_err(|err| format!("failed parsing {}: {err}", path.display()))?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        for record in &mut manifest.cases {
            record.tensor_path = Some(match record.tensor_path.take() {
                Some(dir) if dir.is_relative() => root.join(dir),
                Some(dir) => dir,
                None => root.clone(),
            });
        }
        Ok(manifest)
    }
}
