use serde::{Deserialize, Serialize};

/// Every operator kind the engine can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Activation,
    AllGather,
    AllReduce,
    AsStrided,
    Broadcast,
    Concat,
    Cumsum,
    Elewise,
    FastSoftMax,
    FastSoftMaxGrad,
    Fill,
    Gather,
    Gating,
    GenAttentionMask,
    IndexAdd,
    KvCache,
    LayerNorm,
    Linear,
    LinearParallel,
    LinearSparse,
    MatMul,
    Multinomial,
    Nonzero,
    Onehot,
    Pad,
    PagedAttention,
    Reduce,
    Repeat,
    ReshapeAndCache,
    RmsNorm,
    Rope,
    RopeGrad,
    Slice,
    Split,
    Transdata,
    Unpad,
}

const OPERATION_SUFFIX: &str = "Operation";

impl OpKind {
    pub const ALL: [Self; 36] = [
        Self::Activation,
        Self::AllGather,
        Self::AllReduce,
        Self::AsStrided,
        Self::Broadcast,
        Self::Concat,
        Self::Cumsum,
        Self::Elewise,
        Self::FastSoftMax,
        Self::FastSoftMaxGrad,
        Self::Fill,
        Self::Gather,
        Self::Gating,
        Self::GenAttentionMask,
        Self::IndexAdd,
        Self::KvCache,
        Self::LayerNorm,
        Self::Linear,
        Self::LinearParallel,
        Self::LinearSparse,
        Self::MatMul,
        Self::Multinomial,
        Self::Nonzero,
        Self::Onehot,
        Self::Pad,
        Self::PagedAttention,
        Self::Reduce,
        Self::Repeat,
        Self::ReshapeAndCache,
        Self::RmsNorm,
        Self::Rope,
        Self::RopeGrad,
        Self::Slice,
        Self::Split,
        Self::Transdata,
        Self::Unpad,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Activation => "Activation",
            Self::AllGather => "AllGather",
            Self::AllReduce => "AllReduce",
            Self::AsStrided => "AsStrided",
            Self::Broadcast => "Broadcast",
            Self::Concat => "Concat",
            Self::Cumsum => "Cumsum",
            Self::Elewise => "Elewise",
            Self::FastSoftMax => "FastSoftMax",
            Self::FastSoftMaxGrad => "FastSoftMaxGrad",
            Self::Fill => "Fill",
            Self::Gather => "Gather",
            Self::Gating => "Gating",
            Self::GenAttentionMask => "GenAttentionMask",
            Self::IndexAdd => "IndexAdd",
            Self::KvCache => "KvCache",
            Self::LayerNorm => "LayerNorm",
            Self::Linear => "Linear",
            Self::LinearParallel => "LinearParallel",
            Self::LinearSparse => "LinearSparse",
            Self::MatMul => "MatMul",
            Self::Multinomial => "Multinomial",
            Self::Nonzero => "Nonzero",
            Self::Onehot => "Onehot",
            Self::Pad => "Pad",
            Self::PagedAttention => "PagedAttention",
            Self::Reduce => "Reduce",
            Self::Repeat => "Repeat",
            Self::ReshapeAndCache => "ReshapeAndCache",
            Self::RmsNorm => "RmsNorm",
            Self::Rope => "Rope",
            Self::RopeGrad => "RopeGrad",
            Self::Slice => "Slice",
            Self::Split => "Split",
            Self::Transdata => "Transdata",
            Self::Unpad => "Unpad",
        }
    }

    /// Registry name as it appears in captured records, e.g. `ConcatOperation`.
    #[must_use]
    pub fn operation_name(self) -> String {
        format!("{}{OPERATION_SUFFIX}", self.name())
    }

    /// Looks up a kind by registry name; the `Operation` suffix is optional.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let bare = name.strip_suffix(OPERATION_SUFFIX).unwrap_or(name);
        Self::ALL.into_iter().find(|kind| kind.name() == bare)
    }

    /// Parameter keys that must be present before a golden is attempted.
    #[must_use]
    pub const fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::Activation => &["activationType"],
            Self::AllGather | Self::Broadcast => &["rank", "rankRoot", "rankSize"],
            Self::AllReduce => &["allReduceType", "rank", "rankRoot", "rankSize"],
            Self::AsStrided => &["size", "stride", "offset"],
            Self::Concat => &["concatDim"],
            Self::Cumsum => &["axes"],
            Self::Elewise => &["elewiseType"],
            Self::FastSoftMax => &["qSeqLen", "headNum"],
            Self::Fill => &["withMask"],
            Self::Gather => &["axis", "batchDims"],
            Self::Gating => &["topkExpertNum", "cumSumNum"],
            Self::GenAttentionMask => &["seqLen", "headNum"],
            Self::IndexAdd => &["indexType", "axis"],
            Self::LayerNorm | Self::RmsNorm => &["layerType"],
            Self::Linear => &["transposeA", "transposeB", "hasBias"],
            Self::LinearParallel => &["backend", "rank", "rankSize"],
            Self::LinearSparse | Self::MatMul => &["transposeA", "transposeB"],
            Self::Multinomial => &["numSamples", "randSeed"],
            Self::Onehot => &["axis", "depth"],
            Self::PagedAttention => &["headNum", "qkScale", "kvHeadNum", "maskType"],
            Self::Reduce => &["reduceType"],
            Self::Repeat => &["multiples"],
            Self::Rope => &["rotaryCoeff"],
            Self::RopeGrad => &["qSeqLen"],
            Self::Slice => &["offsets", "size"],
            Self::Split => &["splitDim", "splitNum"],
            Self::Transdata => &["transdataType"],
            Self::FastSoftMaxGrad
            | Self::KvCache
            | Self::Nonzero
            | Self::Pad
            | Self::ReshapeAndCache
            | Self::Unpad => &[],
        }
    }

    /// Keys a kernel may read when present; absent ones fall back to a
    /// default or, for `Fill` and the elementwise extras, are checked during
    /// validation.
    #[must_use]
    pub const fn optional_params(self) -> &'static [&'static str] {
        match self {
            Self::Activation => &["scale", "dim"],
            Self::Cumsum => &["exclusive", "reverse"],
            Self::Elewise => &["outTensorType", "varAttr", "quantParam"],
            Self::FastSoftMaxGrad => &["qSeqLen", "headNum"],
            Self::Fill => &["value", "outDim"],
            Self::LayerNorm | Self::RmsNorm => &["normParam", "preNormParam", "postNormParam"],
            Self::LinearParallel => &["type", "hasResidual", "transWeight"],
            Self::PagedAttention => &["quantType", "hasQuantOffset"],
            Self::Reduce => &["axis"],
            Self::ReshapeAndCache => &["compressType"],
            Self::Split => &["splitSizes"],
            Self::Transdata => &["outCrops"],
            _ => &[],
        }
    }

    /// Whether `key` is one of the required or optional params of this kind.
    #[must_use]
    pub fn declares(self, key: &str) -> bool {
        self.required_params().contains(&key) || self.optional_params().contains(&key)
    }

    /// Input positions the accelerator mutates in place; their post-call
    /// contents are the outputs compared.
    #[must_use]
    pub const fn inplace_indices(self) -> &'static [usize] {
        match self {
            Self::KvCache => &[2],
            Self::ReshapeAndCache => &[2, 3],
            _ => &[],
        }
    }

    /// Operators whose inputs are gathered from every rank.
    #[must_use]
    pub const fn is_collective(self) -> bool {
        matches!(
            self,
            Self::AllGather | Self::AllReduce | Self::Broadcast | Self::LinearParallel
        )
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
