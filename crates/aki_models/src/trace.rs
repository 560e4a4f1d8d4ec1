//! Record of one forward pass, in the form relevance propagation consumes.
//!
//! A [`Trace`] holds the activation chain of every branch, the block
//! records of every residual step, and the attention operands of every
//! fusion point. It is built append-only through [`TraceBuilder`]: a
//! fusion point can only be recorded after all of its source branches, and
//! a branch fed by a fusion point only after that fusion point. Walking
//! the branches in reverse recording order is therefore a valid reverse
//! topological order of the network.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use aki_core::InputName;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::layers::LayerId;

/// Named branches of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchId {
    /// Drug encoder.
    Drug,
    /// Patient-info encoder.
    PatientInfo,
    /// Dynamic-other encoder.
    DynamicOther,
    /// Ratio rows of the threshold input.
    DynamicRatio,
    /// Gradient rows of the threshold input.
    DynamicGradient,
    /// Time-series encoder.
    DynamicTimeseries,
    /// Flag rows of the threshold input.
    Flag,
    /// Residual stack after the binary join.
    BinaryStack,
    /// Residual stack after the time-series join.
    TimeseriesStack,
    /// Classification head after the final join.
    Head,
}

impl BranchId {
    /// Kebab-case name used in layer names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchId::Drug => "drug",
            BranchId::PatientInfo => "patient-info",
            BranchId::DynamicOther => "dynamic-other",
            BranchId::DynamicRatio => "dynamic-ratio",
            BranchId::DynamicGradient => "dynamic-gradient",
            BranchId::DynamicTimeseries => "dynamic-timeseries",
            BranchId::Flag => "flag",
            BranchId::BinaryStack => "binary-stack",
            BranchId::TimeseriesStack => "timeseries-stack",
            BranchId::Head => "head",
        }
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named points where branches are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FusionPoint {
    /// Drug, patient-info and dynamic-other, followed by self-attention.
    BinaryJoin,
    /// Five attentions over the time-series encoder output.
    TimeseriesJoin,
    /// Both residual stacks, followed by self-attention.
    FinalJoin,
}

impl FusionPoint {
    /// Kebab-case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionPoint::BinaryJoin => "binary-join",
            FusionPoint::TimeseriesJoin => "timeseries-join",
            FusionPoint::FinalJoin => "final-join",
        }
    }
}

impl fmt::Display for FusionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rows `rows` (H axis) of a named input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSlot {
    /// Input the rows are taken from.
    pub input: InputName,
    /// Row range on the H axis.
    pub rows: Range<usize>,
}

/// Where a branch's input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSource {
    /// A slice of a network input.
    Input(InputSlot),
    /// The output of a fusion point.
    Fusion(FusionPoint),
}

/// One residual block: `merge(deep(x) + shortcut(x))`.
#[derive(Debug, Clone)]
pub struct ResidualTrace<B: Backend> {
    /// Block input, shared by both paths.
    pub input: Tensor<B, 4>,
    /// Deep-path layers with the activation each one consumed.
    pub deep: Vec<(LayerId, Tensor<B, 4>)>,
    /// Deep-path output.
    pub deep_output: Tensor<B, 4>,
    /// Shortcut projection.
    pub shortcut: LayerId,
    /// Shortcut output.
    pub shortcut_output: Tensor<B, 4>,
    /// Activation applied after the sum.
    pub merge: LayerId,
    /// `deep_output + shortcut_output`, the merge activation's input.
    pub merged: Tensor<B, 4>,
}

/// One step of a branch's activation chain.
#[derive(Debug, Clone)]
pub enum Step<B: Backend> {
    /// A single layer applied to `input`.
    Layer {
        /// Layer applied.
        layer: LayerId,
        /// Activation the layer consumed.
        input: Tensor<B, 4>,
    },
    /// A residual block.
    Residual(ResidualTrace<B>),
}

impl<B: Backend> Step<B> {
    /// Activation the step consumed.
    pub fn input(&self) -> &Tensor<B, 4> {
        match self {
            Step::Layer { input, .. } => input,
            Step::Residual(block) => &block.input,
        }
    }
}

/// Activation chain of one branch.
#[derive(Debug, Clone)]
pub struct BranchTrace<B: Backend> {
    /// Branch name.
    pub id: BranchId,
    /// Origin of the branch input.
    pub source: BranchSource,
    /// Steps oldest to newest.
    pub steps: Vec<Step<B>>,
    /// Branch output.
    pub output: Tensor<B, 4>,
}

impl<B: Backend> BranchTrace<B> {
    /// Activations `A_0 … A_n`, oldest to newest.
    pub fn activations(&self) -> Vec<&Tensor<B, 4>> {
        self.steps
            .iter()
            .map(Step::input)
            .chain(std::iter::once(&self.output))
            .collect()
    }

    /// Branch input `A_0`.
    pub fn input(&self) -> &Tensor<B, 4> {
        self.steps.first().map_or(&self.output, Step::input)
    }
}

/// Appends steps to a branch while the forward pass runs.
#[derive(Debug)]
pub struct BranchRecorder<B: Backend> {
    id: BranchId,
    source: BranchSource,
    steps: Vec<Step<B>>,
}

impl<B: Backend> BranchRecorder<B> {
    /// Start recording branch `id`.
    pub fn new(id: BranchId, source: BranchSource) -> Self {
        Self {
            id,
            source,
            steps: Vec::new(),
        }
    }

    /// Record `layer` consuming `input`.
    pub fn layer(&mut self, layer: LayerId, input: Tensor<B, 4>) {
        self.steps.push(Step::Layer { layer, input });
    }

    /// Record a residual block.
    pub fn residual(&mut self, block: ResidualTrace<B>) {
        self.steps.push(Step::Residual(block));
    }

    /// Close the branch with its output.
    pub fn finish(self, output: Tensor<B, 4>) -> BranchTrace<B> {
        BranchTrace {
            id: self.id,
            source: self.source,
            steps: self.steps,
            output,
        }
    }
}

/// Operands of one scaled dot-product attention.
#[derive(Debug, Clone)]
pub struct AttentionTrace<B: Backend> {
    /// Queries `(N, C, Lq, D)`.
    pub query: Tensor<B, 4>,
    /// Keys `(N, C, Lk, D)`.
    pub key: Tensor<B, 4>,
    /// Values `(N, C, Lk, Dv)`.
    pub value: Tensor<B, 4>,
    /// Softmax weights `(N, C, Lq, Lk)`.
    pub weights: Tensor<B, 4>,
}

/// Operand through which an attention part hands relevance back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operand {
    /// Value path.
    Value,
    /// Key path.
    Key,
}

/// One attention of a parallel fusion point.
#[derive(Debug, Clone)]
pub struct AttentionPart<B: Backend> {
    /// Branch receiving this part's relevance.
    pub source: BranchId,
    /// Operand whose relevance is returned to `source`.
    pub operand: Operand,
    /// Rows of the source output the operand was sliced from, if any.
    pub rows: Option<Range<usize>>,
    /// Width of this part in the concatenated output.
    pub width: usize,
    /// Attention operands.
    pub attention: AttentionTrace<B>,
}

/// How a fusion point combines its sources.
#[derive(Debug, Clone)]
pub enum FusionKind<B: Backend> {
    /// Sources concatenated on the last axis, then one self-attention.
    Joint {
        /// Source branches with their widths, in concatenation order.
        sources: Vec<(BranchId, usize)>,
        /// The self-attention over the concatenation.
        attention: AttentionTrace<B>,
    },
    /// One attention per part, outputs concatenated on the last axis.
    Parallel {
        /// Parts in concatenation order.
        parts: Vec<AttentionPart<B>>,
    },
}

/// Record of one fusion point.
#[derive(Debug, Clone)]
pub struct FusionTrace<B: Backend> {
    /// Fusion point name.
    pub point: FusionPoint,
    /// How the sources are combined.
    pub kind: FusionKind<B>,
    /// Dims of the fusion output, before any flattening by the consumer.
    pub output_dims: [usize; 4],
}

impl<B: Backend> FusionTrace<B> {
    /// Attention checkpoints in recording order.
    pub fn attentions(&self) -> Vec<&AttentionTrace<B>> {
        match &self.kind {
            FusionKind::Joint { attention, .. } => vec![attention],
            FusionKind::Parallel { parts } => parts.iter().map(|p| &p.attention).collect(),
        }
    }

    /// Branches feeding this point.
    pub fn sources(&self) -> Vec<BranchId> {
        match &self.kind {
            FusionKind::Joint { sources, .. } => sources.iter().map(|(id, _)| *id).collect(),
            FusionKind::Parallel { parts } => parts.iter().map(|p| p.source).collect(),
        }
    }
}

/// Complete record of one forward pass.
#[derive(Debug, Clone)]
pub struct Trace<B: Backend> {
    branches: Vec<BranchTrace<B>>,
    fusions: Vec<FusionTrace<B>>,
    input_dims: BTreeMap<InputName, [usize; 4]>,
    logits: Tensor<B, 2>,
}

/// A trace split into its parts, for consumers that take ownership.
pub struct TraceParts<B: Backend> {
    /// Branches in recording order.
    pub branches: Vec<BranchTrace<B>>,
    /// Fusion points in recording order.
    pub fusions: Vec<FusionTrace<B>>,
    /// Dims of each named input.
    pub input_dims: BTreeMap<InputName, [usize; 4]>,
    /// Logits `(N, 1)`.
    pub logits: Tensor<B, 2>,
}

impl<B: Backend> Trace<B> {
    /// Branch `id`, if recorded.
    pub fn branch(&self, id: BranchId) -> Option<&BranchTrace<B>> {
        self.branches.iter().find(|b| b.id == id)
    }

    /// Branches in recording order.
    pub fn branches(&self) -> &[BranchTrace<B>] {
        &self.branches
    }

    /// Fusion point `point`, if recorded.
    pub fn fusion(&self, point: FusionPoint) -> Option<&FusionTrace<B>> {
        self.fusions.iter().find(|f| f.point == point)
    }

    /// `(Q, K, V, weights)` of the `index`-th attention at `point`.
    pub fn attention_checkpoint(
        &self,
        point: FusionPoint,
        index: usize,
    ) -> Option<(&Tensor<B, 4>, &Tensor<B, 4>, &Tensor<B, 4>, &Tensor<B, 4>)> {
        let attention = *self.fusion(point)?.attentions().get(index)?;
        Some((
            &attention.query,
            &attention.key,
            &attention.value,
            &attention.weights,
        ))
    }

    /// Dims of input `name`.
    pub fn input_dims(&self, name: InputName) -> Option<[usize; 4]> {
        self.input_dims.get(&name).copied()
    }

    /// Logits `(N, 1)`.
    pub fn logits(&self) -> &Tensor<B, 2> {
        &self.logits
    }

    /// Number of samples.
    pub fn batch_size(&self) -> usize {
        self.logits.dims()[0]
    }

    /// Split the trace into its parts.
    pub fn into_parts(self) -> TraceParts<B> {
        TraceParts {
            branches: self.branches,
            fusions: self.fusions,
            input_dims: self.input_dims,
            logits: self.logits,
        }
    }
}

/// Append-only builder enforcing the recording order.
#[derive(Debug)]
pub struct TraceBuilder<B: Backend> {
    branches: Vec<BranchTrace<B>>,
    fusions: Vec<FusionTrace<B>>,
    input_dims: BTreeMap<InputName, [usize; 4]>,
}

impl<B: Backend> TraceBuilder<B> {
    /// Start a trace over inputs with the given dims.
    pub fn new(input_dims: BTreeMap<InputName, [usize; 4]>) -> Self {
        Self {
            branches: Vec::new(),
            fusions: Vec::new(),
            input_dims,
        }
    }

    fn has_branch(&self, id: BranchId) -> bool {
        self.branches.iter().any(|b| b.id == id)
    }

    /// Append a finished branch.
    pub fn record_branch(&mut self, branch: BranchTrace<B>) -> Result<()> {
        if self.has_branch(branch.id) {
            return Err(ModelError::MalformedTrace(format!(
                "branch {} recorded twice",
                branch.id
            )));
        }
        match &branch.source {
            BranchSource::Input(slot) => {
                let dims = self.input_dims.get(&slot.input).ok_or_else(|| {
                    ModelError::MalformedTrace(format!("unknown input {}", slot.input))
                })?;
                if slot.rows.start >= slot.rows.end || slot.rows.end > dims[2] {
                    return Err(ModelError::MalformedTrace(format!(
                        "rows {:?} outside input {} with {} rows",
                        slot.rows, slot.input, dims[2]
                    )));
                }
            }
            BranchSource::Fusion(point) => {
                if !self.fusions.iter().any(|f| f.point == *point) {
                    return Err(ModelError::MalformedTrace(format!(
                        "branch {} recorded before its fusion point {point}",
                        branch.id
                    )));
                }
                if self.branches.iter().any(|b| b.source == branch.source) {
                    return Err(ModelError::MalformedTrace(format!(
                        "fusion point {point} feeds more than one branch"
                    )));
                }
            }
        }
        self.branches.push(branch);
        Ok(())
    }

    /// Append a fusion point. All of its sources must be recorded already.
    pub fn record_fusion(&mut self, fusion: FusionTrace<B>) -> Result<()> {
        if self.fusions.iter().any(|f| f.point == fusion.point) {
            return Err(ModelError::MalformedTrace(format!(
                "fusion point {} recorded twice",
                fusion.point
            )));
        }
        if let Some(missing) = fusion.sources().into_iter().find(|id| !self.has_branch(*id)) {
            return Err(ModelError::MalformedTrace(format!(
                "fusion point {} recorded before its source {missing}",
                fusion.point
            )));
        }
        self.fusions.push(fusion);
        Ok(())
    }

    /// Close the trace with the network's logits.
    ///
    /// Every fusion point must feed a branch, and every branch but the
    /// last must feed a fusion point.
    pub fn finish(self, logits: Tensor<B, 2>) -> Result<Trace<B>> {
        let Some(last) = self.branches.last() else {
            return Err(ModelError::MalformedTrace("no branch recorded".into()));
        };
        for fusion in &self.fusions {
            let consumed = self
                .branches
                .iter()
                .any(|b| b.source == BranchSource::Fusion(fusion.point));
            if !consumed {
                return Err(ModelError::MalformedTrace(format!(
                    "fusion point {} feeds no branch",
                    fusion.point
                )));
            }
        }
        for branch in &self.branches {
            if branch.id == last.id {
                continue;
            }
            let consumed = self.fusions.iter().any(|f| f.sources().contains(&branch.id));
            if !consumed {
                return Err(ModelError::MalformedTrace(format!(
                    "branch {} feeds no fusion point",
                    branch.id
                )));
            }
        }
        Ok(Trace {
            branches: self.branches,
            fusions: self.fusions,
            input_dims: self.input_dims,
            logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tensor(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::full([1, 1, 1, 2], value, &Default::default())
    }

    fn input_branch(id: BranchId, input: InputName) -> BranchTrace<TestBackend> {
        let mut recorder = BranchRecorder::new(
            id,
            BranchSource::Input(InputSlot { input, rows: 0..1 }),
        );
        recorder.layer(LayerId(0), tensor(0.0));
        recorder.layer(LayerId(1), tensor(1.0));
        recorder.finish(tensor(2.0))
    }

    fn joint(point: FusionPoint, sources: Vec<(BranchId, usize)>) -> FusionTrace<TestBackend> {
        FusionTrace {
            point,
            kind: FusionKind::Joint {
                sources,
                attention: AttentionTrace {
                    query: tensor(1.0),
                    key: tensor(2.0),
                    value: tensor(3.0),
                    weights: Tensor::ones([1, 1, 1, 1], &Default::default()),
                },
            },
            output_dims: [1, 1, 1, 4],
        }
    }

    fn dims() -> BTreeMap<InputName, [usize; 4]> {
        BTreeMap::from([
            (InputName::Drug, [1, 1, 1, 2]),
            (InputName::PatientInfo, [1, 1, 1, 2]),
        ])
    }

    fn first_value(t: &Tensor<TestBackend, 4>) -> f32 {
        t.clone().into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_activations_oldest_to_newest() {
        let branch = input_branch(BranchId::Drug, InputName::Drug);
        let values: Vec<f32> = branch.activations().into_iter().map(first_value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(first_value(branch.input()), 0.0);
    }

    #[test]
    fn test_fusion_before_sources_is_rejected() {
        let mut builder = TraceBuilder::<TestBackend>::new(dims());
        builder
            .record_branch(input_branch(BranchId::Drug, InputName::Drug))
            .unwrap();
        let err = builder
            .record_fusion(joint(
                FusionPoint::BinaryJoin,
                vec![(BranchId::Drug, 2), (BranchId::PatientInfo, 2)],
            ))
            .unwrap_err();
        assert!(matches!(err, ModelError::MalformedTrace(_)));
    }

    #[test]
    fn test_complete_trace() {
        let mut builder = TraceBuilder::<TestBackend>::new(dims());
        builder
            .record_branch(input_branch(BranchId::Drug, InputName::Drug))
            .unwrap();
        builder
            .record_branch(input_branch(BranchId::PatientInfo, InputName::PatientInfo))
            .unwrap();
        builder
            .record_fusion(joint(
                FusionPoint::FinalJoin,
                vec![(BranchId::Drug, 2), (BranchId::PatientInfo, 2)],
            ))
            .unwrap();
        let mut head = BranchRecorder::new(BranchId::Head, BranchSource::Fusion(FusionPoint::FinalJoin));
        head.layer(LayerId(2), tensor(4.0));
        builder.record_branch(head.finish(tensor(5.0))).unwrap();

        let trace = builder
            .finish(Tensor::zeros([1, 1], &Default::default()))
            .unwrap();
        assert_eq!(trace.branches().len(), 3);
        assert_eq!(trace.batch_size(), 1);
        let (q, k, v, w) = trace.attention_checkpoint(FusionPoint::FinalJoin, 0).unwrap();
        assert_eq!(first_value(q), 1.0);
        assert_eq!(first_value(k), 2.0);
        assert_eq!(first_value(v), 3.0);
        assert_eq!(w.dims(), [1, 1, 1, 1]);
        assert!(trace.attention_checkpoint(FusionPoint::FinalJoin, 1).is_none());
        assert!(trace.attention_checkpoint(FusionPoint::BinaryJoin, 0).is_none());
    }

    #[test]
    fn test_dangling_branch_is_rejected() {
        let mut builder = TraceBuilder::<TestBackend>::new(dims());
        builder
            .record_branch(input_branch(BranchId::Drug, InputName::Drug))
            .unwrap();
        builder
            .record_branch(input_branch(BranchId::PatientInfo, InputName::PatientInfo))
            .unwrap();
        assert!(builder
            .finish(Tensor::zeros([1, 1], &Default::default()))
            .is_err());
    }
}
