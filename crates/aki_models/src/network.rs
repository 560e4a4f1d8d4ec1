//! The multi-branch AKI classifier.
//!
//! Seven residual encoders turn the five inputs into hidden maps. Drug,
//! patient-info and dynamic-other are joined on the slot axis and passed
//! through a self-attention and a residual stack; the time-series encoder
//! output attends to itself and to the ratio, gradient and flag encoders,
//! and the five results go through a second residual stack. Both stacks
//! are pooled, joined, attended over once more and flattened into the
//! classification head.

use std::collections::{BTreeMap, HashMap};

use aki_core::{FeatureLayout, InputBatch, InputName, Seed};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::layers::{LayerGroup, LayerId, LayerTable};
use crate::operator::{ActivationKind, Operator, PoolSpec};
use crate::trace::{
    AttentionPart, AttentionTrace, BranchId, BranchRecorder, BranchSource, FusionKind,
    FusionPoint, FusionTrace, InputSlot, Operand, ResidualTrace, Trace, TraceBuilder,
};

/// Configuration for [`AkiNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AkiNetConfig {
    /// Feature layout of the inputs.
    pub layout: FeatureLayout,
    /// Hidden width of encoders and residual stacks.
    pub hidden: usize,
    /// Width of the head's hidden layer.
    pub head_hidden: usize,
    /// Residual blocks per stack.
    pub stack_blocks: usize,
    /// Seed for parameter initialization.
    pub seed: Seed,
}

impl Default for AkiNetConfig {
    fn default() -> Self {
        Self {
            layout: FeatureLayout::default(),
            hidden: 64,
            head_hidden: 512,
            stack_blocks: 3,
            seed: Seed::default(),
        }
    }
}

impl AkiNetConfig {
    /// Create a config for `layout` with default widths.
    pub fn new(layout: FeatureLayout) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }

    /// Set the hidden width.
    #[must_use]
    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    /// Set the head's hidden width.
    #[must_use]
    pub fn with_head_hidden(mut self, head_hidden: usize) -> Self {
        self.head_hidden = head_hidden;
        self
    }

    /// Set the number of blocks per residual stack.
    #[must_use]
    pub fn with_stack_blocks(mut self, stack_blocks: usize) -> Self {
        self.stack_blocks = stack_blocks;
        self
    }

    /// Set the initialization seed.
    #[must_use]
    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = seed;
        self
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Rows of the first kernel of the time-series stack.
    ///
    /// Layouts with a single statistic row use the light `1×2` kernel.
    pub fn timeseries_kernel_rows(&self) -> usize {
        if self.layout.stat_rows >= 2 {
            2
        } else {
            1
        }
    }

    /// Width of the binary stack output after pooling.
    pub fn binary_pooled_width(&self) -> usize {
        PoolSpec::avg([1, 2]).output_size([1, self.layout.binary_width()])[1]
    }

    /// `[rows, width]` of the time-series stack output after pooling.
    pub fn timeseries_pooled_size(&self) -> [usize; 2] {
        PoolSpec::avg([self.timeseries_kernel_rows(), 2])
            .output_size([self.layout.stat_rows, self.layout.timeseries_width()])
    }

    /// Number of features entering the head.
    pub fn head_input_width(&self) -> usize {
        self.hidden * (self.binary_pooled_width() + self.timeseries_pooled_size()[1])
    }

    /// Check the config.
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        if self.hidden < 2 {
            return Err(ModelError::InvalidConfig("hidden must be at least 2".into()));
        }
        if self.head_hidden == 0 || self.stack_blocks == 0 {
            return Err(ModelError::InvalidConfig(
                "head_hidden and stack_blocks must be positive".into(),
            ));
        }
        if self.timeseries_pooled_size()[0] != 1 {
            return Err(ModelError::InvalidConfig(format!(
                "{} statistic rows do not pool to a single row",
                self.layout.stat_rows
            )));
        }
        Ok(())
    }

    /// Initialize the network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<AkiNet<B>> {
        self.validate()?;
        Ok(AkiNet::new(self.clone(), device))
    }
}

/// `merge(deep(x) + shortcut(x))`.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    /// Deep-path layers in order.
    pub deep: Vec<LayerId>,
    /// Shortcut projection.
    pub shortcut: LayerId,
    /// Activation after the sum.
    pub merge: LayerId,
}

#[derive(Debug, Clone)]
struct Encoder {
    branch: BranchId,
    slot: InputSlot,
    block: ResidualBlock,
}

/// The AKI classifier with its layer table.
#[derive(Debug, Clone)]
pub struct AkiNet<B: Backend> {
    config: AkiNetConfig,
    layers: LayerTable<B>,
    encoders: Vec<Encoder>,
    binary_stack: Vec<ResidualBlock>,
    timeseries_stack: Vec<ResidualBlock>,
    binary_pool: LayerId,
    timeseries_pool: LayerId,
    head: Vec<LayerId>,
}

/// Draws parameters from per-layer seed streams.
struct ParameterInit<'a, B: Backend> {
    seed: Seed,
    device: &'a B::Device,
}

impl<B: Backend> ParameterInit<'_, B> {
    fn uniform(&self, key: &str, count: usize, bound: f32) -> Vec<f32> {
        let mut rng = self.seed.stream(key);
        let dist = Uniform::new_inclusive(-bound, bound);
        (0..count).map(|_| dist.sample(&mut rng)).collect()
    }

    fn conv(&self, name: &str, in_ch: usize, out_ch: usize, kernel: [usize; 2], pad: [usize; 2]) -> Operator<B> {
        let fan_in = in_ch * kernel[0] * kernel[1];
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight = self.uniform(&format!("{name}.weight"), out_ch * fan_in, bound);
        let bias = self.uniform(&format!("{name}.bias"), out_ch, bound);
        Operator::Conv {
            weight: Tensor::<B, 1>::from_floats(weight.as_slice(), self.device).reshape([
                out_ch, in_ch, kernel[0], kernel[1],
            ]),
            bias: Some(Tensor::<B, 1>::from_floats(bias.as_slice(), self.device)),
            stride: [1, 1],
            pad,
        }
    }

    fn linear(&self, name: &str, d_in: usize, d_out: usize) -> Operator<B> {
        let bound = 1.0 / (d_in as f32).sqrt();
        let weight = self.uniform(&format!("{name}.weight"), d_in * d_out, bound);
        let bias = self.uniform(&format!("{name}.bias"), d_out, bound);
        Operator::Linear {
            weight: Tensor::<B, 1>::from_floats(weight.as_slice(), self.device).reshape([d_in, d_out]),
            bias: Some(Tensor::<B, 1>::from_floats(bias.as_slice(), self.device)),
        }
    }
}

impl<B: Backend> AkiNet<B> {
    /// Build the network from a validated config.
    fn new(config: AkiNetConfig, device: &B::Device) -> Self {
        use ActivationKind::{Relu, Tanh};

        let init = ParameterInit::<B> {
            seed: config.seed,
            device,
        };
        let layout = config.layout;
        let hidden = config.hidden;
        let rows = layout.stat_rows;
        let ts = layout.timeseries_features;
        let mut layers = LayerTable::new();

        let encoder_specs = [
            (BranchId::Drug, InputName::Drug, 0..1, layout.drug_features, [Relu, Relu, Relu]),
            (BranchId::PatientInfo, InputName::PatientInfo, 0..1, 1, [Relu, Relu, Relu]),
            (BranchId::DynamicOther, InputName::DynamicOther, 0..1, layout.dynamic_other_features, [Tanh, Tanh, Tanh]),
            (BranchId::DynamicRatio, InputName::Threshold, 2 * rows..3 * rows, ts, [Tanh, Tanh, Tanh]),
            (BranchId::DynamicTimeseries, InputName::Timeseries, 0..rows, ts, [Tanh, Tanh, Tanh]),
            (BranchId::Flag, InputName::Threshold, 0..2 * rows, ts, [Relu, Relu, Relu]),
            (BranchId::DynamicGradient, InputName::Threshold, 3 * rows..4 * rows, ts, [Tanh, Relu, Relu]),
        ];
        let encoders: Vec<Encoder> = encoder_specs
            .into_iter()
            .map(|(branch, input, rows, channels, activations)| Encoder {
                branch,
                slot: InputSlot { input, rows },
                block: residual_block(
                    &mut layers,
                    &init,
                    BlockSpec {
                        name: branch.to_string(),
                        group: LayerGroup::Encoder(branch),
                        widths: [channels, hidden / 2, hidden, hidden],
                        first_kernel: [1, 1],
                        activations,
                    },
                ),
            })
            .collect();

        let kernel_rows = config.timeseries_kernel_rows();
        let stack = |layers: &mut LayerTable<B>, branch: BranchId, first_kernel: [usize; 2]| {
            (0..config.stack_blocks)
                .map(|block| {
                    residual_block(
                        layers,
                        &init,
                        BlockSpec {
                            name: format!("{branch}.{block}"),
                            group: LayerGroup::ResidualStack(branch),
                            widths: [hidden, hidden, 2 * hidden, hidden],
                            first_kernel,
                            activations: [Relu, Relu, Relu],
                        },
                    )
                })
                .collect::<Vec<_>>()
        };
        let binary_stack = stack(&mut layers, BranchId::BinaryStack, [1, 2]);
        let timeseries_stack = stack(&mut layers, BranchId::TimeseriesStack, [kernel_rows, 2]);
        let binary_pool = layers.push(
            "binary-stack.pool",
            LayerGroup::Pool(BranchId::BinaryStack),
            Operator::Pool(PoolSpec::avg([1, 2])),
        );
        let timeseries_pool = layers.push(
            "timeseries-stack.pool",
            LayerGroup::Pool(BranchId::TimeseriesStack),
            Operator::Pool(PoolSpec::avg([kernel_rows, 2])),
        );

        let head = vec![
            layers.push(
                "head.0",
                LayerGroup::Head,
                init.linear("head.0", config.head_input_width(), config.head_hidden),
            ),
            layers.push("head.1", LayerGroup::Head, Operator::Activation(Relu)),
            layers.push("head.2", LayerGroup::Head, init.linear("head.2", config.head_hidden, 1)),
        ];

        debug!(
            layers = layers.len(),
            parameters = layers.parameter_count(),
            "initialized AKI network"
        );

        Self {
            config,
            layers,
            encoders,
            binary_stack,
            timeseries_stack,
            binary_pool,
            timeseries_pool,
            head,
        }
    }

    /// Network config.
    pub fn config(&self) -> &AkiNetConfig {
        &self.config
    }

    /// Layers in recording order.
    pub fn layers(&self) -> &LayerTable<B> {
        &self.layers
    }

    /// Mutable layer table, used to load trained parameters.
    pub fn layers_mut(&mut self) -> &mut LayerTable<B> {
        &mut self.layers
    }

    /// Logits `(N, 1)`.
    pub fn forward(&self, batch: &InputBatch<B>) -> Result<Tensor<B, 2>> {
        Ok(self.trace(batch)?.logits().clone())
    }

    /// Predicted probabilities `(N, 1)`.
    pub fn predict_proba(&self, batch: &InputBatch<B>) -> Result<Tensor<B, 2>> {
        Ok(sigmoid(self.forward(batch)?))
    }

    fn apply(&self, id: LayerId, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let layer = self
            .layers
            .get(id)
            .ok_or_else(|| ModelError::MalformedTrace(format!("unknown layer {id}")))?;
        Ok(layer.operator.forward(x))
    }

    fn apply_block(&self, block: &ResidualBlock, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, ResidualTrace<B>)> {
        let mut h = x.clone();
        let mut deep = Vec::with_capacity(block.deep.len());
        for id in &block.deep {
            deep.push((*id, h.clone()));
            h = self.apply(*id, h)?;
        }
        let shortcut_output = self.apply(block.shortcut, x.clone())?;
        let merged = h.clone() + shortcut_output.clone();
        let output = self.apply(block.merge, merged.clone())?;
        Ok((
            output,
            ResidualTrace {
                input: x,
                deep,
                deep_output: h,
                shortcut: block.shortcut,
                shortcut_output,
                merge: block.merge,
                merged,
            },
        ))
    }

    fn run_stack(
        &self,
        branch: BranchId,
        point: FusionPoint,
        blocks: &[ResidualBlock],
        pool: LayerId,
        x: Tensor<B, 4>,
        builder: &mut TraceBuilder<B>,
    ) -> Result<Tensor<B, 4>> {
        let mut recorder = BranchRecorder::new(branch, BranchSource::Fusion(point));
        let mut h = x;
        for block in blocks {
            let (out, record) = self.apply_block(block, h)?;
            recorder.residual(record);
            h = out;
        }
        recorder.layer(pool, h.clone());
        let out = self.apply(pool, h)?;
        builder.record_branch(recorder.finish(out.clone()))?;
        Ok(out)
    }

    /// Run the forward pass and record everything relevance propagation needs.
    pub fn trace(&self, batch: &InputBatch<B>) -> Result<Trace<B>> {
        let layout = &self.config.layout;
        let n = batch.batch_size();
        let input_dims: BTreeMap<InputName, [usize; 4]> = InputName::ALL
            .iter()
            .map(|input| (*input, layout.input_dims(*input, n)))
            .collect();
        for (input, dims) in &input_dims {
            let got = batch.get(*input).dims();
            if got != *dims {
                return Err(aki_core::CoreError::InvalidShape {
                    input: input.to_string(),
                    expected: format!("{dims:?}"),
                    got: format!("{got:?}"),
                }
                .into());
            }
        }
        let mut builder = TraceBuilder::new(input_dims);

        let mut outputs: HashMap<BranchId, Tensor<B, 4>> = HashMap::new();
        for encoder in &self.encoders {
            let source = batch.get(encoder.slot.input);
            let [n, c, _, w] = source.dims();
            let x = source
                .clone()
                .slice([0..n, 0..c, encoder.slot.rows.clone(), 0..w]);
            let mut recorder =
                BranchRecorder::new(encoder.branch, BranchSource::Input(encoder.slot.clone()));
            let (out, record) = self.apply_block(&encoder.block, x)?;
            recorder.residual(record);
            builder.record_branch(recorder.finish(out.clone()))?;
            outputs.insert(encoder.branch, out);
        }
        let output = |id: BranchId| {
            outputs
                .get(&id)
                .cloned()
                .ok_or_else(|| ModelError::MalformedTrace(format!("branch {id} has no output")))
        };

        let binary_sources = [BranchId::Drug, BranchId::PatientInfo, BranchId::DynamicOther];
        let binary_parts = binary_sources
            .iter()
            .map(|id| output(*id))
            .collect::<Result<Vec<_>>>()?;
        let binary_joined = self.joint_fusion(FusionPoint::BinaryJoin, &binary_sources, binary_parts, &mut builder)?;
        let binary = self.run_stack(
            BranchId::BinaryStack,
            FusionPoint::BinaryJoin,
            &self.binary_stack,
            self.binary_pool,
            binary_joined,
            &mut builder,
        )?;

        let rows = layout.stat_rows;
        let timeseries = output(BranchId::DynamicTimeseries)?;
        let part_specs = [
            (BranchId::DynamicTimeseries, Operand::Value, None),
            (BranchId::DynamicRatio, Operand::Key, Some(0..rows)),
            (BranchId::DynamicGradient, Operand::Key, Some(0..rows)),
            (BranchId::Flag, Operand::Key, Some(0..rows)),
            (BranchId::Flag, Operand::Key, Some(rows..2 * rows)),
        ];
        let mut parts = Vec::with_capacity(part_specs.len());
        let mut attended = Vec::with_capacity(part_specs.len());
        for (source, operand, part_rows) in part_specs {
            let key = match (&operand, &part_rows) {
                (Operand::Value, _) | (_, None) => timeseries.clone(),
                (Operand::Key, Some(range)) => {
                    let key = output(source)?;
                    let [n, c, _, w] = key.dims();
                    key.slice([0..n, 0..c, range.clone(), 0..w])
                }
            };
            let (out, weights) =
                scaled_dot_product_attention(timeseries.clone(), key.clone(), timeseries.clone());
            parts.push(AttentionPart {
                source,
                operand,
                rows: part_rows,
                width: out.dims()[3],
                attention: AttentionTrace {
                    query: timeseries.clone(),
                    key,
                    value: timeseries.clone(),
                    weights,
                },
            });
            attended.push(out);
        }
        let timeseries_joined = Tensor::cat(attended, 3);
        builder.record_fusion(FusionTrace {
            point: FusionPoint::TimeseriesJoin,
            kind: FusionKind::Parallel { parts },
            output_dims: timeseries_joined.dims(),
        })?;
        let timeseries = self.run_stack(
            BranchId::TimeseriesStack,
            FusionPoint::TimeseriesJoin,
            &self.timeseries_stack,
            self.timeseries_pool,
            timeseries_joined,
            &mut builder,
        )?;

        let final_joined = self.joint_fusion(
            FusionPoint::FinalJoin,
            &[BranchId::BinaryStack, BranchId::TimeseriesStack],
            vec![binary, timeseries],
            &mut builder,
        )?;
        let [n, c, h, w] = final_joined.dims();
        let mut x = final_joined.reshape([n, 1, 1, c * h * w]);
        let mut head = BranchRecorder::new(BranchId::Head, BranchSource::Fusion(FusionPoint::FinalJoin));
        for id in &self.head {
            head.layer(*id, x.clone());
            x = self.apply(*id, x)?;
        }
        let logits = x.clone().reshape([n, 1]);
        builder.record_branch(head.finish(x))?;

        let trace = builder.finish(logits)?;
        debug!(batch = n, branches = trace.branches().len(), "recorded forward trace");
        Ok(trace)
    }

    fn joint_fusion(
        &self,
        point: FusionPoint,
        sources: &[BranchId],
        parts: Vec<Tensor<B, 4>>,
        builder: &mut TraceBuilder<B>,
    ) -> Result<Tensor<B, 4>> {
        let widths: Vec<(BranchId, usize)> = sources
            .iter()
            .zip(parts.iter())
            .map(|(id, part)| (*id, part.dims()[3]))
            .collect();
        let joined = Tensor::cat(parts, 3);
        let (out, weights) = scaled_dot_product_attention(joined.clone(), joined.clone(), joined.clone());
        builder.record_fusion(FusionTrace {
            point,
            kind: FusionKind::Joint {
                sources: widths,
                attention: AttentionTrace {
                    query: joined.clone(),
                    key: joined.clone(),
                    value: joined,
                    weights,
                },
            },
            output_dims: out.dims(),
        })?;
        Ok(out)
    }
}

struct BlockSpec {
    name: String,
    group: LayerGroup,
    /// Channels `[input, deep.0 out, deep.2 out, output]`.
    widths: [usize; 4],
    first_kernel: [usize; 2],
    /// Activations after `deep.0`, after `deep.2`, and after the merge.
    activations: [ActivationKind; 3],
}

/// Push the seven layers of one residual block.
///
/// The first deep convolution is zero-padded on the top and left so that
/// the block output keeps the input's rows and columns.
fn residual_block<B: Backend>(
    layers: &mut LayerTable<B>,
    init: &ParameterInit<'_, B>,
    spec: BlockSpec,
) -> ResidualBlock {
    let BlockSpec {
        name,
        group,
        widths: [d_in, d_mid, d_deep, d_out],
        first_kernel,
        activations: [act1, act2, merge_act],
    } = spec;
    let pad = [first_kernel[0] - 1, first_kernel[1] - 1];
    let conv = |layers: &mut LayerTable<B>, suffix: &str, from: usize, to: usize, kernel, pad| {
        let full = format!("{name}.{suffix}");
        let op = init.conv(&full, from, to, kernel, pad);
        layers.push(full, group, op)
    };

    let deep = vec![
        conv(layers, "deep.0", d_in, d_mid, first_kernel, pad),
        layers.push(format!("{name}.deep.1"), group, Operator::Activation(act1)),
        conv(layers, "deep.2", d_mid, d_deep, [1, 1], [0, 0]),
        layers.push(format!("{name}.deep.3"), group, Operator::Activation(act2)),
        conv(layers, "deep.4", d_deep, d_out, [1, 1], [0, 0]),
    ];
    let shortcut = conv(layers, "shortcut", d_in, d_out, [1, 1], [0, 0]);
    let merge = layers.push(format!("{name}.merge"), group, Operator::Activation(merge_act));
    ResidualBlock {
        deep,
        shortcut,
        merge,
    }
}

/// `softmax(Q·Kᵀ/√d)·V` over the last two axes; returns the output and the weights.
pub fn scaled_dot_product_attention<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let scale = 1.0 / (query.dims()[3] as f64).sqrt();
    let scores = query.matmul(key.transpose()).mul_scalar(scale);
    let weights = softmax(scores, 3);
    (weights.clone().matmul(value), weights)
}
