//! Reverse traversal of a recorded forward pass.
//!
//! The engine walks the trace's branches newest first. A branch starts
//! once relevance for its output is pending: the last branch is seeded at
//! the logits, every other branch receives relevance from the fusion point
//! it feeds. Within a branch, steps are undone newest first with the rule
//! bound to each layer; residual blocks propagate both paths from the
//! block output and blend them. Branches fed by an input deposit their
//! relevance into the rows of that input's map.
//!
//! The five input maps are returned together or not at all.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use aki_core::{tensor_to_array, InputName};
use aki_models::{
    BranchId, BranchSource, BranchTrace, FusionKind, FusionPoint, FusionTrace, LayerId, LayerTable,
    Operand, ResidualTrace, Step, Trace, TraceParts,
};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attention::{attention_relevance, sample_totals};
use crate::config::{ExplainConfig, OutputRelevance};
use crate::error::{ExplainError, Result};
use crate::registry::{LayerRegistry, RuleDescription};
use crate::residual::blend;
use crate::rules::Rule;

/// Totals of one audited rule application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Branch the layer belongs to.
    pub branch: BranchId,
    /// Layer name.
    pub layer: String,
    /// Batch total of the output relevance.
    pub before: f64,
    /// Batch total of the input relevance.
    pub after: f64,
}

impl AuditEntry {
    /// `|after - before|`.
    pub fn drift(&self) -> f64 {
        (self.after - self.before).abs()
    }
}

/// Relevance of every named input, shaped like the input.
#[derive(Debug, Clone)]
pub struct InputRelevance<B: Backend> {
    maps: BTreeMap<InputName, Tensor<B, 4>>,
}

impl<B: Backend> InputRelevance<B> {
    /// Relevance map of `input`.
    pub fn get(&self, input: InputName) -> Option<&Tensor<B, 4>> {
        self.maps.get(&input)
    }

    /// Maps in input order.
    pub fn iter(&self) -> impl Iterator<Item = (InputName, &Tensor<B, 4>)> {
        self.maps.iter().map(|(name, map)| (*name, map))
    }

    /// Total relevance of each sample over all maps.
    pub fn sample_totals(&self) -> Result<Vec<f32>> {
        let mut totals: Option<Tensor<B, 1>> = None;
        for map in self.maps.values() {
            let t = sample_totals(map.clone());
            totals = Some(match totals {
                Some(acc) => acc + t,
                None => t,
            });
        }
        let Some(totals) = totals else {
            return Ok(Vec::new());
        };
        totals
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| aki_core::CoreError::TensorData(format!("{e:?}")).into())
    }

    /// Copy every map to the host.
    pub fn to_arrays(&self) -> Result<BTreeMap<InputName, Array4<f32>>> {
        self.iter()
            .map(|(name, map)| -> Result<_> { Ok((name, tensor_to_array(map.clone())?)) })
            .collect()
    }
}

/// Result of one explanation request.
#[derive(Debug, Clone)]
pub struct Explanation<B: Backend> {
    /// Relevance of the five inputs.
    pub relevance: InputRelevance<B>,
    /// Audit records, empty unless enabled.
    pub audit: Vec<AuditEntry>,
    /// Logits of the explained forward pass.
    pub logits: Tensor<B, 2>,
}

/// Layer-wise relevance propagation over a [`Trace`].
///
/// Rules are bound once, at construction; a rule list that does not fit the
/// layer table is rejected before any tensor work.
#[derive(Debug, Clone)]
pub struct LrpEngine<B: Backend> {
    layers: LayerTable<B>,
    rules: Vec<Rule>,
    config: ExplainConfig,
}

fn failed(branch: impl Display, operator: impl Display, reason: impl Into<String>) -> ExplainError {
    ExplainError::ExplanationFailed {
        branch: branch.to_string(),
        operator: operator.to_string(),
        reason: reason.into(),
    }
}

fn total<B: Backend>(t: &Tensor<B, 4>) -> f64 {
    t.clone().sum().into_scalar().elem()
}

/// Add `relevance` to the pending relevance of `source`'s output.
fn route<B: Backend>(
    branches: &[BranchTrace<B>],
    point: FusionPoint,
    pending: &mut HashMap<BranchId, Tensor<B, 4>>,
    source: BranchId,
    relevance: Tensor<B, 4>,
) -> Result<()> {
    let target = branches
        .iter()
        .find(|b| b.id == source)
        .map(|b| b.output.dims())
        .ok_or_else(|| failed(source, point, "source branch not recorded"))?;
    if relevance.dims() != target {
        return Err(failed(
            source,
            point,
            format!("routed relevance {:?} for output {target:?}", relevance.dims()),
        ));
    }
    let relevance = match pending.remove(&source) {
        Some(acc) => acc + relevance,
        None => relevance,
    };
    pending.insert(source, relevance);
    Ok(())
}

impl<B: Backend> LrpEngine<B> {
    /// Bind `rules` to `layers` one-to-one.
    pub fn new(
        layers: LayerTable<B>,
        rules: &[RuleDescription],
        config: ExplainConfig,
    ) -> Result<Self> {
        let rules = LayerRegistry::new().bind(&layers, rules)?;
        Ok(Self {
            layers,
            rules,
            config,
        })
    }

    /// Engine config.
    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    /// Bound rules, one per layer.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Layer table the rules are bound to.
    pub fn layers(&self) -> &LayerTable<B> {
        &self.layers
    }
}

impl<B: AutodiffBackend> LrpEngine<B> {
    /// Propagate relevance from the logits back to the inputs.
    pub fn explain(&self, trace: Trace<B>) -> Result<Explanation<B>> {
        let TraceParts {
            branches,
            fusions,
            input_dims,
            logits,
        } = trace.into_parts();
        let n = logits.dims()[0];
        let device = logits.device();
        info!(batch = n, branches = branches.len(), "explaining batch");

        let last = branches
            .last()
            .ok_or_else(|| failed("trace", "init", "no branch recorded"))?;
        let seed = self.seed(&logits);
        if last.output.dims() != seed.dims() {
            return Err(failed(
                last.id,
                "init",
                format!("output {:?} is not one logit per sample", last.output.dims()),
            ));
        }
        let mut pending = HashMap::from([(last.id, seed)]);
        let mut maps: BTreeMap<InputName, Tensor<B, 4>> = input_dims
            .iter()
            .map(|(name, dims)| (*name, Tensor::zeros(*dims, &device)))
            .collect();
        let mut audit = Vec::new();

        for branch in branches.iter().rev() {
            let incoming = pending
                .remove(&branch.id)
                .ok_or_else(|| failed(branch.id, "branch", "no incoming relevance"))?;
            debug!(branch = %branch.id, steps = branch.steps.len(), "propagating branch");
            let relevance = self.propagate_branch(branch, incoming, &mut audit)?;

            match &branch.source {
                BranchSource::Input(slot) => {
                    let map = maps.remove(&slot.input).ok_or_else(|| {
                        failed(branch.id, slot.input, "input not declared by the trace")
                    })?;
                    let [mn, mc, _, mw] = map.dims();
                    let ranges = [0..mn, 0..mc, slot.rows.clone(), 0..mw];
                    if relevance.dims() != [mn, mc, slot.rows.len(), mw] {
                        return Err(failed(
                            branch.id,
                            slot.input,
                            format!(
                                "relevance {:?} for rows {:?} of {:?}",
                                relevance.dims(),
                                slot.rows,
                                map.dims()
                            ),
                        ));
                    }
                    let current = map.clone().slice(ranges.clone());
                    maps.insert(slot.input, map.slice_assign(ranges, current + relevance));
                }
                BranchSource::Fusion(point) => {
                    let fusion = fusions
                        .iter()
                        .find(|f| f.point == *point)
                        .ok_or_else(|| failed(branch.id, point, "fusion point not recorded"))?;
                    self.fuse(branch.id, fusion, relevance, &branches, &mut pending)?;
                }
            }
        }

        if let Some(id) = pending.keys().next() {
            return Err(failed(id, "fusion", "relevance routed to a branch that was never visited"));
        }
        if self.config.audit {
            let worst = audit.iter().map(AuditEntry::drift).fold(0.0, f64::max);
            debug!(entries = audit.len(), worst_drift = worst, "conservation audit");
        }
        Ok(Explanation {
            relevance: InputRelevance { maps },
            audit,
            logits,
        })
    }

    fn seed(&self, logits: &Tensor<B, 2>) -> Tensor<B, 4> {
        let n = logits.dims()[0];
        match self.config.output_relevance {
            OutputRelevance::BatchUniform => {
                Tensor::full([n, 1, 1, 1], 1.0 / n.max(1) as f64, &logits.device())
            }
            OutputRelevance::Prediction => sigmoid(logits.clone().detach()).reshape([n, 1, 1, 1]),
        }
    }

    fn propagate_branch(
        &self,
        branch: &BranchTrace<B>,
        relevance: Tensor<B, 4>,
        audit: &mut Vec<AuditEntry>,
    ) -> Result<Tensor<B, 4>> {
        if relevance.dims() != branch.output.dims() {
            return Err(failed(
                branch.id,
                "output",
                format!(
                    "relevance {:?} for output {:?}",
                    relevance.dims(),
                    branch.output.dims()
                ),
            ));
        }
        let mut relevance = relevance;
        for step in branch.steps.iter().rev() {
            relevance = match step {
                Step::Layer { layer, input } => {
                    self.apply_layer(branch.id, *layer, input, relevance, audit)?
                }
                Step::Residual(block) => self.propagate_block(branch.id, block, relevance, audit)?,
            };
        }
        Ok(relevance)
    }

    fn propagate_block(
        &self,
        branch: BranchId,
        block: &ResidualTrace<B>,
        relevance: Tensor<B, 4>,
        audit: &mut Vec<AuditEntry>,
    ) -> Result<Tensor<B, 4>> {
        let merged = self.apply_layer(branch, block.merge, &block.merged, relevance, audit)?;
        let mut deep = merged.clone();
        for (layer, input) in block.deep.iter().rev() {
            deep = self.apply_layer(branch, *layer, input, deep, audit)?;
        }
        let shortcut = self.apply_layer(branch, block.shortcut, &block.input, merged, audit)?;
        if deep.dims() != shortcut.dims() {
            return Err(failed(
                branch,
                block.shortcut,
                format!(
                    "deep path relevance {:?} and shortcut relevance {:?}",
                    deep.dims(),
                    shortcut.dims()
                ),
            ));
        }
        if self.config.audit {
            debug!(
                branch = %branch,
                deep = total(&deep),
                shortcut = total(&shortcut),
                "skip blend"
            );
        }
        Ok(blend(deep, shortcut))
    }

    fn apply_layer(
        &self,
        branch: BranchId,
        id: LayerId,
        input: &Tensor<B, 4>,
        relevance: Tensor<B, 4>,
        audit: &mut Vec<AuditEntry>,
    ) -> Result<Tensor<B, 4>> {
        let (layer, rule) = self
            .layers
            .get(id)
            .zip(self.rules.get(id.0))
            .ok_or_else(|| failed(branch, id, "layer is not in the bound table"))?;
        let before = (self.config.audit && rule.is_conservative()).then(|| total(&relevance));
        let out = rule
            .relevance(&layer.operator, input, relevance)
            .map_err(|e| failed(branch, &layer.name, e.to_string()))?;

        if let Some(before) = before {
            let entry = AuditEntry {
                branch,
                layer: layer.name.clone(),
                before,
                after: total(&out),
            };
            if entry.drift() > self.config.audit_tolerance * before.abs().max(f64::MIN_POSITIVE) {
                warn!(
                    branch = %branch,
                    layer = %layer.name,
                    before = entry.before,
                    after = entry.after,
                    "relevance not conserved"
                );
            }
            audit.push(entry);
        }
        Ok(out)
    }

    fn fuse(
        &self,
        consumer: BranchId,
        fusion: &FusionTrace<B>,
        relevance: Tensor<B, 4>,
        branches: &[BranchTrace<B>],
        pending: &mut HashMap<BranchId, Tensor<B, 4>>,
    ) -> Result<()> {
        let point = fusion.point;
        let expected = fusion.output_dims;
        let dims = relevance.dims();
        let relevance = if dims == expected {
            relevance
        } else if dims.iter().product::<usize>() == expected.iter().product::<usize>() {
            relevance.reshape(expected)
        } else {
            return Err(failed(
                consumer,
                point,
                format!("relevance {dims:?} for fusion output {expected:?}"),
            ));
        };
        let floor = self.config.renorm_floor;
        let [n, c, h, w] = relevance.dims();
        match &fusion.kind {
            FusionKind::Joint { sources, attention } => {
                let width: usize = sources.iter().map(|(_, w)| w).sum();
                if width != w {
                    return Err(failed(
                        consumer,
                        point,
                        format!("sources span {width} columns of {w}"),
                    ));
                }
                let value = attention_relevance(relevance, attention, floor)
                    .map_err(|e| failed(consumer, point, e.to_string()))?
                    .value;
                let [vn, vc, vh, _] = value.dims();
                let mut offset = 0;
                for (source, width) in sources {
                    let part = value
                        .clone()
                        .slice([0..vn, 0..vc, 0..vh, offset..offset + width]);
                    route(branches, point, pending, *source, part)?;
                    offset += width;
                }
            }
            FusionKind::Parallel { parts } => {
                let width: usize = parts.iter().map(|p| p.width).sum();
                if width != w {
                    return Err(failed(
                        consumer,
                        point,
                        format!("parts span {width} columns of {w}"),
                    ));
                }
                let mut offset = 0;
                for part in parts {
                    let slice = relevance
                        .clone()
                        .slice([0..n, 0..c, 0..h, offset..offset + part.width]);
                    offset += part.width;
                    let operands = attention_relevance(slice, &part.attention, floor)
                        .map_err(|e| failed(part.source, point, e.to_string()))?;
                    let r = match part.operand {
                        Operand::Value => operands.value,
                        Operand::Key => operands.key,
                    };
                    let r = match &part.rows {
                        None => r,
                        Some(rows) => {
                            let [tn, tc, th, tw] = branches
                                .iter()
                                .find(|b| b.id == part.source)
                                .map(|b| b.output.dims())
                                .ok_or_else(|| {
                                    failed(part.source, point, "source branch not recorded")
                                })?;
                            if r.dims() != [tn, tc, rows.len(), tw] || rows.end > th {
                                return Err(failed(
                                    part.source,
                                    point,
                                    format!("relevance {:?} for rows {rows:?}", r.dims()),
                                ));
                            }
                            Tensor::<B, 4>::zeros([tn, tc, th, tw], &r.device())
                                .slice_assign([0..tn, 0..tc, rows.clone(), 0..tw], r)
                        }
                    };
                    route(branches, point, pending, part.source, r)?;
                }
            }
        }
        debug!(point = %point, consumer = %consumer, "fused relevance");
        Ok(())
    }
}
