//! Ordered table of the network's named layers.

use std::fmt;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::operator::{Operator, OperatorKind};
use crate::trace::BranchId;

/// Position of a layer in its [`LayerTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(pub usize);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Part of the network a layer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerGroup {
    /// Residual encoder of an input branch.
    Encoder(BranchId),
    /// Residual stack after a join.
    ResidualStack(BranchId),
    /// Pool closing a residual stack.
    Pool(BranchId),
    /// Classification head.
    Head,
}

impl LayerGroup {
    /// Branch the layer is recorded in.
    pub fn branch(&self) -> BranchId {
        match self {
            LayerGroup::Encoder(branch)
            | LayerGroup::ResidualStack(branch)
            | LayerGroup::Pool(branch) => *branch,
            LayerGroup::Head => BranchId::Head,
        }
    }
}

/// A layer with its dotted name, e.g. `drug.deep.0`.
#[derive(Debug, Clone)]
pub struct NamedLayer<B: Backend> {
    /// Unique dotted name.
    pub name: String,
    /// Group used to pick default rules.
    pub group: LayerGroup,
    /// The operator and its parameters.
    pub operator: Operator<B>,
}

impl<B: Backend> NamedLayer<B> {
    /// Kind of the wrapped operator.
    pub fn kind(&self) -> OperatorKind {
        self.operator.kind()
    }
}

/// Layers in recording order. Rule lists are matched against this order.
#[derive(Debug, Clone)]
pub struct LayerTable<B: Backend> {
    layers: Vec<NamedLayer<B>>,
}

impl<B: Backend> Default for LayerTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> LayerTable<B> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Append a layer and return its id.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        group: LayerGroup,
        operator: Operator<B>,
    ) -> LayerId {
        let id = LayerId(self.layers.len());
        self.layers.push(NamedLayer {
            name: name.into(),
            group,
            operator,
        });
        id
    }

    /// Layer at `id`.
    pub fn get(&self, id: LayerId) -> Option<&NamedLayer<B>> {
        self.layers.get(id.0)
    }

    /// Mutable layer at `id`.
    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut NamedLayer<B>> {
        self.layers.get_mut(id.0)
    }

    /// Id of the layer called `name`.
    pub fn find(&self, name: &str) -> Option<LayerId> {
        self.layers.iter().position(|l| l.name == name).map(LayerId)
    }

    /// Layers in recording order.
    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &NamedLayer<B>)> {
        self.layers.iter().enumerate().map(|(i, l)| (LayerId(i), l))
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.operator.parameter_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{ActivationKind, PoolSpec};
    use burn_ndarray::NdArray;

    #[test]
    fn test_push_assigns_sequential_ids() {
        let mut table = LayerTable::<NdArray>::new();
        let a = table.push(
            "drug.deep.1",
            LayerGroup::Encoder(BranchId::Drug),
            Operator::Activation(ActivationKind::Relu),
        );
        let b = table.push(
            "binary-stack.pool",
            LayerGroup::Pool(BranchId::BinaryStack),
            Operator::Pool(PoolSpec::avg([1, 2])),
        );
        assert_eq!(a, LayerId(0));
        assert_eq!(b, LayerId(1));
        assert_eq!(table.len(), 2);
        assert_eq!(table.find("binary-stack.pool"), Some(b));
        assert_eq!(table.get(b).map(|l| l.group.branch()), Some(BranchId::BinaryStack));
        assert!(table.get(LayerId(2)).is_none());
    }
}
