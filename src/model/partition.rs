use crate::error::{Result, TrainError};
use burn::module::{Module, ModuleVisitor, Param, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Owning subsystem of a parameter; decides which optimizer may update it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Pretrained weights no optimizer touches.
    Frozen,
    Generator,
    Discriminator,
}

/// Collects the ids of every float parameter in a module tree.
struct ParamCollector<B: Backend> {
    ids: Vec<ParamId>,
    _phantom: PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.ids.push(param.id);
    }
}

/// Ids of all float parameters of `module`.
pub fn param_ids<B: Backend, M: Module<B>>(module: &M) -> Vec<ParamId> {
    let mut collector = ParamCollector::<B> {
        ids: Vec::new(),
        _phantom: PhantomData,
    };
    module.visit(&mut collector);
    collector.ids
}

/// Disjoint assignment of parameters to groups, built by tagging whole
/// subsystems at construction time.
#[derive(Debug, Clone, Default)]
pub struct ParamPartition {
    groups: HashMap<ParamId, ParamGroup>,
}

impl ParamPartition {
    /// Tag every parameter of `module` with `group`.
    pub fn tag<B: Backend, M: Module<B>>(&mut self, module: &M, group: ParamGroup) -> Result<()> {
        self.tag_ids(param_ids::<B, M>(module), group)
    }

    /// Fails if any id is already tagged, keeping the partition disjoint.
    pub fn tag_ids(&mut self, ids: impl IntoIterator<Item = ParamId>, group: ParamGroup) -> Result<()> {
        for id in ids {
            if let Some(existing) = self.groups.insert(id, group) {
                return Err(TrainError::Config(format!(
                    "parameter {id:?} tagged as both {existing:?} and {group:?}"
                )));
            }
        }
        Ok(())
    }

    /// Fails unless every id in `all` carries exactly one tag and no tag
    /// refers to a parameter outside `all`.
    pub fn validate_covers(&self, all: &[ParamId]) -> Result<()> {
        if let Some(missing) = all.iter().find(|id| !self.groups.contains_key(id)) {
            return Err(TrainError::Config(format!("parameter {missing:?} has no owner")));
        }
        if self.groups.len() != all.len() {
            return Err(TrainError::Config(format!(
                "partition tags {} parameters but the model has {}",
                self.groups.len(),
                all.len()
            )));
        }
        Ok(())
    }

    pub fn group_of(&self, id: &ParamId) -> Option<ParamGroup> {
        self.groups.get(id).copied()
    }

    pub fn ids(&self, group: ParamGroup) -> impl Iterator<Item = &ParamId> + '_ {
        self.groups
            .iter()
            .filter(move |(_, g)| **g == group)
            .map(|(id, _)| id)
    }

    pub fn count(&self, group: ParamGroup) -> usize {
        self.ids(group).count()
    }

    /// Move the gradients of `module`'s parameters tagged `group` out of
    /// `source`. Gradients of parameters in other groups stay behind.
    pub fn extract_grads<B: AutodiffBackend, M: Module<B>>(
        &self,
        module: &M,
        group: ParamGroup,
        source: &mut GradientsParams,
    ) -> GroupGrads {
        let mut extractor = GradsExtractor::<B> {
            partition: self,
            group,
            source,
            target: GradientsParams::new(),
            squared_norm: 0.0,
            _phantom: PhantomData,
        };
        module.visit(&mut extractor);
        GroupGrads {
            grads: extractor.target,
            squared_norm: extractor.squared_norm,
        }
    }
}

/// Gradients routed to one optimizer, with their summed squared L2 norm.
pub struct GroupGrads {
    pub grads: GradientsParams,
    pub squared_norm: f64,
}

impl GroupGrads {
    /// Multiply every gradient of `module` held here by `scale`.
    pub fn scale<B: AutodiffBackend, M: Module<B>>(&mut self, module: &M, scale: f64) {
        let mut scaler = GradsScaler::<B> {
            grads: &mut self.grads,
            scale,
            _phantom: PhantomData,
        };
        module.visit(&mut scaler);
    }
}

/// Factor that brings a gradient set with `squared_norm` down to a global
/// L2 norm of `clip_norm`. `None` when no clipping is needed or it is disabled.
pub fn clip_factor(squared_norm: f64, clip_norm: f64) -> Option<f64> {
    let norm = squared_norm.sqrt();
    (clip_norm > 0.0 && norm.is_finite() && norm > clip_norm).then(|| clip_norm / norm)
}

struct GradsExtractor<'a, B: AutodiffBackend> {
    partition: &'a ParamPartition,
    group: ParamGroup,
    source: &'a mut GradientsParams,
    target: GradientsParams,
    squared_norm: f64,
    _phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradsExtractor<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.partition.group_of(&param.id) != Some(self.group) {
            return;
        }
        if let Some(grad) = self.source.remove::<B::InnerBackend, D>(param.id) {
            self.squared_norm += grad
                .clone()
                .mul(grad.clone())
                .sum()
                .into_scalar()
                .elem::<f64>();
            self.target.register::<B::InnerBackend, D>(param.id, grad);
        }
    }
}

struct GradsScaler<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scale: f64,
    _phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradsScaler<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads
                .register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.scale));
        }
    }
}
