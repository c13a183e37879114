/// Reference networks for the domain adaptation trainers
///
/// Each trainable network owns its own `VarMap`, so the parameters of two
/// networks never overlap and an optimizer built over one network's vars
/// leaves every other network untouched.
use candle_core::{DType, Device, Result, Var};
use candle_nn::{VarBuilder, VarMap};
use std::ops::Deref;

pub mod man_moe;
pub mod mstln;
pub mod single;

pub use man_moe::{ManMoeNets, PrivateExtractor};
pub use mstln::MstlnNet;
pub use single::{AlignmentNet, DiscrepancyNet, MultiSourceNet, PlainClassifier};

/// A module together with the variables it was built from
pub struct Network<M> {
    name: String,
    module: M,
    varmap: VarMap,
}

impl<M> Network<M> {
    /// Build a module with fresh F32 variables on `device`
    pub fn build<F>(name: &str, device: &Device, init: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<M>,
    {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let module = init(vb)?;

        Ok(Self {
            name: name.to_string(),
            module,
            varmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.vars()
            .iter()
            .map(|v| crate::utils::count_parameters(v.as_tensor()))
            .sum()
    }
}

impl<M> Deref for Network<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.module
    }
}

/// Model-name groups of the single-source trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelGroup {
    /// Mode 0: supervised classifier only
    Plain,
    /// Mode 1: classification plus one adaptation term. The DAN/DANN/CDAN
    /// names all train the MMD-aligned `AlignmentNet`
    Adversarial,
    /// Mode 2: classification plus alignment and discrepancy terms
    Discrepancy,
    /// Mode 3: multi-source capable network run with a single source
    MultiSource,
}

impl ModelGroup {
    pub fn from_model_name(name: &str) -> crate::Result<Self> {
        match name {
            "CNN" | "WDCNN" => Ok(Self::Plain),
            "DAN" | "DANN" | "CDAN" | "ACDANN" => Ok(Self::Adversarial),
            "ADACL" | "MFSAN" => Ok(Self::Discrepancy),
            "MADN" | "MSSA" => Ok(Self::MultiSource),
            other => Err(crate::DaError::Configuration(format!(
                "model type not implemented: {}",
                other
            ))),
        }
    }

    pub fn training_mode(&self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Adversarial => 1,
            Self::Discrepancy => 2,
            Self::MultiSource => 3,
        }
    }
}

/// The network of a single-source run, tagged by its training mode
pub enum SingleSourceModel {
    Plain(Network<PlainClassifier>),
    Alignment(Network<AlignmentNet>),
    Discrepancy(Network<DiscrepancyNet>),
    MultiSource(Network<MultiSourceNet>),
}

impl SingleSourceModel {
    pub fn build(group: ModelGroup, num_classes: usize, device: &Device) -> Result<Self> {
        // One input channel, one declared source
        Ok(match group {
            ModelGroup::Plain => Self::Plain(Network::build("classifier", device, |vb| {
                PlainClassifier::new(1, num_classes, vb)
            })?),
            ModelGroup::Adversarial => Self::Alignment(Network::build("alignment", device, |vb| {
                AlignmentNet::new(1, num_classes, vb)
            })?),
            ModelGroup::Discrepancy => Self::Discrepancy(Network::build("discrepancy", device, |vb| {
                DiscrepancyNet::new(1, num_classes, 1, vb)
            })?),
            ModelGroup::MultiSource => Self::MultiSource(Network::build("multi_source", device, |vb| {
                MultiSourceNet::new(1, num_classes, vb)
            })?),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Plain(net) => net.name(),
            Self::Alignment(net) => net.name(),
            Self::Discrepancy(net) => net.name(),
            Self::MultiSource(net) => net.name(),
        }
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap().all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        match self {
            Self::Plain(net) => net.varmap(),
            Self::Alignment(net) => net.varmap(),
            Self::Discrepancy(net) => net.varmap(),
            Self::MultiSource(net) => net.varmap(),
        }
    }
}
