use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use nalgebra::{DVector, Vector3};
use serde::Serialize;

use crate::core::autodiff::Tape;
use crate::core::domain::Configuration;
use crate::core::fingerprint::Fingerprint;
use crate::engine::config::{BackendKind, CalculatorConfig};
use crate::engine::descriptor::{Descriptor, TrackedDescriptor, SINGLE_FRAME};
use crate::engine::forces::{self, FiniteDifference, Forces};
use crate::engine::model::EnergyModel;
use crate::error::CalcError;

// --- Properties & Results ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Energy,
    Forces,
    Stress,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Energy => "energy",
            Property::Forces => "forces",
            Property::Stress => "stress",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Property {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "energy" => Ok(Property::Energy),
            "forces" => Ok(Property::Forces),
            "stress" => Ok(Property::Stress),
            _ => Err(CalcError::UnsupportedProperty(s.to_string())),
        }
    }
}

/// The result sink read by the host: energy (eV) and forces (eV/Å).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Results {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forces: Option<Forces>,
}

/// A borrowed entry of [`Results`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue<'a> {
    Energy(f64),
    Forces(&'a [Vector3<f64>]),
}

impl Results {
    pub fn contains(&self, property: Property) -> bool {
        match property {
            Property::Energy => self.energy.is_some(),
            Property::Forces => self.forces.is_some(),
            Property::Stress => false,
        }
    }

    pub fn get(&self, property: Property) -> Option<PropertyValue<'_>> {
        match property {
            Property::Energy => self.energy.map(PropertyValue::Energy),
            Property::Forces => self.forces.as_deref().map(PropertyValue::Forces),
            Property::Stress => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.energy.is_none() && self.forces.is_none()
    }
}

// --- Backend ---

/// The descriptor representation, tagged by capability.
#[derive(Clone)]
pub enum Backend {
    Numeric(Arc<dyn Descriptor>),
    Differentiable(Arc<dyn TrackedDescriptor>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Numeric(_) => BackendKind::Numeric,
            Backend::Differentiable(_) => BackendKind::Differentiable,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Backend::Numeric(d) => d.name(),
            Backend::Differentiable(d) => d.name(),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.name())
    }
}

// --- Calculator ---

/// Energy/force calculator over a descriptor backend and an energy model.
///
/// Each call to [`Calculator::calculate`]:
/// 1. rejects properties outside [`Calculator::IMPLEMENTED_PROPERTIES`];
/// 2. rejects forces when the configured backend has no way to produce them;
/// 3. returns the stored results untouched if caching is on, the configuration's
///    [`Fingerprint`] equals the last one and every requested property is stored;
/// 4. otherwise evaluates descriptor, energy and (if requested) forces and replaces the
///    stored results and fingerprint together.
///
/// A failed call leaves the previous results and fingerprint as they were. The only state
/// kept between calls is that pair; `calculate` takes `&mut self`, so one instance serves
/// one caller at a time.
#[derive(Debug)]
pub struct Calculator {
    backend: Backend,
    model: EnergyModel,
    config: CalculatorConfig,
    fingerprint: Option<Fingerprint>,
    results: Results,
}

impl Calculator {
    pub const IMPLEMENTED_PROPERTIES: &'static [Property] = &[Property::Energy, Property::Forces];

    pub fn new(backend: Backend, model: EnergyModel, config: CalculatorConfig) -> Result<Self, CalcError> {
        config.validate()?;
        debug!(
            "Calculator: backend {:?}, model '{}', finite differences {}, cache {}",
            backend,
            model.name(),
            config.finite_difference,
            config.cache
        );
        Ok(Self {
            backend,
            model,
            config,
            fingerprint: None,
            results: Results::default(),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn model(&self) -> &EnergyModel {
        &self.model
    }

    pub fn config(&self) -> &CalculatorConfig {
        &self.config
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    /// Forgets the cached fingerprint and results.
    pub fn reset(&mut self) {
        self.fingerprint = None;
        self.results = Results::default();
    }

    /// Whether a forces request would pass the capability check.
    pub fn supports_forces(&self) -> bool {
        self.force_capability().is_ok()
    }

    pub fn calculate(
        &mut self,
        config: &Configuration,
        properties: &[Property],
    ) -> Result<&Results, CalcError> {
        // Validating
        for property in properties {
            if !Self::IMPLEMENTED_PROPERTIES.contains(property) {
                return Err(CalcError::UnsupportedProperty(property.to_string()));
            }
        }
        let wants_forces = properties.contains(&Property::Forces);
        if wants_forces {
            self.force_capability()?;
        }

        // CacheHit
        let fingerprint = Fingerprint::of(config);
        if self.config.cache
            && self.fingerprint.as_ref() == Some(&fingerprint)
            && properties.iter().all(|p| self.results.contains(*p))
        {
            debug!("Cache hit for {} particles", config.len());
            return Ok(&self.results);
        }

        // Computing
        debug!(
            "Evaluating {} particles ({:?}, forces={})",
            config.len(),
            self.backend.kind(),
            wants_forces
        );
        let results = self.compute(config, wants_forces)?;
        self.results = results;
        self.fingerprint = Some(fingerprint);
        Ok(&self.results)
    }

    /// [`Calculator::calculate`] with property names as the host spells them.
    pub fn calculate_named(
        &mut self,
        config: &Configuration,
        names: &[&str],
    ) -> Result<&Results, CalcError> {
        let properties = names
            .iter()
            .map(|n| n.parse::<Property>())
            .collect::<Result<Vec<_>, _>>()?;
        self.calculate(config, &properties)
    }

    pub fn energy(&mut self, config: &Configuration) -> Result<f64, CalcError> {
        let results = self.calculate(config, &[Property::Energy])?;
        results
            .energy
            .ok_or_else(|| CalcError::computation("calculator", anyhow!("energy was not stored")))
    }

    pub fn forces(&mut self, config: &Configuration) -> Result<Forces, CalcError> {
        let results = self.calculate(config, &[Property::Energy, Property::Forces])?;
        results
            .forces
            .clone()
            .ok_or_else(|| CalcError::computation("calculator", anyhow!("forces were not stored")))
    }

    fn force_capability(&self) -> Result<(), CalcError> {
        match &self.backend {
            Backend::Numeric(_) if self.config.finite_difference => Ok(()),
            Backend::Numeric(d) => Err(CalcError::CapabilityMismatch(format!(
                "forces requested but backend '{}' has no differentiable path and finite differences are disabled",
                d.name()
            ))),
            Backend::Differentiable(_) if self.model.is_differentiable() => Ok(()),
            Backend::Differentiable(_) => Err(CalcError::CapabilityMismatch(format!(
                "forces requested but energy model '{}' does not support gradient tracking",
                self.model.name()
            ))),
        }
    }

    fn compute(&self, config: &Configuration, wants_forces: bool) -> Result<Results, CalcError> {
        config.validate_layout(SINGLE_FRAME)?;

        let (energy, forces) = match &self.backend {
            Backend::Numeric(descriptor) => {
                let energy_of = |c: &Configuration| -> Result<f64, CalcError> {
                    let features = descriptor
                        .describe(c)
                        .map_err(|e| CalcError::computation("descriptor", e))?;
                    self.model.predict(&features)
                };
                let energy = energy_of(config)?;
                let forces = if wants_forces {
                    let fd = FiniteDifference::new(self.config.fd_step)?.parallel(self.config.parallel_fd);
                    Some(fd.estimate(config, energy_of)?)
                } else {
                    None
                };
                (energy, forces)
            }
            Backend::Differentiable(descriptor) => {
                if wants_forces {
                    let (energy, forces) = forces::reverse_mode(descriptor.as_ref(), &self.model, config)?;
                    (energy, Some(forces))
                } else {
                    (self.tracked_energy(descriptor.as_ref(), config)?, None)
                }
            }
        };

        let energy = energy * self.config.energy_scale;
        let forces = forces.map(|f| {
            f.into_iter()
                .map(|v| v * self.config.force_scale)
                .collect::<Forces>()
        });
        if let Some(f) = &forces {
            if f.iter().any(|v| v.iter().any(|c| !c.is_finite())) {
                return Err(CalcError::computation(
                    "force estimation",
                    anyhow!("forces contain non-finite components"),
                ));
            }
        }

        Ok(Results {
            energy: Some(energy),
            forces,
        })
    }

    /// Energy on the gradient-tracking backend without a backward pass. The model only
    /// needs to be differentiable when forces are requested.
    fn tracked_energy(&self, descriptor: &dyn TrackedDescriptor, config: &Configuration) -> Result<f64, CalcError> {
        let tape = Tape::new();
        let positions = forces::leaves(&tape, config);
        let features = descriptor
            .describe_tracked(&tape, config, &positions)
            .map_err(|e| CalcError::computation("descriptor", e))?;
        if self.model.is_differentiable() {
            Ok(self.model.predict_tracked(&tape, &features)?.value())
        } else {
            let values = DVector::from_iterator(features.len(), features.iter().map(|f| f.value()));
            self.model.predict(&values)
        }
    }
}
