use crate::core::domain::Configuration;

/// Strict identity of a configuration: the species sequence plus the raw little-endian
/// bytes of every coordinate.
///
/// Two fingerprints are equal only if the positions are bit-identical. There is no
/// tolerance: any perturbation, however small, produces a different fingerprint. Note
/// that this also distinguishes `0.0` from `-0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    species: Vec<u32>,
    position_bytes: Vec<u8>,
}

impl Fingerprint {
    pub fn of(config: &Configuration) -> Self {
        let mut position_bytes = Vec::with_capacity(config.positions.len() * 3 * 8);
        for p in &config.positions {
            for c in p.coords.iter() {
                position_bytes.extend_from_slice(&c.to_le_bytes());
            }
        }
        Self {
            species: config.species.clone(),
            position_bytes,
        }
    }

    pub fn species(&self) -> &[u32] {
        &self.species
    }

    pub fn position_bytes(&self) -> &[u8] {
        &self.position_bytes
    }
}
