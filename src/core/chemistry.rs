/// Element symbols indexed by atomic number - 1 (H through Xe).
const SYMBOLS: [&str; 54] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", //
    "Na", "Mg", "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca", //
    "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", //
    "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", //
    "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In", "Sn", //
    "Sb", "Te", "I", "Xe",
];

/// Resolves a species token: either an element symbol (case-insensitive) or a bare
/// atomic number, as found in coarse-grained ellipsoid files.
pub fn atomic_number(token: &str) -> Option<u32> {
    if let Ok(z) = token.parse::<u32>() {
        return Some(z);
    }
    SYMBOLS
        .iter()
        .position(|s| s.eq_ignore_ascii_case(token))
        .map(|i| i as u32 + 1)
}

pub fn symbol(atomic_number: u32) -> Option<&'static str> {
    let idx = (atomic_number as usize).checked_sub(1)?;
    SYMBOLS.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_round_trip() {
        assert_eq!(atomic_number("C"), Some(6));
        assert_eq!(atomic_number("mg"), Some(12));
        assert_eq!(atomic_number("17"), Some(17));
        assert_eq!(atomic_number("Qq"), None);
        assert_eq!(symbol(8), Some("O"));
        assert_eq!(symbol(0), None);
        assert_eq!(symbol(200), None);
    }
}
