use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Construct a deterministic RNG from a fixed seed.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// A permutation of `0..len` drawn from `rng`.
pub fn permutation(len: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    indices
}
