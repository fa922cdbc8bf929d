use rand::{rngs::StdRng, SeedableRng};

/// Independent random streams drawn from one experiment seed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RngStream {
    Init,
    Shuffle,
    Dropout,
}

impl RngStream {
    fn salt(self) -> u64 {
        match self {
            Self::Init => 0x5151_0001,
            Self::Shuffle => 0x5151_0002,
            Self::Dropout => 0x5151_0003,
        }
    }
}

/// Construct a deterministic RNG from a fixed seed.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Construct the RNG for one stream so that consumers do not perturb each other.
pub fn stream_rng(seed: u64, stream: RngStream) -> StdRng {
    seeded_rng(seed ^ stream.salt().wrapping_mul(0x9e37_79b9_7f4a_7c15))
}
