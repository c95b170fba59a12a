//! Seed/key derivation for UDS security access (0x27)
//!
//! The algorithm is selected by the security level requested from the ECU.
//! Every algorithm is a pure function of the 4-byte seed and, for the block
//! mix, a 4-word parameter vector taken from configuration.

/// Level unlocked with the simple shift/xor mix
pub const SIMPLE_MIX_LEVEL: u8 = 0x01;

/// Level unlocked with the 64-round block mix (programming/boot access)
pub const BLOCK_MIX_LEVEL: u8 = 0x11;

/// Default block-mix parameter vector
pub const DEFAULT_ALGORITHM_PARAMS: [u32; 4] = [0x4FE8_7269, 0x6BC3_61D8, 0x9B12_7D51, 0x5BA4_1903];

const BLOCK_MIX_ROUNDS: usize = 64;
const BLOCK_MIX_DELTA: u32 = 0x8F75_0A1D;

/// Key derivation algorithm, selected by security level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityAlgorithm {
    /// `k = (((s >> 4) ^ s) << 3) ^ s`
    SimpleMix,
    /// Byte-swapped seed run through 64 rounds of a two-accumulator mix
    BlockMix,
    /// Seed is returned unchanged
    Identity,
}

impl SecurityAlgorithm {
    pub fn for_level(level: u8) -> Self {
        match level {
            SIMPLE_MIX_LEVEL => Self::SimpleMix,
            BLOCK_MIX_LEVEL => Self::BlockMix,
            _ => Self::Identity,
        }
    }

    pub fn derive(self, seed: [u8; 4], params: &[u32; 4]) -> [u8; 4] {
        let s = u32::from_be_bytes(seed);
        let key = match self {
            Self::SimpleMix => simple_mix(s),
            Self::BlockMix => block_mix(s, params),
            Self::Identity => s,
        };
        key.to_be_bytes()
    }
}

/// Compute the key answering `seed` at security `level`
pub fn derive_key(level: u8, seed: [u8; 4], params: &[u32; 4]) -> [u8; 4] {
    SecurityAlgorithm::for_level(level).derive(seed, params)
}

fn simple_mix(s: u32) -> u32 {
    (((s >> 4) ^ s) << 3) ^ s
}

fn block_mix(s: u32, params: &[u32; 4]) -> u32 {
    let mut y = s.swap_bytes();
    let mut z = 0u32;
    let mut sum = 0u32;

    for _ in 0..BLOCK_MIX_ROUNDS {
        y = y.wrapping_add(
            (((z << 4) ^ (z >> 5)).wrapping_add(z))
                ^ sum.wrapping_add(params[(sum & 3) as usize]),
        );
        sum = sum.wrapping_add(BLOCK_MIX_DELTA);
        z = z.wrapping_add(
            (((y << 4) ^ (y >> 5)).wrapping_add(y))
                ^ sum.wrapping_add(params[((sum >> 11) & 3) as usize]),
        );
    }

    z.swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(level: u8, seed: u32) -> u32 {
        u32::from_be_bytes(derive_key(level, seed.to_be_bytes(), &DEFAULT_ALGORITHM_PARAMS))
    }

    #[test]
    fn test_simple_mix_known_keys() {
        assert_eq!(key(SIMPLE_MIX_LEVEL, 0x1234_5678), 0x8A8C_CE80);
        assert_eq!(key(SIMPLE_MIX_LEVEL, 0x0000_0001), 0x0000_0009);
        assert_eq!(key(SIMPLE_MIX_LEVEL, 0xDEAD_BEEF), 0x4496_96E7);
    }

    #[test]
    fn test_block_mix_known_keys() {
        assert_eq!(key(BLOCK_MIX_LEVEL, 0x1234_5678), 0x680F_2EDE);
        assert_eq!(key(BLOCK_MIX_LEVEL, 0x0000_0001), 0x75F4_414D);
        assert_eq!(key(BLOCK_MIX_LEVEL, 0xDEAD_BEEF), 0x2F33_7FB1);
    }

    #[test]
    fn test_block_mix_uses_params() {
        let key = derive_key(BLOCK_MIX_LEVEL, [0x12, 0x34, 0x56, 0x78], &[1, 2, 3, 4]);
        assert_eq!(key, [0x34, 0xBA, 0x52, 0x31]);
    }

    #[test]
    fn test_other_levels_pass_seed_through() {
        assert_eq!(
            SecurityAlgorithm::for_level(0x03),
            SecurityAlgorithm::Identity
        );
        assert_eq!(key(0x03, 0x1234_5678), 0x1234_5678);
        assert_eq!(key(0x05, 0xDEAD_BEEF), 0xDEAD_BEEF);
    }

    #[test]
    fn test_single_bit_flip_changes_key() {
        assert_eq!(key(SIMPLE_MIX_LEVEL, 0x1234_5679), 0x8A8C_CE89);
        assert_eq!(key(BLOCK_MIX_LEVEL, 0x1234_5679), 0x4015_81E3);
        assert_ne!(
            key(BLOCK_MIX_LEVEL, 0x1234_5678),
            key(BLOCK_MIX_LEVEL, 0x1234_5679)
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let seed = [0xA5, 0x5A, 0x0F, 0xF0];
        for level in [SIMPLE_MIX_LEVEL, BLOCK_MIX_LEVEL] {
            assert_eq!(
                derive_key(level, seed, &DEFAULT_ALGORITHM_PARAMS),
                derive_key(level, seed, &DEFAULT_ALGORITHM_PARAMS)
            );
        }
    }
}
