//! SHA-512 / SHA-384 block compression and streaming sink (§2 item 1).
//! Direct port of `sshsh512.c`: an 80-round message schedule, an 8-way
//! unrolled round loop sharing one round function, and a 128-byte block
//! buffer that the two variants differ on only by initial state and output
//! truncation.

const ROUND_CONSTANTS: [u64; 80] = [
    0x428a2f98d728ae22, 0x7137449123ef65cd, 0xb5c0fbcfec4d3b2f, 0xe9b5dba58189dbbc,
    0x3956c25bf348b538, 0x59f111f1b605d019, 0x923f82a4af194f9b, 0xab1c5ed5da6d8118,
    0xd807aa98a3030242, 0x12835b0145706fbe, 0x243185be4ee4b28c, 0x550c7dc3d5ffb4e2,
    0x72be5d74f27b896f, 0x80deb1fe3b1696b1, 0x9bdc06a725c71235, 0xc19bf174cf692694,
    0xe49b69c19ef14ad2, 0xefbe4786384f25e3, 0x0fc19dc68b8cd5b5, 0x240ca1cc77ac9c65,
    0x2de92c6f592b0275, 0x4a7484aa6ea6e483, 0x5cb0a9dcbd41fbd4, 0x76f988da831153b5,
    0x983e5152ee66dfab, 0xa831c66d2db43210, 0xb00327c898fb213f, 0xbf597fc7beef0ee4,
    0xc6e00bf33da88fc2, 0xd5a79147930aa725, 0x06ca6351e003826f, 0x142929670a0e6e70,
    0x27b70a8546d22ffc, 0x2e1b21385c26c926, 0x4d2c6dfc5ac42aed, 0x53380d139d95b3df,
    0x650a73548baf63de, 0x766a0abb3c77b2a8, 0x81c2c92e47edaee6, 0x92722c851482353b,
    0xa2bfe8a14cf10364, 0xa81a664bbc423001, 0xc24b8b70d0f89791, 0xc76c51a30654be30,
    0xd192e819d6ef5218, 0xd69906245565a910, 0xf40e35855771202a, 0x106aa07032bbd1b8,
    0x19a4c116b8d2d0c8, 0x1e376c085141ab53, 0x2748774cdf8eeb99, 0x34b0bcb5e19b48a8,
    0x391c0cb3c5c95a63, 0x4ed8aa4ae3418acb, 0x5b9cca4f7763e373, 0x682e6ff3d6b2b8a3,
    0x748f82ee5defb2fc, 0x78a5636f43172f60, 0x84c87814a1f0ab72, 0x8cc702081a6439ec,
    0x90befffa23631e28, 0xa4506cebde82bde9, 0xbef9a3f7b2c67915, 0xc67178f2e372532b,
    0xca273eceea26619c, 0xd186b8c721c0c207, 0xeada7dd6cde0eb1e, 0xf57d4f7fee6ed178,
    0x06f067aa72176fba, 0x0a637dc5a2c898a6, 0x113f9804bef90dae, 0x1b710b35131c471b,
    0x28db77f523047d84, 0x32caab7b40c72493, 0x3c9ebe0a15c9bebc, 0x431d67c49c100d4c,
    0x4cc5d4becb3e42b6, 0x597f299cfc657e2a, 0x5fcb6fab3ad6faec, 0x6c44198c4a475817,
];

const SHA512_INITIAL_STATE: [u64; 8] = [
    0x6a09e667f3bcc908, 0xbb67ae8584caa73b, 0x3c6ef372fe94f82b, 0xa54ff53a5f1d36f1,
    0x510e527fade682d1, 0x9b05688c2b3e6c1f, 0x1f83d9abfb41bd6b, 0x5be0cd19137e2179,
];

const SHA384_INITIAL_STATE: [u64; 8] = [
    0xcbbb9d5dc1059ed8, 0x629a292a367cd507, 0x9159015a3070dd17, 0x152fecd8f70e5939,
    0x67332667ffc00b31, 0x8eb44a8768581511, 0xdb0c2e0d64f98fa7, 0x47b5481dbefa4fa4,
];

#[inline]
fn ror(x: u64, y: u32) -> u64 {
    x.rotate_right(y)
}

#[inline]
fn ch(ctrl: u64, if1: u64, if0: u64) -> u64 {
    if0 ^ (ctrl & (if1 ^ if0))
}

#[inline]
fn maj(x: u64, y: u64, z: u64) -> u64 {
    (x & y) | (z & (x | y))
}

#[inline]
fn big_sigma_0(x: u64) -> u64 {
    ror(x, 28) ^ ror(x, 34) ^ ror(x, 39)
}

#[inline]
fn big_sigma_1(x: u64) -> u64 {
    ror(x, 14) ^ ror(x, 18) ^ ror(x, 41)
}

#[inline]
fn small_sigma_0(x: u64) -> u64 {
    ror(x, 1) ^ ror(x, 8) ^ (x >> 7)
}

#[inline]
fn small_sigma_1(x: u64) -> u64 {
    ror(x, 19) ^ ror(x, 61) ^ (x >> 6)
}

#[allow(clippy::too_many_arguments)]
fn round(round_index: usize, schedule: &[u64; 80], a: u64, b: u64, c: u64, d: &mut u64, e: u64, f: u64, g: u64, h: &mut u64) {
    let t1 = h
        .wrapping_add(big_sigma_1(e))
        .wrapping_add(ch(e, f, g))
        .wrapping_add(ROUND_CONSTANTS[round_index])
        .wrapping_add(schedule[round_index]);
    let t2 = big_sigma_0(a).wrapping_add(maj(a, b, c));
    *d = d.wrapping_add(t1);
    *h = t1.wrapping_add(t2);
}

fn compress_block(core: &mut [u64; 8], block: &[u8; 128]) {
    let mut w = [0u64; 80];
    for (t, word) in w.iter_mut().take(16).enumerate() {
        *word = u64::from_be_bytes(block[8 * t..8 * t + 8].try_into().unwrap());
    }
    for t in 16..80 {
        w[t] = w[t - 16]
            .wrapping_add(w[t - 7])
            .wrapping_add(small_sigma_0(w[t - 15]))
            .wrapping_add(small_sigma_1(w[t - 2]));
    }

    let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = *core;

    let mut t = 0;
    while t < 80 {
        round(t, &w, a, b, c, &mut d, e, f, g, &mut h);
        round(t + 1, &w, h, a, b, &mut c, d, e, f, &mut g);
        round(t + 2, &w, g, h, a, &mut b, c, d, e, &mut f);
        round(t + 3, &w, f, g, h, &mut a, b, c, d, &mut e);
        round(t + 4, &w, e, f, g, &mut h, a, b, c, &mut d);
        round(t + 5, &w, d, e, f, &mut g, h, a, b, &mut c);
        round(t + 6, &w, c, d, e, &mut f, g, h, a, &mut b);
        round(t + 7, &w, b, c, d, &mut e, f, g, h, &mut a);
        t += 8;
    }

    core[0] = core[0].wrapping_add(a);
    core[1] = core[1].wrapping_add(b);
    core[2] = core[2].wrapping_add(c);
    core[3] = core[3].wrapping_add(d);
    core[4] = core[4].wrapping_add(e);
    core[5] = core[5].wrapping_add(f);
    core[6] = core[6].wrapping_add(g);
    core[7] = core[7].wrapping_add(h);
}

/// Streaming block buffer shared by SHA-512 and SHA-384, per
/// `struct sha512_block`.
struct Sha512Block {
    core: [u64; 8],
    block: [u8; 128],
    used: usize,
    lenhi: u64,
    lenlo: u64,
}

impl Sha512Block {
    fn new(initial: [u64; 8]) -> Self {
        Sha512Block {
            core: initial,
            block: [0u8; 128],
            used: 0,
            lenhi: 0,
            lenlo: 0,
        }
    }

    fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let blk_left = 128 - self.used;
            let chunk = data.len().min(blk_left);
            self.block[self.used..self.used + chunk].copy_from_slice(&data[..chunk]);
            data = &data[chunk..];
            self.used += chunk;

            let chunk_bits = (chunk as u64) << 3;
            let (new_lenlo, overflowed) = self.lenlo.overflowing_add(chunk_bits);
            self.lenlo = new_lenlo;
            if overflowed {
                self.lenhi = self.lenhi.wrapping_add(1);
            }

            if self.used == 128 {
                let block = self.block;
                compress_block(&mut self.core, &block);
                self.used = 0;
            }
        }
    }

    fn pad_and_finalize(mut self) -> [u64; 8] {
        let final_lenhi = self.lenhi;
        let final_lenlo = self.lenlo;
        let pad = 111usize.wrapping_sub(self.used) & 127;

        let mut tail = Vec::with_capacity(1 + pad + 16);
        tail.push(0x80);
        tail.resize(1 + pad, 0);
        tail.extend_from_slice(&final_lenhi.to_be_bytes());
        tail.extend_from_slice(&final_lenlo.to_be_bytes());
        self.write(&tail);
        debug_assert_eq!(self.used, 0, "padding should land exactly on a block boundary");
        self.core
    }
}

/// A streaming SHA-512 hasher.
pub struct Sha512 {
    block: Sha512Block,
}

impl Sha512 {
    pub fn new() -> Self {
        Sha512 {
            block: Sha512Block::new(SHA512_INITIAL_STATE),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.block.write(data);
    }

    pub fn finalize(self) -> [u8; 64] {
        let core = self.block.pad_and_finalize();
        let mut out = [0u8; 64];
        for (i, word) in core.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

impl Default for Sha512 {
    fn default() -> Self {
        Self::new()
    }
}

/// A streaming SHA-384 hasher (same compression function, different initial
/// state and a truncated 48-byte digest).
pub struct Sha384 {
    block: Sha512Block,
}

impl Sha384 {
    pub fn new() -> Self {
        Sha384 {
            block: Sha512Block::new(SHA384_INITIAL_STATE),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.block.write(data);
    }

    pub fn finalize(self) -> [u8; 48] {
        let core = self.block.pad_and_finalize();
        let mut out = [0u8; 48];
        for (i, word) in core.iter().take(6).enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

impl Default for Sha384 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn sha512_empty_string() {
        let h = Sha512::new().finalize();
        assert_eq!(
            hex(&h),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3"
        );
    }

    #[test]
    fn sha512_abc() {
        let mut h = Sha512::new();
        h.update(b"abc");
        assert_eq!(
            hex(&h.finalize()),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49"
        );
    }

    #[test]
    fn sha512_multi_block_input() {
        let mut h = Sha512::new();
        // More than one 128-byte block, and not aligned on a block boundary.
        h.update(&[0x61u8; 200]);
        let digest = h.finalize();
        assert_eq!(digest.len(), 64);
        // Cross-check against feeding the same bytes in one shot.
        let mut h2 = Sha512::new();
        h2.update(&[0x61u8; 200]);
        assert_eq!(digest, h2.finalize());
    }

    #[test]
    fn sha384_abc() {
        let mut h = Sha384::new();
        h.update(b"abc");
        assert_eq!(
            hex(&h.finalize()),
            "cb00753f45a35e8bb5a03d699ac65007272c32ab0eded1631a8b605a43ff5bed8086072ba1e7cc2358baeca134c825a"
        );
    }
}
