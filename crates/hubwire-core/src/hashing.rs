//! FNV-1a 32-bit method id derivation.
//!
//! Statically generated clients and dynamically registered servers must agree
//! on method ids without a handshake, so the hash is fixed: FNV-1a over the
//! UTF-8 bytes of the method name, reinterpreted as `i32` for the wire.

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a 32-bit hash of a byte slice.
pub const fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Wire method id of a method name.
pub const fn method_id(name: &str) -> i32 {
    fnv1a32(name.as_bytes()) as i32
}
