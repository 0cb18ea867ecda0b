//! Server-assigned session identifiers.

use courier_rs_config::{IdGeneration, SessionConfig};
use rand::Rng;
use rand::seq::IndexedRandom;
use uuid::Uuid;

const CONSONANTS: &[u8] = b"bcdfghjklmnpqrstvwxz";
const VOWELS: &[u8] = b"aeiouy";

/// Pronounceable name alternating consonants and vowels.
pub fn random_name(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|idx| {
            let pool = if idx % 2 == 0 { CONSONANTS } else { VOWELS };
            pool.choose(&mut rng).copied().map(char::from).unwrap_or('x')
        })
        .collect()
}

/// Generate an id not rejected by `taken`.
pub(crate) fn generate(config: &SessionConfig, taken: impl Fn(&str) -> bool) -> String {
    match config.id_generation {
        IdGeneration::Uuid => Uuid::new_v4().to_string(),
        IdGeneration::Randomstring => loop {
            let id = random_name(config.id_size);
            if !taken(&id) {
                break id;
            }
        },
    }
}

/// Random suffix for node identifiers.
pub(crate) fn node_suffix() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}
