//! Display names for new projects: two random words in kebab case.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "bright", "calm", "clever", "cosmic", "crisp", "dusty", "eager", "fancy",
    "fluffy", "gentle", "golden", "happy", "hidden", "jolly", "lively", "lucky", "mellow",
    "misty", "nimble", "noble", "odd", "proud", "quiet", "rapid", "rosy", "shiny", "silent",
    "silly", "sleepy", "snowy", "sunny", "swift", "tidy", "tiny", "vivid", "warm", "wild",
    "witty",
];

const NOUNS: &[&str] = &[
    "apple", "badger", "biscuit", "breeze", "canyon", "cloud", "comet", "cookie", "crane",
    "dune", "falcon", "fern", "forest", "garden", "harbor", "island", "kettle", "lantern",
    "maple", "meadow", "muffin", "ocean", "otter", "panda", "pebble", "pepper", "pine",
    "planet", "puffin", "river", "rocket", "sparrow", "spruce", "summit", "teapot", "tiger",
    "valley", "walrus", "willow", "yak",
];

/// Generate a slug like `fluffy-otter` using the given random source.
pub fn generate_slug_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    // Both lists are non-empty constants.
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
    format!("{}-{}", adjective, noun)
}

pub fn generate_slug() -> String {
    generate_slug_with(&mut rand::thread_rng())
}
