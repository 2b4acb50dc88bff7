//! Shared passphrases.
//!
//! A passphrase is a sequence of words from a fixed 256-word list, so every
//! word carries exactly 8 bits. Matching is case-insensitive and tolerant of
//! extra whitespace; the normalized form is what both peers hash.
use std::fmt;

use rand::Rng;

use crate::BeamError;

/// Shortest passphrase accepted from a user.
pub const MIN_WORDS: usize = 4;

/// Length of generated passphrases.
pub const DEFAULT_WORDS: usize = 8;

/// Sorted word list. Lookups use binary search.
pub const WORDS: [&str; 256] = [
    "able", "acid", "acorn", "actor", "adult", "agent", "alarm", "album", "alert", "alley",
    "amber", "anchor", "angle", "ankle", "apple", "apron", "arena", "armor", "arrow", "atlas",
    "atom", "attic", "autumn", "avenue", "bacon", "badge", "bagel", "baker", "balloon",
    "bamboo", "banana", "banjo", "barrel", "basil", "basket", "battery", "beach", "beacon",
    "beard", "beaver", "bench", "berry", "bicycle", "binder", "birch", "biscuit", "blanket",
    "blossom", "board", "bonnet", "border", "bottle", "boulder", "bracket", "branch", "breeze",
    "brick", "bridge", "bronze", "brook", "broom", "bubble", "bucket", "buffalo", "bundle",
    "butter", "button", "cabin", "cactus", "camel", "candle", "canoe", "canyon", "carbon",
    "carpet", "carrot", "castle", "cedar", "cello", "chalk", "cherry", "chess", "chimney",
    "cider", "cinema", "circle", "citrus", "clover", "cobalt", "coffee", "comet", "compass",
    "copper", "coral", "correct", "cotton", "cradle", "crane", "crater", "cricket", "crystal",
    "cushion", "daisy", "delta", "desert", "diamond", "dolphin", "donkey", "dragon", "drum",
    "eagle", "echo", "eclipse", "elbow", "ember", "engine", "falcon", "feather", "fence",
    "ferry", "fiddle", "finch", "flame", "flannel", "flute", "forest", "fossil", "fountain",
    "fox", "garden", "garlic", "geyser", "ginger", "glacier", "glove", "goblet", "granite",
    "grape", "gravel", "guitar", "hammer", "harbor", "harvest", "hazel", "helmet", "heron",
    "hollow", "honey", "horizon", "horse", "iceberg", "island", "ivory", "jacket", "jaguar",
    "jasmine", "jelly", "jungle", "kayak", "kettle", "kitten", "ladder", "lagoon", "lantern",
    "lemon", "lentil", "lily", "linen", "lizard", "lobster", "locket", "lotus", "magnet",
    "mango", "maple", "marble", "meadow", "melon", "meteor", "mirror", "mitten", "monkey",
    "mosaic", "mountain", "muffin", "nectar", "needle", "nickel", "noodle", "nutmeg", "oasis",
    "ocean", "olive", "onion", "orbit", "orchid", "otter", "oyster", "paddle", "palace",
    "panda", "paper", "parrot", "pebble", "pencil", "pepper", "piano", "pillow", "pilot",
    "planet", "plum", "pocket", "pony", "potato", "pulley", "puzzle", "quartz", "quill",
    "rabbit", "radar", "radish", "raven", "ribbon", "river", "rocket", "saddle", "salmon",
    "sandal", "satin", "scarf", "shadow", "silver", "sketch", "spider", "spruce", "staple",
    "summit", "sunset", "swan", "thistle", "thunder", "tiger", "timber", "tomato", "tulip",
    "tundra", "turtle", "valley", "velvet", "violin", "walnut", "walrus", "willow", "window",
    "winter", "zebra",
];

/// The secret both peers derive every key and topic from.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Validate and normalize a user-supplied passphrase.
    pub fn parse(input: &str) -> Result<Self, BeamError> {
        let words: Vec<String> = input
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();

        if words.len() < MIN_WORDS {
            return Err(BeamError::InvalidSecret {
                reason: format!(
                    "expected at least {MIN_WORDS} words, got {}",
                    words.len()
                ),
            });
        }

        if let Some(unknown) = words.iter().find(|w| !is_word(w)) {
            return Err(BeamError::InvalidSecret {
                reason: format!("unknown word: {unknown}"),
            });
        }

        Ok(Self(words.join(" ")))
    }

    /// Generate a fresh random passphrase of `words` words.
    pub fn generate(words: usize) -> Self {
        let mut rng = rand::rng();
        let phrase: Vec<&str> = (0..words)
            .map(|_| WORDS[rng.random_range(0..WORDS.len())])
            .collect();
        Self(phrase.join(" "))
    }

    /// The normalized passphrase.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

fn is_word(word: &str) -> bool {
    WORDS.binary_search(&word).is_ok()
}

impl fmt::Display for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret({} words)", self.0.split(' ').count())
    }
}

impl std::str::FromStr for SharedSecret {
    type Err = BeamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
