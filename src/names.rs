//! Human-readable random names for rooms and anonymous users.

use rand::seq::IndexedRandom;

const NAMES: &[&str] = &[
    "ada", "alan", "barbara", "bjarne", "dennis", "donald", "edsger", "frances", "grace",
    "guido", "john", "ken", "linus", "margaret", "niklaus", "radia", "robin", "tony",
];

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively",
    "lucky", "mighty", "nimble", "proud", "quick", "quiet", "shy", "swift", "witty", "zany",
];

const COLORS: &[&str] = &[
    "amber", "azure", "coral", "crimson", "cyan", "golden", "green", "indigo", "ivory", "lilac",
    "magenta", "olive", "orange", "pink", "plum", "scarlet", "silver", "teal", "violet", "white",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "crab", "crow", "dingo", "eagle", "ferret", "gecko", "heron", "koala",
    "lemur", "lynx", "moose", "otter", "owl", "panda", "puffin", "seal", "tapir", "wombat",
];

const NOUNS: &[&str] = &[
    "Badger", "Comet", "Falcon", "Fox", "Gecko", "Heron", "Koala", "Lynx", "Meteor", "Otter",
    "Panda", "Pixel", "Puffin", "Quasar", "Raven", "Rocket", "Tiger", "Walrus", "Wombat",
];

/// Longest generated display name.
pub const MAX_USERNAME_LEN: usize = 20;

fn pick(words: &'static [&'static str]) -> &'static str {
    words.choose(&mut rand::rng()).copied().unwrap_or_default()
}

/// `<name>-the-<adjective>-<color>-<animal>`
pub fn room_name() -> String {
    format!(
        "{}-the-{}-{}-{}",
        pick(NAMES),
        pick(ADJECTIVES),
        pick(COLORS),
        pick(ANIMALS)
    )
}

/// `AdjectiveNoun`, at most [`MAX_USERNAME_LEN`] characters.
pub fn username() -> String {
    let mut name = capitalize(pick(ADJECTIVES));
    name.push_str(pick(NOUNS));
    name.truncate(MAX_USERNAME_LEN);
    name
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
