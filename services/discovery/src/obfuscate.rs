//! Deterministic per-process pseudonyms.
//!
//! Two memoized maps: service names become two-word slugs, numeric muxes
//! become port-shaped integers and non-numeric muxes become slugs. The same
//! input always yields the same pseudonym within one process, and generated
//! pseudonyms never collide with each other.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;

const ADJECTIVES: [&str; 32] = [
    "amber", "ancient", "bold", "brisk", "calm", "cobalt", "crimson", "dapper", "dusty", "eager",
    "fabled", "gentle", "gilded", "hidden", "humble", "ivory", "jolly", "keen", "lunar", "mellow",
    "nimble", "opal", "plucky", "quiet", "rustic", "silent", "swift", "tidal", "umber", "velvet",
    "wandering", "zesty",
];

const NOUNS: [&str; 32] = [
    "anchor", "badger", "beacon", "canyon", "cedar", "comet", "cricket", "delta", "ember", "falcon",
    "fjord", "garnet", "harbor", "heron", "isle", "jackal", "kestrel", "lagoon", "marmot", "nebula",
    "orchid", "osprey", "pebble", "quarry", "raven", "sparrow", "summit", "thicket", "tundra",
    "walrus", "willow", "zephyr",
];

#[derive(Default)]
pub struct Obfuscator {
    service_names: Mutex<HashMap<String, String>>,
    protocol_muxes: Mutex<HashMap<String, String>>,
}

impl Obfuscator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pseudonym for a service name: a stable two-word slug.
    pub fn service_name(&self, name: &str) -> String {
        let mut map = self.service_names.lock();
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        let slug = fresh(&map, two_word_slug);
        map.insert(name.to_string(), slug.clone());
        slug
    }

    /// Pseudonym for a mux: numeric muxes stay port-shaped, anything else
    /// becomes a slug.
    pub fn protocol_mux(&self, mux: &str) -> String {
        let mut map = self.protocol_muxes.lock();
        if let Some(existing) = map.get(mux) {
            return existing.clone();
        }
        let generator = if mux.chars().all(|c| c.is_ascii_digit()) && !mux.is_empty() {
            random_port
        } else {
            two_word_slug
        };
        let pseudonym = fresh(&map, generator);
        map.insert(mux.to_string(), pseudonym.clone());
        pseudonym
    }
}

fn fresh(taken: &HashMap<String, String>, generate: fn() -> String) -> String {
    loop {
        let candidate = generate();
        if !taken.values().any(|v| *v == candidate) {
            return candidate;
        }
    }
}

fn two_word_slug() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adjective}-{noun}")
}

fn random_port() -> String {
    rand::thread_rng().gen_range(1024u16..=65535).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_are_memoized() {
        let obfuscator = Obfuscator::new();
        let first = obfuscator.service_name("payments");
        let second = obfuscator.service_name("payments");
        assert_eq!(first, second);
        assert_ne!(first, "payments");
        assert!(first.contains('-'));
    }

    #[test]
    fn distinct_inputs_get_distinct_pseudonyms() {
        let obfuscator = Obfuscator::new();
        let a = obfuscator.service_name("payments");
        let b = obfuscator.service_name("billing");
        assert_ne!(a, b);
    }

    #[test]
    fn numeric_muxes_stay_port_shaped() {
        let obfuscator = Obfuscator::new();
        let mux = obfuscator.protocol_mux("8080");
        assert_eq!(mux, obfuscator.protocol_mux("8080"));
        let port: u16 = mux.parse().expect("port-shaped");
        assert!(port >= 1024);
    }

    #[test]
    fn textual_muxes_become_slugs() {
        let obfuscator = Obfuscator::new();
        let mux = obfuscator.protocol_mux("nsq:orders");
        assert_eq!(mux, obfuscator.protocol_mux("nsq:orders"));
        assert!(mux.contains('-'));
        assert!(mux.parse::<u64>().is_err());
    }
}
