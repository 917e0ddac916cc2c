use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Wall-clock timestamp in milliseconds, used for analytics records
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Four random decimal digits
pub fn random_lobby_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..4)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

const USERNAMES: &[&str] = &[
    "Albatross", "Anchovy", "Axolotl", "Barnacle", "Beluga", "Blowfish", "Capelin", "Clownfish",
    "Cockle", "Coral", "Cormorant", "Crab", "Cuttlefish", "Dolphin", "Dugong", "Eel", "Gannet",
    "Grouper", "Guillemot", "Haddock", "Halibut", "Herring", "Jellyfish", "Kelp", "Kittiwake",
    "Krill", "Limpet", "Lobster", "Mackerel", "Manatee", "Marlin", "Minnow", "Mussel",
    "Narwhal", "Nautilus", "Octopus", "Orca", "Otter", "Oyster", "Pelican", "Penguin", "Petrel",
    "Pilchard", "Plaice", "Porpoise", "Prawn", "Puffin", "Ray", "Sailfish", "Salmon", "Sardine",
    "Scallop", "Seahorse", "Seal", "Shrimp", "Skua", "Squid", "Starfish", "Stingray", "Sturgeon",
    "Swordfish", "Tern", "Triggerfish", "Tuna", "Turbot", "Urchin", "Walrus", "Whelk",
];

// Picks a name not present in `taken`, falling back to a numbered name once the list runs out
pub fn random_username<R, F>(rng: &mut R, is_taken: F) -> String
where
    R: Rng + ?Sized,
    F: Fn(&str) -> bool,
{
    let free: Vec<&str> = USERNAMES.iter().copied().filter(|n| !is_taken(n)).collect();

    if let Some(name) = free.choose(rng) {
        return name.to_string();
    }

    (2..)
        .map(|n| format!("{}{}", USERNAMES[0], n))
        .find(|name| !is_taken(name))
        .unwrap_or_default()
}
