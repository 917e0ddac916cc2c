//! The minigames that ship with the server.
//!
//! Each submodule exposes its prototypes as constants; [`standard_registry`] collects them
//! for the default layout.

pub mod click_race;
pub mod demo;
pub mod moles;
pub mod rps;

#[cfg(test)]
pub(crate) mod testing;

use crate::minigame::Registry;

/// Registry holding every bundled minigame.
pub fn standard_registry() -> Registry {
    Registry::new()
        .with(demo::SINGLE_PLAYER)
        .with(demo::ONE_VS_ONE)
        .with(demo::TWO_VS_TWO)
        .with(rps::PROTOTYPE)
        .with(moles::PROTOTYPE)
        .with(click_race::SINGLE_PLAYER)
        .with(click_race::ONE_VS_ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_names() {
        let registry = standard_registry();

        for name in [
            "demo_minigame_sp",
            "demo_minigame_1v1",
            "demo_minigame_2v2",
            "rps_1v1",
            "whack_a_mole",
            "cps_race_sp",
            "cps_race_1v1",
        ] {
            assert!(registry.get(name).is_some(), "{} missing", name);
        }

        assert_eq!(registry.len(), 7);
    }
}
