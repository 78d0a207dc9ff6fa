//! Character class stat table and level scaling.

/// Static per-class numbers at level 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub base_health: u32,
    pub base_damage: u32,
    pub special_base_damage: u32,
    pub special_charge_damage: u32,
}

/// Derived combat stats of a character at a level, computed once at join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombatStats {
    pub max_health: u32,
    pub base_damage: u32,
    pub special_damage: u32,
    pub max_super_charge: u32,
}

pub const DEFAULT_CHARACTER: &str = "ninja";

const HEALTH_PER_LEVEL: u32 = 500;
const DAMAGE_PER_LEVEL: u32 = 100;
const SPECIAL_DAMAGE_PER_LEVEL: u32 = 200;

const FALLBACK: CombatStats = CombatStats {
    max_health: 100,
    base_damage: 100,
    special_damage: 200,
    max_super_charge: 3000,
};

pub fn class_stats(character: &str) -> Option<ClassStats> {
    let stats = match character {
        "ninja" => ClassStats {
            base_health: 7000,
            base_damage: 1500,
            special_base_damage: 2000,
            special_charge_damage: 4500,
        },
        "thorg" => ClassStats {
            base_health: 13000,
            base_damage: 1500,
            special_base_damage: 2800,
            special_charge_damage: 4500,
        },
        "draven" => ClassStats {
            base_health: 6500,
            base_damage: 2500,
            special_base_damage: 2400,
            special_charge_damage: 5000,
        },
        "wizard" => ClassStats {
            base_health: 5000,
            base_damage: 3000,
            special_base_damage: 8000,
            special_charge_damage: 6000,
        },
        _ => return None,
    };
    Some(stats)
}

/// Computes derived stats; levels below 1 count as 1 and unknown classes get
/// a small fallback profile.
pub fn compute_stats(character: &str, level: u32) -> CombatStats {
    let Some(class) = class_stats(character) else {
        return FALLBACK;
    };
    let steps = level.max(1) - 1;
    CombatStats {
        max_health: class
            .base_health
            .saturating_add(steps.saturating_mul(HEALTH_PER_LEVEL))
            .max(1),
        base_damage: class
            .base_damage
            .saturating_add(steps.saturating_mul(DAMAGE_PER_LEVEL)),
        special_damage: class
            .special_base_damage
            .saturating_add(steps.saturating_mul(SPECIAL_DAMAGE_PER_LEVEL)),
        max_super_charge: class.special_charge_damage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_one_ninja() {
        let stats = compute_stats("ninja", 1);
        assert_eq!(stats.max_health, 7000);
        assert_eq!(stats.base_damage, 1500);
        assert_eq!(stats.special_damage, 2000);
        assert_eq!(stats.max_super_charge, 4500);
    }

    #[test]
    fn test_level_scaling() {
        let stats = compute_stats("wizard", 3);
        assert_eq!(stats.max_health, 5000 + 2 * 500);
        assert_eq!(stats.base_damage, 3000 + 2 * 100);
        assert_eq!(stats.special_damage, 8000 + 2 * 200);
        assert_eq!(stats.max_super_charge, 6000);
    }

    #[test]
    fn test_level_zero_is_treated_as_one() {
        assert_eq!(compute_stats("thorg", 0), compute_stats("thorg", 1));
    }

    #[test]
    fn test_absurd_level_saturates() {
        let stats = compute_stats("ninja", u32::MAX);
        assert_eq!(stats.max_health, u32::MAX);
        assert_eq!(stats.base_damage, u32::MAX);
        assert_eq!(stats.special_damage, u32::MAX);
        assert_eq!(stats.max_super_charge, 4500);
    }

    #[test]
    fn test_unknown_class_falls_back() {
        let stats = compute_stats("pirate", 4);
        assert_eq!(stats, FALLBACK);
        assert!(class_stats("pirate").is_none());
        assert!(class_stats(DEFAULT_CHARACTER).is_some());
    }
}
