//! Per-player permissions.
//!
//! A granted permission matches a requested one when it is `*`, equal to
//! it, or a `prefix.*` wildcard covering it.

use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct PermissionManager {
    players: AHashMap<String, AHashSet<String>>,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(permissions: &BTreeMap<String, Vec<String>>) -> Self {
        let mut manager = Self::new();
        for (player, granted) in permissions {
            for permission in granted {
                manager.grant(player, permission);
            }
        }
        manager
    }

    pub fn grant(&mut self, player: &str, permission: &str) {
        self.players
            .entry(player.to_lowercase())
            .or_default()
            .insert(permission.to_lowercase());
    }

    pub fn revoke(&mut self, player: &str, permission: &str) {
        if let Some(granted) = self.players.get_mut(&player.to_lowercase()) {
            granted.remove(&permission.to_lowercase());
        }
    }

    pub fn has_permission(&self, player: &str, permission: &str) -> bool {
        let requested = permission.to_lowercase();
        self.players
            .get(&player.to_lowercase())
            .is_some_and(|granted| granted.iter().any(|g| matches(g, &requested)))
    }
}

fn matches(granted: &str, requested: &str) -> bool {
    if granted == "*" || granted == requested {
        return true;
    }
    match granted.strip_suffix(".*") {
        Some(base) => requested
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}
