/**
 * REGISTRE DES ÉQUIPEMENTS - Catalogue immuable du parc
 *
 * RÔLE : Vue en lecture seule des équipements et groupes issus de la
 * configuration validée. Aucun verrou sur le chemin chaud : le registre
 * ne change plus après le chargement.
 */

use crate::config::{Device, Group, OceanConfig};
use crate::models::Target;
use serde::Serialize;
use std::collections::HashMap;

pub struct DeviceRegistry {
    devices: Vec<Device>,
    groups: Vec<Group>,
    by_id: HashMap<String, usize>,
    group_by_id: HashMap<String, usize>,
}

/// Instantané re-sérialisable des ensembles effectifs équipements/groupes.
#[derive(Debug, Serialize)]
pub struct RegistrySnapshot {
    pub devices: Vec<Device>,
    pub groups: Vec<Group>,
}

impl DeviceRegistry {
    /// Construit le registre depuis une configuration déjà validée.
    pub fn from_config(config: &OceanConfig) -> Self {
        let by_id = config
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        let group_by_id = config
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.id.clone(), i))
            .collect();
        Self {
            devices: config.devices.clone(),
            groups: config.groups.clone(),
            by_id,
            group_by_id,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.by_id.get(id).map(|&i| &self.devices[i])
    }

    pub fn all(&self) -> &[Device] {
        &self.devices
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.group_by_id.get(id).map(|&i| &self.groups[i])
    }

    /// Équipements membres d'un groupe, dans l'ordre du groupe.
    pub fn group_devices(&self, id: &str) -> Option<Vec<&Device>> {
        let group = self.group(id)?;
        Some(
            group
                .device_ids
                .iter()
                .filter_map(|device_id| self.get(device_id))
                .collect(),
        )
    }

    /// Résout une cible en liste d'équipements. `None` si la cible ne
    /// désigne rien de connu (équipement ou groupe absent).
    pub fn resolve(&self, target: &Target) -> Option<Vec<Device>> {
        match target {
            Target::Device(id) => self.get(id).map(|d| vec![d.clone()]),
            Target::Group(id) => self
                .group_devices(id)
                .map(|devices| devices.into_iter().cloned().collect()),
            Target::All => Some(self.devices.clone()),
        }
    }

    /// Identifiants résolus d'une cible (forme utilisée par le scheduler).
    pub fn ids_matching(&self, target: &Target) -> Option<Vec<String>> {
        self.resolve(target)
            .map(|devices| devices.into_iter().map(|d| d.id).collect())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Instantané des ensembles effectifs, pour export et pour la propriété
    /// de round-trip configuration -> snapshot -> configuration.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            devices: self.devices.clone(),
            groups: self.groups.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validate;

    fn registry() -> DeviceRegistry {
        let yaml = r#"
devices:
  - { id: "d1", name: "D1", type: "generic_tcp", host: "10.0.0.1" }
  - { id: "d2", name: "D2", type: "generic_tcp", host: "10.0.0.2", group_ids: ["g1"] }
  - { id: "d3", name: "D3", type: "generic_tcp", host: "10.0.0.3", group_ids: ["g1"] }
groups:
  - { id: "g1", name: "G1", device_ids: ["d3"] }
"#;
        let mut config: OceanConfig = serde_yaml::from_str(yaml).unwrap();
        validate(&mut config).unwrap();
        DeviceRegistry::from_config(&config)
    }

    #[test]
    fn resolves_all_target_forms() {
        let registry = registry();
        assert_eq!(
            registry.ids_matching(&Target::Device("d1".into())).unwrap(),
            vec!["d1"]
        );
        // ordre du groupe : membre déclaré côté groupe d'abord
        assert_eq!(
            registry.ids_matching(&Target::Group("g1".into())).unwrap(),
            vec!["d3", "d2"]
        );
        assert_eq!(registry.ids_matching(&Target::All).unwrap().len(), 3);
        assert!(registry.resolve(&Target::Device("ghost".into())).is_none());
        assert!(registry.resolve(&Target::Group("ghost".into())).is_none());
    }

    #[test]
    fn snapshot_round_trips_to_equal_sets() {
        let registry = registry();
        let snapshot = registry.snapshot();
        let yaml = serde_yaml::to_string(&snapshot).unwrap();
        let mut reloaded: OceanConfig = serde_yaml::from_str(&yaml).unwrap();
        validate(&mut reloaded).unwrap();
        let second = DeviceRegistry::from_config(&reloaded).snapshot();
        assert_eq!(snapshot.devices, second.devices);
        assert_eq!(snapshot.groups, second.groups);
    }
}
